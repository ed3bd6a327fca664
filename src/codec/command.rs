//! Command code table (§4.1). Codes are bit-exact wire values, not an
//! internal convenience numbering.

use crate::error::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    RequestData,
    PublicKey,
    Challenge,
    AuthAuthenticator,
    AuthData,
    AuthId,
    KeyturnerStates,
    LockAction,
    Status,
    ErrorReport,
    RequestConfig,
    Config,
    AuthIdConfirm,
}

impl Command {
    pub const fn code(self) -> u16 {
        match self {
            Command::RequestData => 0x0001,
            Command::PublicKey => 0x0003,
            Command::Challenge => 0x0004,
            Command::AuthAuthenticator => 0x0005,
            Command::AuthData => 0x0006,
            Command::AuthId => 0x0007,
            Command::KeyturnerStates => 0x000C,
            Command::LockAction => 0x000D,
            Command::Status => 0x000E,
            Command::ErrorReport => 0x0012,
            Command::RequestConfig => 0x0014,
            Command::Config => 0x0015,
            Command::AuthIdConfirm => 0x001E,
        }
    }

    pub fn from_code(code: u16) -> Result<Self, CodecError> {
        Ok(match code {
            0x0001 => Command::RequestData,
            0x0003 => Command::PublicKey,
            0x0004 => Command::Challenge,
            0x0005 => Command::AuthAuthenticator,
            0x0006 => Command::AuthData,
            0x0007 => Command::AuthId,
            0x000C => Command::KeyturnerStates,
            0x000D => Command::LockAction,
            0x000E => Command::Status,
            0x0012 => Command::ErrorReport,
            0x0014 => Command::RequestConfig,
            0x0015 => Command::Config,
            0x001E => Command::AuthIdConfirm,
            other => return Err(CodecError::UnknownCommand(other)),
        })
    }
}

/// A `LOCK_ACTION` action byte (§4.3b). Values are the ones the lock accepts
/// verbatim in the `LOCK_ACTION` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAction {
    Unlock,
    Lock,
    Unlatch,
    LockNGo,
    LockNGoUnlatch,
    FullLock,
    FobAction1,
    FobAction2,
    FobAction3,
}

impl LockAction {
    pub const fn byte(self) -> u8 {
        match self {
            LockAction::Unlock => 0x01,
            LockAction::Lock => 0x02,
            LockAction::Unlatch => 0x03,
            LockAction::LockNGo => 0x04,
            LockAction::LockNGoUnlatch => 0x05,
            LockAction::FullLock => 0x06,
            LockAction::FobAction1 => 0x81,
            LockAction::FobAction2 => 0x82,
            LockAction::FobAction3 => 0x83,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Command::RequestData, 0x0001)]
    #[case(Command::PublicKey, 0x0003)]
    #[case(Command::Challenge, 0x0004)]
    #[case(Command::AuthAuthenticator, 0x0005)]
    #[case(Command::AuthData, 0x0006)]
    #[case(Command::AuthId, 0x0007)]
    #[case(Command::KeyturnerStates, 0x000C)]
    #[case(Command::LockAction, 0x000D)]
    #[case(Command::Status, 0x000E)]
    #[case(Command::ErrorReport, 0x0012)]
    #[case(Command::RequestConfig, 0x0014)]
    #[case(Command::Config, 0x0015)]
    #[case(Command::AuthIdConfirm, 0x001E)]
    fn code_roundtrips(#[case] cmd: Command, #[case] code: u16) {
        assert_eq!(cmd.code(), code);
        assert_eq!(Command::from_code(code).unwrap(), cmd);
    }

    #[test]
    fn unknown_code_errors() {
        assert!(matches!(
            Command::from_code(0xBEEF),
            Err(CodecError::UnknownCommand(0xBEEF))
        ));
    }
}
