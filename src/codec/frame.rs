//! Frame/unframe and CRC-16/XMODEM (§4.1), the closest analogue in the pack
//! being `lorawan_codec.rs`'s folding checksum helper — same shape, different
//! polynomial and width.

use crate::error::CodecError;

const CRC_ALGO: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);

pub fn crc16(data: &[u8]) -> u16 {
    CRC_ALGO.checksum(data)
}

/// Minimum length of an unencrypted frame: 2-byte command + 2-byte CRC.
const MIN_UNENCRYPTED_LEN: usize = 4;

/// Encodes an unencrypted pairing-channel frame: `cmd(2 LE) || payload || crc16(2 LE)`.
pub fn encode_unencrypted(cmd: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + payload.len() + 2);
    buf.extend_from_slice(&cmd.to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = crc16(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Decodes an unencrypted frame, returning `(cmd, payload)`.
pub fn decode_unencrypted(frame: &[u8]) -> Result<(u16, &[u8]), CodecError> {
    if frame.len() < MIN_UNENCRYPTED_LEN {
        return Err(CodecError::ShortFrame {
            min: MIN_UNENCRYPTED_LEN,
            got: frame.len(),
        });
    }
    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let expected = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed = crc16(body);
    if expected != computed {
        return Err(CodecError::CrcMismatch { expected, computed });
    }
    let cmd = u16::from_le_bytes([body[0], body[1]]);
    let payload = &body[2..];
    Ok((cmd, payload))
}

/// Minimum length of an encrypted frame: 24-byte nonce + 4-byte auth_id + 2-byte ctlen.
const MIN_ENCRYPTED_LEN: usize = 24 + 4 + 2;

/// Encodes an encrypted service-channel frame. `cmd`/`payload` are sealed
/// along with `auth_id` and a CRC over `auth_id||cmd||payload`, per §4.1.
pub fn encode_encrypted(shared_key: &[u8; 32], auth_id: [u8; 4], cmd: u16, payload: &[u8]) -> Vec<u8> {
    let mut plaintext = Vec::with_capacity(4 + 2 + payload.len() + 2);
    plaintext.extend_from_slice(&auth_id);
    plaintext.extend_from_slice(&cmd.to_le_bytes());
    plaintext.extend_from_slice(payload);
    let crc = crc16(&plaintext);
    plaintext.extend_from_slice(&crc.to_le_bytes());

    let (nonce, ciphertext) = crate::crypto::seal(shared_key, &plaintext);

    let mut frame = Vec::with_capacity(24 + 4 + 2 + ciphertext.len());
    frame.extend_from_slice(&nonce);
    frame.extend_from_slice(&auth_id);
    frame.extend_from_slice(&(ciphertext.len() as u16).to_le_bytes());
    frame.extend_from_slice(&ciphertext);
    frame
}

/// Decodes an encrypted frame, returning `(auth_id, cmd, payload)`. The AEAD
/// tag covers the whole plaintext, so the inner CRC is defense in depth: it is
/// checked but an AEAD failure is reported first since it is the stronger
/// signal of tampering.
pub fn decode_encrypted(
    shared_key: &[u8; 32],
    frame: &[u8],
) -> Result<([u8; 4], u16, Vec<u8>), CodecError> {
    if frame.len() < MIN_ENCRYPTED_LEN {
        return Err(CodecError::ShortFrame {
            min: MIN_ENCRYPTED_LEN,
            got: frame.len(),
        });
    }
    let mut nonce = [0u8; 24];
    nonce.copy_from_slice(&frame[0..24]);
    let mut auth_id = [0u8; 4];
    auth_id.copy_from_slice(&frame[24..28]);
    let ctlen = u16::from_le_bytes([frame[28], frame[29]]) as usize;
    let ciphertext = &frame[30..];
    if ciphertext.len() != ctlen {
        return Err(CodecError::TruncatedPayload {
            command: 0,
            need: ctlen,
            have: ciphertext.len(),
        });
    }

    let plaintext = crate::crypto::open(shared_key, &nonce, ciphertext)?;
    if plaintext.len() < 4 + 2 + 2 {
        return Err(CodecError::ShortFrame {
            min: 8,
            got: plaintext.len(),
        });
    }
    let (body, crc_bytes) = plaintext.split_at(plaintext.len() - 2);
    let expected = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed = crc16(body);
    if expected != computed {
        return Err(CodecError::CrcMismatch { expected, computed });
    }
    let inner_auth_id = &body[0..4];
    if inner_auth_id != auth_id {
        return Err(CodecError::AeadFailure);
    }
    let cmd = u16::from_le_bytes([body[4], body[5]]);
    let payload = body[6..].to_vec();
    Ok((auth_id, cmd, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    #[test]
    fn crc16_matches_known_vector() {
        // "123456789" -> 0x31C3 is the standard XMODEM test vector.
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn unencrypted_roundtrip() {
        let frame = encode_unencrypted(0x0003, &[0xAA; 32]);
        let (cmd, payload) = decode_unencrypted(&frame).unwrap();
        assert_eq!(cmd, 0x0003);
        assert_eq!(payload, &[0xAA; 32][..]);
    }

    #[test]
    fn unencrypted_tamper_causes_crc_mismatch() {
        let mut frame = encode_unencrypted(0x0003, &[0xAA; 32]);
        frame[5] ^= 0x01;
        assert!(matches!(
            decode_unencrypted(&frame),
            Err(CodecError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn unencrypted_short_frame_errors() {
        assert!(matches!(
            decode_unencrypted(&[0x01, 0x00]),
            Err(CodecError::ShortFrame { .. })
        ));
    }

    #[test]
    fn encrypted_roundtrip() {
        let (_pk, sk) = crypto::generate_keypair();
        let key = crypto::shared_key(&crypto::generate_keypair().0, &sk);
        let auth_id = [1, 2, 3, 4];
        let frame = encode_encrypted(&key, auth_id, 0x000D, &[9, 9, 9]);
        let (got_auth, cmd, payload) = decode_encrypted(&key, &frame).unwrap();
        assert_eq!(got_auth, auth_id);
        assert_eq!(cmd, 0x000D);
        assert_eq!(payload, vec![9, 9, 9]);
    }

    #[test]
    fn encrypted_tamper_causes_aead_failure() {
        let (_pk, sk) = crypto::generate_keypair();
        let key = crypto::shared_key(&crypto::generate_keypair().0, &sk);
        let mut frame = encode_encrypted(&key, [1, 2, 3, 4], 0x000D, &[9, 9, 9]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            decode_encrypted(&key, &frame),
            Err(CodecError::AeadFailure)
        ));
    }

    #[test]
    fn encrypted_tamper_on_nonce_causes_aead_failure() {
        let (_pk, sk) = crypto::generate_keypair();
        let key = crypto::shared_key(&crypto::generate_keypair().0, &sk);
        let mut frame = encode_encrypted(&key, [1, 2, 3, 4], 0x000D, &[9, 9, 9]);
        frame[0] ^= 0xFF;
        assert!(matches!(
            decode_encrypted(&key, &frame),
            Err(CodecError::AeadFailure)
        ));
    }
}
