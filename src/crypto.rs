//! X25519 key agreement, NaCl-compatible secretbox AEAD, and HMAC-SHA256,
//! grounded on the key-agreement/AEAD shape in `pairing.rs` (X25519 +
//! `diffie_hellman` + symmetric AEAD) but using the lock's actual primitives
//! (`crypto_box_beforenm` derivation, XSalsa20-Poly1305, not AES-GCM/HKDF).

use crypto_box::aead::{Aead, AeadCore, KeyInit};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::error::CodecError;

type HmacSha256 = Hmac<Sha256>;

/// Generates a fresh X25519 keypair for the bridge side of a pairing.
pub fn generate_keypair() -> ([u8; 32], [u8; 32]) {
    let secret = SecretKey::generate(&mut OsRng);
    let public = secret.public_key();
    (*public.as_bytes(), secret.to_bytes())
}

/// `crypto_box_beforenm(lock_public_key, bridge_secret_key)`: the shared key
/// used for both pairing-phase HMAC and the service-characteristic secretbox,
/// derived once per device and cached on [`crate::device::Device`].
pub fn shared_key(lock_public_key: &[u8; 32], bridge_secret_key: &[u8; 32]) -> [u8; 32] {
    let secret = SecretKey::from(*bridge_secret_key);
    let public = PublicKey::from(*lock_public_key);
    let b = SalsaBox::new(&public, &secret);
    *b.as_ref()
}

/// HMAC-SHA256 over `message`, keyed by the shared secret, used to compute
/// `AUTH_AUTHENTICATOR` challenge/response values in pairing.
pub fn hmac_sha256(key: &[u8; 32], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("any length key is valid for HMAC");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

pub fn hmac_verify(key: &[u8; 32], message: &[u8], tag: &[u8; 32]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("any length key is valid for HMAC");
    mac.update(message);
    mac.verify_slice(tag).is_ok()
}

/// Seals `plaintext` with XSalsa20-Poly1305 under `shared_key`, returning the
/// 24-byte nonce and ciphertext-with-tag separately, as the encrypted service
/// frame wire layout requires (§4 `codec`).
pub fn seal(shared_key: &[u8; 32], plaintext: &[u8]) -> ([u8; 24], Vec<u8>) {
    let b = SalsaBox::new_precomputed(shared_key.into());
    let nonce = SalsaBox::generate_nonce(&mut OsRng);
    let ciphertext = b
        .encrypt(&nonce, plaintext)
        .expect("encryption over a bounded plaintext never fails");
    (nonce.into(), ciphertext)
}

/// Opens a secretbox sealed with [`seal`]. Returns [`CodecError::AeadFailure`]
/// on authentication failure, never panicking on attacker-controlled input.
pub fn open(
    shared_key: &[u8; 32],
    nonce: &[u8; 24],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let b = SalsaBox::new_precomputed(shared_key.into());
    b.decrypt(nonce.into(), ciphertext)
        .map_err(|_| CodecError::AeadFailure)
}

/// A cryptographically random 32-byte value, used for the pairing challenge
/// nonces sent by `CHALLENGE`.
pub fn random_nonce32() -> [u8; 32] {
    use rand::RngCore;
    let mut buf = [0u8; 32];
    OsRng.fill_bytes(&mut buf);
    buf
}
