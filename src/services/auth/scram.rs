//! Key derivation for the device login handshake
//!
//! The device speaks a SCRAM-SHA-256 style exchange: both sides derive the
//! same key material from the password, salt and iteration count, the client
//! proves knowledge of it without sending it and finally hands over the
//! session token encrypted with a key bound to the whole exchange.

use crate::error::{Error, Result};
use aes_gcm::{
    AesGcm, KeyInit, Nonce,
    aead::{Aead, consts::U16},
    aes::Aes256,
};
use base64::{Engine, prelude::BASE64_STANDARD};
use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;
type Aes256Gcm16 = AesGcm<Aes256, U16>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

const CLIENT_NONCE_LETTERS: usize = 12;
const ASCII_LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// HMAC-SHA256 over the concatenation of `parts`
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; KEY_LEN]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::authentication(format!("failed to create hmac: {e}")))?;
    for part in parts {
        mac.update(part);
    }

    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Fresh client nonce: random ASCII letters, base64 encoded
pub fn client_nonce() -> String {
    let mut rng = rand::thread_rng();
    let letters: String = (0..CLIENT_NONCE_LETTERS)
        .map(|_| ASCII_LETTERS[rng.gen_range(0..ASCII_LETTERS.len())] as char)
        .collect();

    BASE64_STANDARD.encode(letters)
}

pub fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Canonical message both sides sign
///
/// `salt` is passed exactly as received from the device (base64).
pub fn auth_message(
    username: &str,
    client_nonce: &str,
    server_nonce: &str,
    salt: &str,
    rounds: u32,
) -> String {
    format!(
        "n={username},r={client_nonce},r={server_nonce},s={salt},i={rounds},c=biws,r={server_nonce}"
    )
}

/// Key material derived from the password
pub struct HandshakeKeys {
    client_key: [u8; KEY_LEN],
    server_key: [u8; KEY_LEN],
    stored_key: [u8; KEY_LEN],
}

impl HandshakeKeys {
    pub fn derive(password: &str, salt: &[u8], rounds: u32) -> Result<Self> {
        let mut salted_password = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, &mut salted_password);

        let client_key = hmac_sha256(&salted_password, &[b"Client Key".as_slice()])?;
        let server_key = hmac_sha256(&salted_password, &[b"Server Key".as_slice()])?;
        let mut stored_key = [0u8; KEY_LEN];
        stored_key.copy_from_slice(&Sha256::digest(client_key));

        Ok(Self {
            client_key,
            server_key,
            stored_key,
        })
    }

    pub fn client_key(&self) -> &[u8; KEY_LEN] {
        &self.client_key
    }

    pub fn stored_key(&self) -> &[u8; KEY_LEN] {
        &self.stored_key
    }

    /// `client_key XOR HMAC(stored_key, auth_message)`
    pub fn client_proof(&self, auth_message: &str) -> Result<[u8; KEY_LEN]> {
        let client_signature = hmac_sha256(&self.stored_key, &[auth_message.as_bytes()])?;
        Ok(xor(&self.client_key, &client_signature))
    }

    pub fn server_signature(&self, auth_message: &str) -> Result<[u8; KEY_LEN]> {
        hmac_sha256(&self.server_key, &[auth_message.as_bytes()])
    }

    /// Constant-time comparison of the signature returned by the device
    pub fn verify_server_signature(&self, auth_message: &str, signature: &[u8]) -> Result<bool> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.server_key)
            .map_err(|e| Error::authentication(format!("failed to create hmac: {e}")))?;
        mac.update(auth_message.as_bytes());

        Ok(mac.verify_slice(signature).is_ok())
    }

    /// `HMAC(stored_key, "Session Key" || auth_message || client_key)`
    pub fn session_key(&self, auth_message: &str) -> Result<[u8; KEY_LEN]> {
        hmac_sha256(
            &self.stored_key,
            &[
                b"Session Key".as_slice(),
                auth_message.as_bytes(),
                self.client_key.as_slice(),
            ],
        )
    }
}

pub fn xor(a: &[u8; KEY_LEN], b: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// Encrypted session token as expected by `/auth/create_session`
pub struct SealedToken {
    pub payload: Vec<u8>,
    pub tag: Vec<u8>,
}

/// AES-256-GCM with a 16 byte IV; the tag is split off the ciphertext
pub fn encrypt_token(
    session_key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    token: &str,
) -> Result<SealedToken> {
    let cipher = Aes256Gcm16::new_from_slice(session_key)
        .map_err(|e| Error::authentication(format!("failed to create cipher: {e}")))?;

    let mut payload = cipher
        .encrypt(Nonce::<U16>::from_slice(iv), token.as_bytes())
        .map_err(|e| Error::authentication(format!("failed to encrypt session token: {e}")))?;
    let tag = payload.split_off(payload.len() - TAG_LEN);

    Ok(SealedToken { payload, tag })
}

/// Inverse of [`encrypt_token`], used by the device side of the exchange
pub fn decrypt_token(
    session_key: &[u8; KEY_LEN],
    iv: &[u8],
    payload: &[u8],
    tag: &[u8],
) -> Result<String> {
    if iv.len() != IV_LEN {
        return Err(Error::protocol(format!("invalid iv length {}", iv.len())));
    }

    let cipher = Aes256Gcm16::new_from_slice(session_key)
        .map_err(|e| Error::authentication(format!("failed to create cipher: {e}")))?;

    let mut sealed = payload.to_vec();
    sealed.extend_from_slice(tag);

    let token = cipher
        .decrypt(Nonce::<U16>::from_slice(iv), sealed.as_slice())
        .map_err(|e| Error::authentication(format!("failed to decrypt session token: {e}")))?;

    String::from_utf8(token).map_err(|e| Error::protocol(format!("invalid session token: {e}")))
}
