//! Detached commit signatures in the SSHSIG format understood by Git's
//! `gpg.format=ssh` verification.

use crate::config::SigningConfig;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signer, SigningKey};
use pkcs8::DecodePrivateKey;
use secrecy::ExposeSecret;
use sha2::{Digest, Sha512};
use thiserror::Error;

const MAGIC_PREAMBLE: &[u8] = b"SSHSIG";
const SIG_VERSION: u32 = 1;
const NAMESPACE: &str = "git";
const HASH_ALGORITHM: &str = "sha512";
const KEY_TYPE: &str = "ssh-ed25519";
const ARMOR_BEGIN: &str = "-----BEGIN SSH SIGNATURE-----";
const ARMOR_END: &str = "-----END SSH SIGNATURE-----";
const ARMOR_WIDTH: usize = 70;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SigningError {
    #[error("Signing is enabled but no private key is configured")]
    MissingKey,

    #[error("Signing requires an explicit commit author")]
    MissingAuthor,

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    #[error("Failed to sign payload: {0}")]
    Signature(String),
}

fn put_string(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Ed25519 commit signer.
pub struct CommitSigner {
    key: SigningKey,
}

impl CommitSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Loads an armored PKCS#8 key, decrypting it when a passphrase is given.
    pub fn from_pem(pem: &str, passphrase: Option<&str>) -> Result<Self, SigningError> {
        let key = match passphrase {
            Some(passphrase) => SigningKey::from_pkcs8_encrypted_pem(pem, passphrase),
            None => SigningKey::from_pkcs8_pem(pem),
        }
        .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        Ok(Self::new(key))
    }

    /// `Ok(None)` when signing is disabled.
    pub fn from_config(config: &SigningConfig) -> Result<Option<Self>, SigningError> {
        if !config.enabled {
            return Ok(None);
        }
        if config.author.is_none() {
            return Err(SigningError::MissingAuthor);
        }
        let pem = config.private_key.as_ref().ok_or(SigningError::MissingKey)?;
        let passphrase = config.passphrase.as_ref().map(|p| p.expose_secret().as_str());
        Self::from_pem(pem.expose_secret(), passphrase).map(Some)
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut blob = Vec::new();
        put_string(&mut blob, KEY_TYPE.as_bytes());
        put_string(&mut blob, self.key.verifying_key().as_bytes());
        blob
    }

    /// `ssh-ed25519 AAAA...` line to register with the remote.
    pub fn public_key_openssh(&self) -> String {
        format!("{} {}", KEY_TYPE, STANDARD.encode(self.public_key_blob()))
    }

    /// Armored detached signature over `payload`.
    pub fn sign(&self, payload: &[u8]) -> Result<String, SigningError> {
        let signed = signed_data(payload);
        let signature = self
            .key
            .try_sign(&signed)
            .map_err(|e| SigningError::Signature(e.to_string()))?;

        let mut sig_blob = Vec::new();
        put_string(&mut sig_blob, KEY_TYPE.as_bytes());
        put_string(&mut sig_blob, &signature.to_bytes());

        let mut blob = Vec::from(MAGIC_PREAMBLE);
        blob.extend_from_slice(&SIG_VERSION.to_be_bytes());
        put_string(&mut blob, &self.public_key_blob());
        put_string(&mut blob, NAMESPACE.as_bytes());
        put_string(&mut blob, b"");
        put_string(&mut blob, HASH_ALGORITHM.as_bytes());
        put_string(&mut blob, &sig_blob);

        Ok(armor(&STANDARD.encode(blob)))
    }
}

/// The byte string the signature actually covers.
fn signed_data(payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::from(MAGIC_PREAMBLE);
    put_string(&mut data, NAMESPACE.as_bytes());
    put_string(&mut data, b"");
    put_string(&mut data, HASH_ALGORITHM.as_bytes());
    put_string(&mut data, &Sha512::digest(payload));
    data
}

fn armor(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len() + encoded.len() / ARMOR_WIDTH + 64);
    out.push_str(ARMOR_BEGIN);
    out.push('\n');
    for (i, ch) in encoded.chars().enumerate() {
        if i > 0 && i % ARMOR_WIDTH == 0 {
            out.push('\n');
        }
        out.push(ch);
    }
    out.push('\n');
    out.push_str(ARMOR_END);
    out.push('\n');
    out
}
