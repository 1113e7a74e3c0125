//! Reversible, checksum-validated transport encoding for the published list.
//!
//! `Base64(XOR(UTF8("<content>|<checksum>"), key))` where the checksum is the
//! sum of the content's UTF-8 bytes. The checksum only detects corruption; it
//! is not an integrity guarantee against a party holding the key.

use crate::config::CodecConfig;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use secrecy::{ExposeSecret, Secret};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("Codec key is empty or not configured")]
    EmptyKey,

    #[error("Encoded artifact is not valid Base64: {0}")]
    InvalidBase64(String),

    #[error("Decoded artifact is not valid UTF-8")]
    InvalidUtf8,

    #[error("Decoded artifact has no checksum separator")]
    MissingChecksum,

    #[error("Checksum '{0}' is not a number")]
    InvalidChecksum(String),

    #[error("Checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: u64, actual: u64 },
}

/// CRLF and lone CR become LF; trailing whitespace is dropped.
pub fn normalize(content: &str) -> String {
    content
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .trim_end()
        .to_string()
}

pub fn checksum(content: &str) -> u64 {
    content.bytes().map(u64::from).sum()
}

fn xor_cycle(bytes: &mut [u8], key: &[u8]) {
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte ^= key[i % key.len()];
    }
}

pub fn encode(content: &str, key: &str) -> Result<String, CodecError> {
    if key.is_empty() {
        return Err(CodecError::EmptyKey);
    }

    let content = normalize(content);
    let mut bytes = format!("{}|{}", content, checksum(&content)).into_bytes();
    xor_cycle(&mut bytes, key.as_bytes());
    Ok(STANDARD.encode(bytes))
}

/// Inverse of [`encode`]. Never returns content that failed validation.
pub fn decode(encoded: &str, key: &str) -> Result<String, CodecError> {
    if key.is_empty() {
        return Err(CodecError::EmptyKey);
    }

    let mut bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
    xor_cycle(&mut bytes, key.as_bytes());

    let text = String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
    let (content, raw_checksum) = text.rsplit_once('|').ok_or(CodecError::MissingChecksum)?;

    let expected: u64 = raw_checksum
        .parse()
        .map_err(|_| CodecError::InvalidChecksum(raw_checksum.to_string()))?;
    let actual = checksum(content);
    if expected != actual {
        return Err(CodecError::ChecksumMismatch { expected, actual });
    }

    Ok(content.to_string())
}

/// Per-community keys layered over a global default.
#[derive(Debug, Clone, Default)]
pub struct CodecKeys {
    default_key: Option<Secret<String>>,
    community_keys: HashMap<String, Secret<String>>,
}

impl CodecKeys {
    pub fn new(
        default_key: Option<Secret<String>>,
        community_keys: HashMap<String, Secret<String>>,
    ) -> Self {
        Self {
            default_key,
            community_keys,
        }
    }

    pub fn from_config(config: &CodecConfig) -> Self {
        Self::new(config.default_key.clone(), config.community_keys.clone())
    }

    pub fn resolve(&self, community_id: Option<&str>) -> Result<&str, CodecError> {
        let key = community_id
            .and_then(|id| self.community_keys.get(id))
            .or(self.default_key.as_ref())
            .map(|key| key.expose_secret().as_str())
            .unwrap_or_default();

        if key.is_empty() {
            return Err(CodecError::EmptyKey);
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        assert_eq!(checksum("alice,staff:mod"), 1464);
        let encoded = encode("alice,staff:mod", "KEY").unwrap();
        assert_eq!(encoded, "KikwKCB1ODE4LSNjJio9N3RtfXE=");
        assert_eq!(decode(&encoded, "KEY").unwrap(), "alice,staff:mod");
    }

    #[test]
    fn round_trips_multiline_and_unicode() {
        let key = "community-key";
        for content in ["", "bob,vip\ncarol,staff:mod", "zoë,ä:ß|x", "a|b|c,p"] {
            let encoded = encode(content, key).unwrap();
            assert_eq!(decode(&encoded, key).unwrap(), content);
        }
    }

    #[test]
    fn encode_normalizes_line_endings() {
        let key = "k";
        let encoded = encode("bob,vip\r\ncarol,mod\r\n  ", key).unwrap();
        assert_eq!(decode(&encoded, key).unwrap(), "bob,vip\ncarol,mod");
        assert_eq!(normalize("a\rb\r\nc \t\n"), "a\nb\nc");
    }

    #[test]
    fn flipped_byte_is_rejected() {
        let key = "KEY";
        let encoded = encode("bob,vip\ncarol,staff:mod", key).unwrap();
        let mut raw = STANDARD.decode(&encoded).unwrap();
        // Flip a content byte into another printable character.
        raw[2] ^= 0x01;
        let tampered = STANDARD.encode(raw);

        assert!(matches!(
            decode(&tampered, key),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn wrong_key_fails_closed() {
        let encoded = encode("alice,staff:mod", "KEY").unwrap();
        assert!(decode(&encoded, "NOT-THE-KEY").is_err());
    }

    #[test]
    fn malformed_inputs_are_errors() {
        assert_eq!(encode("x", ""), Err(CodecError::EmptyKey));
        assert!(matches!(
            decode("%%%", "KEY"),
            Err(CodecError::InvalidBase64(_))
        ));

        let mut no_separator = b"plain".to_vec();
        xor_cycle(&mut no_separator, b"KEY");
        assert_eq!(
            decode(&STANDARD.encode(no_separator), "KEY"),
            Err(CodecError::MissingChecksum)
        );

        let mut bad_checksum = b"plain|abc".to_vec();
        xor_cycle(&mut bad_checksum, b"KEY");
        assert_eq!(
            decode(&STANDARD.encode(bad_checksum), "KEY"),
            Err(CodecError::InvalidChecksum("abc".to_string()))
        );
    }

    #[test]
    fn community_key_takes_precedence() {
        let keys = CodecKeys::new(
            Some(Secret::new("global".to_string())),
            HashMap::from([
                ("111".to_string(), Secret::new("local".to_string())),
                ("222".to_string(), Secret::new(String::new())),
            ]),
        );

        assert_eq!(keys.resolve(Some("111")).unwrap(), "local");
        assert_eq!(keys.resolve(Some("999")).unwrap(), "global");
        assert_eq!(keys.resolve(None).unwrap(), "global");
        assert_eq!(keys.resolve(Some("222")), Err(CodecError::EmptyKey));
        assert_eq!(
            CodecKeys::default().resolve(None),
            Err(CodecError::EmptyKey)
        );
    }
}
