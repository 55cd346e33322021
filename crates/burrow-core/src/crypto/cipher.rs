use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload as AeadPayload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CoreError;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A 256-bit AES-GCM key. Bytes are zeroized on drop and never printed;
/// `fingerprint` is the only key-derived value safe to log.
pub struct DataKey {
    bytes: Zeroizing<[u8; KEY_LEN]>,
    fingerprint: String,
}

impl DataKey {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(bytes.as_mut());
        Self::from_array(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() != KEY_LEN {
            return Err(CoreError::KeyUnavailable(format!(
                "expected {KEY_LEN} key bytes, got {}",
                bytes.len()
            )));
        }
        let mut array = Zeroizing::new([0u8; KEY_LEN]);
        array.copy_from_slice(bytes);
        Ok(Self::from_array(array))
    }

    fn from_array(bytes: Zeroizing<[u8; KEY_LEN]>) -> Self {
        let digest = Sha256::digest(bytes.as_ref());
        let fingerprint = format!(
            "{:02x}{:02x}{:02x}{:02x}",
            digest[0], digest[1], digest[2], digest[3]
        );
        Self { bytes, fingerprint }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.bytes.as_ref()
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.bytes.as_ref()))
    }

    /// Encrypt with a fresh random nonce. `aad` is authenticated but not stored.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CoreError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut ciphertext = self
            .cipher()
            .encrypt(
                &nonce,
                AeadPayload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CoreError::Io(std::io::Error::other(format!("encrypt failed: {e}"))))?;
        // aes-gcm appends the tag; keep it as its own field on disk.
        let tag = ciphertext.split_off(ciphertext.len() - TAG_LEN);
        Ok(Sealed {
            nonce: STANDARD.encode(nonce.as_slice()),
            ciphertext: STANDARD.encode(&ciphertext),
            tag: STANDARD.encode(&tag),
        })
    }

    /// Verify and decrypt. Any malformed field or tag mismatch is an
    /// `IntegrityViolation` attributed to `context`.
    pub fn open(&self, sealed: &Sealed, aad: &[u8], context: &str) -> Result<Vec<u8>, CoreError> {
        let nonce_bytes = decode_field(&sealed.nonce, "nonce", context)?;
        let mut ciphertext = decode_field(&sealed.ciphertext, "ciphertext", context)?;
        let tag = decode_field(&sealed.tag, "tag", context)?;

        if nonce_bytes.len() != NONCE_LEN {
            return Err(CoreError::integrity(
                context,
                format!("nonce must be {NONCE_LEN} bytes, got {}", nonce_bytes.len()),
            ));
        }
        if tag.len() != TAG_LEN {
            return Err(CoreError::integrity(
                context,
                format!("tag must be {TAG_LEN} bytes, got {}", tag.len()),
            ));
        }

        ciphertext.extend_from_slice(&tag);
        let nonce = Nonce::from_slice(&nonce_bytes);
        self.cipher()
            .decrypt(
                nonce,
                AeadPayload {
                    msg: &ciphertext,
                    aad,
                },
            )
            .map_err(|_| CoreError::integrity(context, "authentication tag mismatch"))
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Nonce, ciphertext and authentication tag, base64-encoded for JSON envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    pub nonce: String,
    pub ciphertext: String,
    pub tag: String,
}

fn decode_field(value: &str, field: &str, context: &str) -> Result<Vec<u8>, CoreError> {
    STANDARD
        .decode(value)
        .map_err(|e| CoreError::integrity(context, format!("{field} is not valid base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flip_bit(encoded: &str, index: usize, bit: u8) -> String {
        let mut bytes = STANDARD.decode(encoded).unwrap();
        bytes[index] ^= 1 << bit;
        STANDARD.encode(bytes)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = DataKey::generate();
        let sealed = key.seal(b"hello-burrow", b"aad").unwrap();
        assert_ne!(sealed.ciphertext, STANDARD.encode(b"hello-burrow"));
        let opened = key.open(&sealed, b"aad", "test").unwrap();
        assert_eq!(opened, b"hello-burrow");
    }

    #[test]
    fn test_nonce_is_fresh_per_seal() {
        let key = DataKey::generate();
        let a = key.seal(b"same", b"").unwrap();
        let b = key.seal(b"same", b"").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_every_bit_flip_is_detected() {
        let key = DataKey::generate();
        let sealed = key.seal(b"payload-under-test", b"ctx").unwrap();
        let ct_len = STANDARD.decode(&sealed.ciphertext).unwrap().len();

        for index in 0..ct_len {
            for bit in 0..8 {
                let mut tampered = sealed.clone();
                tampered.ciphertext = flip_bit(&sealed.ciphertext, index, bit);
                let err = key.open(&tampered, b"ctx", "rec").unwrap_err();
                assert!(matches!(err, CoreError::IntegrityViolation { .. }));
            }
        }
        for index in 0..TAG_LEN {
            for bit in 0..8 {
                let mut tampered = sealed.clone();
                tampered.tag = flip_bit(&sealed.tag, index, bit);
                let err = key.open(&tampered, b"ctx", "rec").unwrap_err();
                assert!(matches!(err, CoreError::IntegrityViolation { .. }));
            }
        }
    }

    #[test]
    fn test_wrong_aad_or_key_fails() {
        let key = DataKey::generate();
        let sealed = key.seal(b"x", b"record-a").unwrap();
        assert!(key.open(&sealed, b"record-b", "rec").is_err());
        assert!(DataKey::generate().open(&sealed, b"record-a", "rec").is_err());
    }

    #[test]
    fn test_malformed_fields_are_integrity_errors() {
        let key = DataKey::generate();
        let mut sealed = key.seal(b"x", b"").unwrap();
        sealed.nonce = "not base64!!".into();
        assert!(matches!(
            key.open(&sealed, b"", "rec"),
            Err(CoreError::IntegrityViolation { .. })
        ));

        let mut short_tag = key.seal(b"x", b"").unwrap();
        short_tag.tag = STANDARD.encode([0u8; 4]);
        assert!(matches!(
            key.open(&short_tag, b"", "rec"),
            Err(CoreError::IntegrityViolation { .. })
        ));
    }

    #[test]
    fn test_fingerprint_is_stable_and_debug_hides_key() {
        let key = DataKey::from_bytes(&[7u8; KEY_LEN]).unwrap();
        let again = DataKey::from_bytes(&[7u8; KEY_LEN]).unwrap();
        assert_eq!(key.fingerprint(), again.fingerprint());
        assert_eq!(key.fingerprint().len(), 8);
        let debug = format!("{key:?}");
        assert!(debug.contains(key.fingerprint()));
        assert!(!debug.contains("7, 7"));
        assert!(DataKey::from_bytes(&[1u8; 8]).is_err());
    }
}
