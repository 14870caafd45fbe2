//! HMAC-SHA256 body signatures carried in the [`HASH_HEADER`](crate::HASH_HEADER) header.
//!
//! The signature always covers the uncompressed body and is hex encoded.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("invalid signing key")]
    InvalidKey,
    #[error("signature is not valid hex")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
}

fn mac(key: &[u8], body: &[u8]) -> Result<HmacSha256, IntegrityError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| IntegrityError::InvalidKey)?;
    mac.update(body);
    Ok(mac)
}

/// Returns the hex-encoded HMAC-SHA256 of `body`.
pub fn sign(key: &[u8], body: &[u8]) -> Result<String, IntegrityError> {
    Ok(hex::encode(mac(key, body)?.finalize().into_bytes()))
}

/// Checks a hex-encoded signature in constant time.
pub fn verify(key: &[u8], body: &[u8], signature: &str) -> Result<(), IntegrityError> {
    let expected = hex::decode(signature.trim()).map_err(|_| IntegrityError::Malformed)?;
    mac(key, body)?
        .verify_slice(&expected)
        .map_err(|_| IntegrityError::Mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // RFC 4231, test case 2.
        let sig = sign(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn verify_detects_tampering() {
        let body = br#"[{"id":"a","type":"gauge","value":1.0}]"#;
        let sig = sign(b"secret", body).unwrap();
        assert!(verify(b"secret", body, &sig).is_ok());
        assert_eq!(
            verify(b"other", body, &sig),
            Err(IntegrityError::Mismatch)
        );
        assert_eq!(
            verify(b"secret", b"[]", &sig),
            Err(IntegrityError::Mismatch)
        );
        assert_eq!(
            verify(b"secret", body, "zz"),
            Err(IntegrityError::Malformed)
        );
    }
}
