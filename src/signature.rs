use crate::error::CoreError;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

const TAG_CONTEXT: &[u8] = b"vapi-server-url-secret";

/// Checks the shared secret the platform echoes verbatim on every push.
///
/// Both the configured and the presented secret are turned into HMAC tags over a fixed
/// context and compared with `verify_slice`, so the comparison runs in constant time
/// regardless of where the values first differ or how long they are.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<Vec<u8>>,
}

impl fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret
                .filter(|s| !s.is_empty())
                .map(String::into_bytes),
        }
    }

    /// Without a configured secret every push is accepted (development mode).
    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    pub fn verify(&self, presented: Option<&str>) -> Result<(), CoreError> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let Some(presented) = presented else {
            warn!("push rejected: credential header missing");
            return Err(CoreError::InvalidSignature);
        };
        let expected = tag(secret)?;
        keyed(presented.as_bytes())?
            .verify_slice(&expected)
            .map_err(|_| {
                warn!("push rejected: credential mismatch");
                CoreError::InvalidSignature
            })
    }
}

fn keyed(key: &[u8]) -> Result<HmacSha256, CoreError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| CoreError::InvalidSignature)?;
    mac.update(TAG_CONTEXT);
    Ok(mac)
}

fn tag(key: &[u8]) -> Result<Vec<u8>, CoreError> {
    Ok(keyed(key)?.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_without_secret() {
        let verifier = SignatureVerifier::new(None);
        assert!(!verifier.is_enabled());
        assert!(verifier.verify(None).is_ok());
        assert!(verifier.verify(Some("anything")).is_ok());
        assert!(!SignatureVerifier::new(Some(String::new())).is_enabled());
    }

    #[test]
    fn matching_secret_passes() {
        let verifier = SignatureVerifier::new(Some("s3cret".into()));
        assert!(verifier.verify(Some("s3cret")).is_ok());
    }

    #[test]
    fn mismatched_or_missing_secret_is_rejected() {
        let verifier = SignatureVerifier::new(Some("s3cret".into()));
        for presented in [Some("s3cre"), Some("s3cret "), Some(""), None] {
            assert!(matches!(
                verifier.verify(presented),
                Err(CoreError::InvalidSignature)
            ));
        }
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let verifier = SignatureVerifier::new(Some("s3cret".into()));
        assert!(!format!("{verifier:?}").contains("s3cret"));
    }
}
