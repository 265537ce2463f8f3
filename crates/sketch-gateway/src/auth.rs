use std::fmt;
use std::sync::Arc;

use sketch_crypto::keys::keys_match;
use sketch_types::{SketchError, SketchResult};

/// Shared service credential checked on every connection and request.
#[derive(Clone)]
pub struct ServiceCredential {
    key: Arc<str>,
}

impl ServiceCredential {
    pub fn new(key: impl Into<String>) -> Self {
        let key: String = key.into();
        Self { key: Arc::from(key) }
    }

    pub fn verify(&self, presented: Option<&str>) -> SketchResult<()> {
        match presented {
            Some(p) if !p.is_empty() && keys_match(p, &self.key) => Ok(()),
            _ => Err(SketchError::Auth),
        }
    }
}

impl fmt::Debug for ServiceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServiceCredential(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_only_the_configured_key() {
        let cred = ServiceCredential::new("k3y");
        assert!(cred.verify(Some("k3y")).is_ok());
        assert_eq!(cred.verify(Some("k3Y")), Err(SketchError::Auth));
        assert_eq!(cred.verify(Some("")), Err(SketchError::Auth));
        assert_eq!(cred.verify(None), Err(SketchError::Auth));
    }

    #[test]
    fn debug_output_hides_the_key() {
        let cred = ServiceCredential::new("super-secret");
        assert!(!format!("{:?}", cred).contains("super-secret"));
    }
}
