//! Secret store seam.
//!
//! Bot tokens are persisted as opaque ciphertext; the orchestrator asks the
//! secret store for the plaintext only at launch time and hands it straight
//! to the execution unit's environment. Plaintext is never written back.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("token decryption failed: {0}")]
    Decrypt(String),
}

/// Decrypts stored tokens. The real implementation lives with the
/// platform's key management; the daemon only depends on this contract.
pub trait SecretStore: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError>;
}

/// Passthrough store for deployments without an encryptor and for tests.
pub struct PlainSecretStore;

impl SecretStore for PlainSecretStore {
    fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError> {
        Ok(ciphertext.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_store_is_identity() {
        let store = PlainSecretStore;
        assert_eq!(store.decrypt("abc123").unwrap(), "abc123");
    }
}
