use thiserror::Error;

#[derive(Debug, Error)]
#[error("secret store: {0}")]
pub struct SecretError(pub String);

/// At-rest encryption seam for user-supplied provider keys. Implemented by
/// the host application; this crate never sees key material except in
/// memory while resolving.
///
/// The resolver treats `decrypt` failures as "key absent" (logged, never
/// surfaced), so an implementation may fail freely without breaking the
/// metered path.
pub trait SecretStore: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, SecretError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError>;
    /// Whether a stored value is ciphertext produced by this store. Values
    /// that are not (legacy plaintext rows) are used as-is.
    fn is_encrypted(&self, value: &str) -> bool;
}
