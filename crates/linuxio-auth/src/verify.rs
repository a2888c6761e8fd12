//! Password verification against the host OS.
//!
//! The shipped verifier checks the shadow file, which the privileged
//! broker can read. The trait keeps the broker testable with an
//! in-memory account list.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::AuthError;

/// Checks a username/password pair against some account store.
pub trait PasswordVerifier: Send + Sync {
    /// Verify credentials.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::BadCredentials` on mismatch or a locked
    /// account, `AuthError::UserNotFound` for unknown accounts.
    fn verify(&self, user: &str, password: &str) -> Result<(), AuthError>;
}

/// Shadow-file verifier. Requires read access to the shadow file, which
/// the broker has because it runs privileged.
pub struct ShadowVerifier {
    path: PathBuf,
}

impl ShadowVerifier {
    /// Verifier over the system shadow file.
    #[must_use]
    pub fn new() -> Self {
        Self::with_path("/etc/shadow")
    }

    /// Verifier over an explicit shadow file, for tests and chroots.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn lookup_hash(&self, user: &str) -> Result<String, AuthError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|err| {
            tracing::error!(path = %self.path.display(), error = %err, "cannot read shadow file");
            AuthError::Io(err)
        })?;
        for line in contents.lines() {
            let mut fields = line.splitn(3, ':');
            let (Some(name), Some(hash)) = (fields.next(), fields.next()) else {
                continue;
            };
            if name == user {
                return Ok(hash.to_string());
            }
        }
        Err(AuthError::UserNotFound(user.to_string()))
    }
}

impl Default for ShadowVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordVerifier for ShadowVerifier {
    fn verify(&self, user: &str, password: &str) -> Result<(), AuthError> {
        let hash = self.lookup_hash(user)?;
        // Locked or passwordless accounts cannot sign in.
        if hash.is_empty() || hash.starts_with('!') || hash.starts_with('*') {
            return Err(AuthError::BadCredentials);
        }
        if pwhash::unix::verify(password, &hash) {
            Ok(())
        } else {
            Err(AuthError::BadCredentials)
        }
    }
}

/// In-memory account list for development and tests.
#[derive(Default)]
pub struct MemoryVerifier {
    accounts: HashMap<String, String>,
}

impl MemoryVerifier {
    /// Empty verifier; every login fails with `UserNotFound`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an account.
    #[must_use]
    pub fn with_account(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.accounts.insert(user.into(), password.into());
        self
    }
}

impl PasswordVerifier for MemoryVerifier {
    fn verify(&self, user: &str, password: &str) -> Result<(), AuthError> {
        match self.accounts.get(user) {
            Some(expected) if expected == password => Ok(()),
            Some(_) => Err(AuthError::BadCredentials),
            None => Err(AuthError::UserNotFound(user.to_string())),
        }
    }
}

/// Read the message of the day, empty when absent.
#[must_use]
pub fn read_motd(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}
