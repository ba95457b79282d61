//! Credential model, expiry policy and storage trait

use chrono::{DateTime, Duration, Utc};

use super::AuthError;

/// Persisted OAuth credential.
///
/// The access token and its issuance time always travel together; there is
/// no way to build a `Credential` without both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl Credential {
    /// Build the credential that replaces `previous` after a successful
    /// token-endpoint call. A grant without a refresh token keeps the old one.
    pub fn from_grant(
        grant: TokenGrant,
        previous_refresh: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or(previous_refresh),
            issued_at: now,
        }
    }
}

/// Token endpoint result before it is stamped and persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// Usability rule: `now - issued_at < nominal_lifetime - margin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub nominal_lifetime: Duration,
    pub margin: Duration,
}

impl ExpiryPolicy {
    pub fn new(nominal_lifetime: Duration, margin: Duration) -> Self {
        Self {
            nominal_lifetime,
            margin,
        }
    }

    /// How long a freshly issued token is handed out before renewal.
    pub fn usable_window(&self) -> Duration {
        self.nominal_lifetime - self.margin
    }

    pub fn is_fresh(&self, issued_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let age = now - issued_at;
        // issued_at too far ahead of our clock cannot be trusted
        if age < -self.margin {
            return false;
        }
        age < self.usable_window()
    }
}

impl Default for ExpiryPolicy {
    /// Google access tokens live 60 minutes; renew 5 minutes early.
    fn default() -> Self {
        Self::new(Duration::minutes(60), Duration::minutes(5))
    }
}

/// Time source, injected so expiry can be tested.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Durable credential storage.
///
/// Only the token lifecycle manager writes to a store. `get` never fails:
/// anything unreadable is reported as no credential.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Option<Credential>;
    fn set(&self, credential: &Credential) -> Result<(), AuthError>;
    fn clear(&self) -> Result<(), AuthError>;
}

/// In-process store, lost when the process exits.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: std::sync::Mutex<Option<Credential>>,
}

#[cfg(test)]
impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            inner: std::sync::Mutex::new(Some(credential)),
        }
    }
}

#[cfg(test)]
impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<Credential> {
        self.inner.lock().ok()?.clone()
    }

    fn set(&self, credential: &Credential) -> Result<(), AuthError> {
        let mut slot = self
            .inner
            .lock()
            .map_err(|_| AuthError::Storage("credential lock poisoned".into()))?;
        *slot = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), AuthError> {
        let mut slot = self
            .inner
            .lock()
            .map_err(|_| AuthError::Storage("credential lock poisoned".into()))?;
        *slot = None;
        Ok(())
    }
}
