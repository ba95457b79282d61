//! Authentication failure taxonomy
//!
//! Every failure the token lifecycle can produce. Errors are `Clone` because
//! a single in-flight authentication attempt hands its result to every
//! caller waiting on it.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// A silent flow would need the user to consent. Retry with `interactive = true`.
    #[error("user interaction required to authorize")]
    InteractionRequired,

    /// The grant or refresh token is dead. Stored credentials are wiped.
    #[error("grant rejected by provider: {0}")]
    InvalidGrant(String),

    /// Transport failure or timeout talking to the provider.
    #[error("network error: {0}")]
    Network(String),

    /// The provider answered with something we could not interpret.
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    /// No usable credential and the caller did not allow an interactive flow.
    #[error("authentication required")]
    AuthenticationRequired,

    /// The consent screen was dismissed, denied, or timed out.
    #[error("authorization cancelled by user")]
    UserCancelled,

    /// An explicit OAuth error code other than `invalid_grant`.
    #[error("provider error {code}{}", .description.as_deref().map(|d| format!(": {}", d)).unwrap_or_default())]
    Provider {
        code: String,
        description: Option<String>,
    },

    /// The credential file could not be written or removed.
    #[error("credential storage error: {0}")]
    Storage(String),
}

impl AuthError {
    /// Permanent failures mean no retry can succeed without a new login.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidGrant(_) | AuthError::AuthenticationRequired
        )
    }

    /// Transient failures are safe to retry later and never touch stored state.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AuthError::Network(_) | AuthError::MalformedResponse(_) | AuthError::Storage(_)
        )
    }

    /// Errors a silent attempt ends with when an interactive one could still succeed.
    pub fn needs_interaction(&self) -> bool {
        matches!(
            self,
            AuthError::InteractionRequired
                | AuthError::AuthenticationRequired
                | AuthError::InvalidGrant(_)
        )
    }

    /// Human-readable sentence for foreground display.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::InteractionRequired | AuthError::AuthenticationRequired => {
                "You are not signed in. Run 'pigeon login' to sign in.".to_string()
            }
            AuthError::InvalidGrant(_) => {
                "Your session has expired or was revoked. Run 'pigeon login' to sign in again."
                    .to_string()
            }
            AuthError::Network(_) => {
                "Could not reach the sign-in service. Check your connection and try again."
                    .to_string()
            }
            AuthError::MalformedResponse(_) => {
                "The sign-in service returned an unexpected response. Please try again."
                    .to_string()
            }
            AuthError::UserCancelled => "Sign-in was cancelled.".to_string(),
            AuthError::Provider { code, description } => match description {
                Some(d) => format!("Sign-in failed ({}): {}", code, d),
                None => format!("Sign-in failed ({}).", code),
            },
            AuthError::Storage(_) => {
                "Could not save your credentials. Check permissions on the config directory."
                    .to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(AuthError::InvalidGrant("revoked".into()).is_permanent());
        assert!(AuthError::AuthenticationRequired.is_permanent());
        assert!(!AuthError::Network("timeout".into()).is_permanent());

        assert!(AuthError::Network("timeout".into()).is_transient());
        assert!(AuthError::MalformedResponse("bad json".into()).is_transient());
        assert!(!AuthError::UserCancelled.is_transient());

        assert!(AuthError::InteractionRequired.needs_interaction());
        assert!(!AuthError::UserCancelled.needs_interaction());
    }

    #[test]
    fn test_provider_display() {
        let err = AuthError::Provider {
            code: "invalid_client".into(),
            description: Some("unknown client".into()),
        };
        assert_eq!(err.to_string(), "provider error invalid_client: unknown client");

        let err = AuthError::Provider {
            code: "server_error".into(),
            description: None,
        };
        assert_eq!(err.to_string(), "provider error server_error");
    }

    #[test]
    fn test_user_message_is_readable() {
        assert_eq!(
            AuthError::UserCancelled.user_message(),
            "Sign-in was cancelled."
        );
        assert!(AuthError::AuthenticationRequired
            .user_message()
            .contains("pigeon login"));
    }
}
