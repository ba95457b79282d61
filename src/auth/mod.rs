//! Authentication module
//!
//! Owns the OAuth2 credential used to read the mailbox: obtaining it through
//! the browser, persisting it, renewing it silently before it expires, and
//! making sure concurrent callers never start two authentication attempts.

pub mod browser;
pub mod commands;
pub mod error;
pub mod lifecycle;
pub mod oauth;
pub mod redirect;
pub mod renewal;
pub mod store;
pub mod tokens;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use commands::{login, logout, print_token, status, Session};
pub use error::AuthError;
pub use lifecycle::{TokenManager, TokenState};
pub use renewal::RenewalScheduler;
pub use tokens::{Clock, Credential, CredentialStore, ExpiryPolicy, SystemClock, TokenGrant};

/// Which OAuth2 response type the authorization request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Authorization-code flow; yields a refresh token.
    #[default]
    Code,
    /// Implicit flow; the access token arrives in the redirect fragment.
    Token,
}

/// Provider client configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// OAuth2 client ID
    pub client_id: String,
    /// Client secret, only for confidential clients
    pub client_secret: Option<String>,
    /// Authorization endpoint
    pub auth_url: String,
    /// Token endpoint
    pub token_url: String,
    pub scopes: Vec<String>,
    /// Where the provider sends the browser after consent
    pub redirect_uri: String,
    pub response_type: ResponseType,
    /// Timeout for each token endpoint request
    pub request_timeout: Duration,
}
