//! Authorization redirect parsing
//!
//! The provider hands the authorization result back by redirecting the
//! browser to our redirect URI. Authorization-code responses put their
//! parameters in the query string, implicit-flow responses in the fragment;
//! both places are searched.

use std::collections::HashMap;
use url::Url;

use super::AuthError;

/// Result of the authorization step, consumed by the token exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationGrant {
    /// Authorization-code flow. `pkce_verifier` is sent back with the code.
    Code {
        code: String,
        pkce_verifier: Option<String>,
    },
    /// Implicit flow: the bearer token arrives directly in the redirect.
    Token {
        access_token: String,
        expires_in: Option<u64>,
    },
}

/// Error codes the provider uses when a silent request would have prompted.
const INTERACTION_ERRORS: &[&str] = &[
    "interaction_required",
    "login_required",
    "consent_required",
    "account_selection_required",
];

/// Parse the callback URL into a grant.
///
/// `expected_state` is the CSRF `state` sent with the authorization request;
/// when given, the callback must echo it.
pub fn parse_redirect(
    redirect: &str,
    expected_state: Option<&str>,
) -> Result<AuthorizationGrant, AuthError> {
    let url = Url::parse(redirect).map_err(|e| {
        tracing::warn!("Unparsable OAuth redirect: {}", e);
        AuthError::MalformedResponse(format!("unparsable redirect URL: {}", e))
    })?;

    let mut params: HashMap<String, String> = url.query_pairs().into_owned().collect();
    if let Some(fragment) = url.fragment() {
        // Fragment values win: that is where implicit-flow tokens live.
        params.extend(url::form_urlencoded::parse(fragment.as_bytes()).into_owned());
    }

    if let Some(error) = params.get("error").filter(|e| !e.is_empty()) {
        let description = params.get("error_description").cloned();
        return Err(map_error_code(error, description));
    }

    if let Some(expected) = expected_state {
        match params.get("state") {
            Some(state) if state == expected => {}
            Some(_) => {
                return Err(AuthError::MalformedResponse(
                    "redirect state does not match request".into(),
                ))
            }
            None => {
                return Err(AuthError::MalformedResponse(
                    "redirect is missing state parameter".into(),
                ))
            }
        }
    }

    if let Some(token) = params.get("access_token").filter(|t| !t.is_empty()) {
        let expires_in = params.get("expires_in").and_then(|s| s.parse().ok());
        return Ok(AuthorizationGrant::Token {
            access_token: token.clone(),
            expires_in,
        });
    }

    if let Some(code) = params.get("code").filter(|c| !c.is_empty()) {
        return Ok(AuthorizationGrant::Code {
            code: code.clone(),
            pkce_verifier: None,
        });
    }

    Err(AuthError::MalformedResponse(
        "redirect carries neither a token, a code, nor an error".into(),
    ))
}

fn map_error_code(code: &str, description: Option<String>) -> AuthError {
    if code == "access_denied" {
        return AuthError::UserCancelled;
    }
    if INTERACTION_ERRORS.contains(&code) {
        return AuthError::InteractionRequired;
    }
    AuthError::Provider {
        code: code.to_string(),
        description,
    }
}
