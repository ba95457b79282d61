//! OAuth2 authorization and token endpoint calls
//!
//! Authorization URLs and token endpoint calls both go through the `oauth2`
//! crate. Requests are sent with our own reqwest client so the configured
//! timeout applies, and every outcome is mapped onto [`AuthError`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use oauth2::basic::{BasicClient, BasicErrorResponse, BasicErrorResponseType, BasicTokenResponse};
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, HttpRequest,
    HttpResponse, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken,
    RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use std::sync::Arc;
use url::Url;

use super::browser::UserAgent;
use super::redirect::{parse_redirect, AuthorizationGrant};
use super::{AuthConfig, AuthError, ResponseType, TokenGrant};

/// The provider-facing half of authentication.
#[async_trait]
pub trait OAuthFlow: Send + Sync {
    /// Run the browser step. With `interactive = false` this succeeds only
    /// without user interaction, otherwise fails with `InteractionRequired`.
    async fn authorize(&self, interactive: bool) -> Result<AuthorizationGrant, AuthError>;

    /// Turn an authorization grant into tokens.
    async fn exchange(&self, grant: AuthorizationGrant) -> Result<TokenGrant, AuthError>;

    /// Trade a refresh token for a new access token. The response may omit a
    /// new refresh token.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError>;

    /// Whether `authorize(false)` can ever succeed.
    fn supports_silent_authorization(&self) -> bool {
        false
    }
}

/// Failure below the OAuth layer while talking to the token endpoint.
#[derive(Debug, thiserror::Error)]
enum TransportError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("token endpoint returned HTTP {0}")]
    Status(u16),
}

type TokenError = RequestTokenError<TransportError, BasicErrorResponse>;

/// Build the OAuth2 client from an AuthConfig
fn build_client(auth_config: &AuthConfig) -> Result<BasicClient> {
    let auth_url = AuthUrl::new(auth_config.auth_url.clone()).context("Invalid auth_url")?;
    let token_url = TokenUrl::new(auth_config.token_url.clone()).context("Invalid token_url")?;
    let redirect_url =
        RedirectUrl::new(auth_config.redirect_uri.clone()).context("Invalid redirect_uri")?;

    Ok(BasicClient::new(
        ClientId::new(auth_config.client_id.clone()),
        auth_config.client_secret.clone().map(ClientSecret::new),
        auth_url,
        Some(token_url),
    )
    .set_auth_type(AuthType::RequestBody)
    .set_redirect_uri(redirect_url))
}

/// Concrete flow against the configured provider.
pub struct ProviderFlow {
    config: AuthConfig,
    client: BasicClient,
    http: reqwest::Client,
    agent: Arc<dyn UserAgent>,
}

impl ProviderFlow {
    pub fn new(config: AuthConfig, agent: Arc<dyn UserAgent>) -> Result<Self> {
        let client = build_client(&config)?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            config,
            client,
            http,
            agent,
        })
    }

    /// Authorization URL, the CSRF state sent with it, and the PKCE verifier
    /// to present at the token endpoint (code flow only).
    fn authorization_request(&self, interactive: bool) -> (Url, CsrfToken, Option<PkceCodeVerifier>) {
        let mut request = self.client.authorize_url(CsrfToken::new_random);
        for scope in &self.config.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }

        let prompt = if interactive { "consent" } else { "none" };
        let verifier = match self.config.response_type {
            ResponseType::Code => {
                let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
                request = request
                    .set_pkce_challenge(challenge)
                    .add_extra_param("access_type", "offline")
                    .add_extra_param("prompt", prompt);
                Some(verifier)
            }
            ResponseType::Token => {
                request = request.use_implicit_flow();
                if !interactive {
                    request = request.add_extra_param("prompt", "none");
                }
                None
            }
        };

        let (url, state) = request.url();
        (url, state, verifier)
    }

    async fn exchange_code(
        &self,
        code: String,
        pkce_verifier: Option<String>,
    ) -> Result<TokenGrant, AuthError> {
        let mut request = self.client.exchange_code(AuthorizationCode::new(code));
        if let Some(verifier) = pkce_verifier {
            request = request.set_pkce_verifier(PkceCodeVerifier::new(verifier));
        }
        let http = self.http.clone();
        let response = request
            .request_async(|req| send_token_request(http, req))
            .await
            .map_err(token_error)?;
        token_grant(response)
    }
}

#[async_trait]
impl OAuthFlow for ProviderFlow {
    async fn authorize(&self, interactive: bool) -> Result<AuthorizationGrant, AuthError> {
        if !interactive && !self.agent.supports_silent() {
            return Err(AuthError::InteractionRequired);
        }

        let (url, state, verifier) = self.authorization_request(interactive);
        let redirect = self.agent.launch(&url, interactive).await?;

        match parse_redirect(&redirect, Some(state.secret()))? {
            AuthorizationGrant::Code { code, .. } => Ok(AuthorizationGrant::Code {
                code,
                pkce_verifier: verifier.map(|v| v.secret().to_string()),
            }),
            token => Ok(token),
        }
    }

    async fn exchange(&self, grant: AuthorizationGrant) -> Result<TokenGrant, AuthError> {
        match grant {
            AuthorizationGrant::Token {
                access_token,
                expires_in,
            } => Ok(TokenGrant {
                access_token,
                refresh_token: None,
                expires_in,
            }),
            AuthorizationGrant::Code {
                code,
                pkce_verifier,
            } => {
                tracing::info!("Exchanging authorization code for tokens...");
                self.exchange_code(code, pkce_verifier).await
            }
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        tracing::info!("Refreshing access token...");
        let http = self.http.clone();
        let response = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(|req| send_token_request(http, req))
            .await
            .map_err(token_error)?;
        token_grant(response)
    }

    fn supports_silent_authorization(&self) -> bool {
        self.agent.supports_silent()
    }
}

/// Send a token endpoint request with the shared client. Server errors are
/// reported as transport failures so they are retried rather than parsed.
async fn send_token_request(
    http: reqwest::Client,
    request: HttpRequest,
) -> Result<HttpResponse, TransportError> {
    tracing::debug!("Token endpoint {} {}", request.method, request.url);

    let resp = http
        .request(request.method, request.url.as_str())
        .headers(request.headers)
        .body(request.body)
        .send()
        .await?;

    let status_code = resp.status();
    if status_code.is_server_error() {
        return Err(TransportError::Status(status_code.as_u16()));
    }
    let headers = resp.headers().clone();
    let body = resp.bytes().await?.to_vec();
    Ok(HttpResponse {
        status_code,
        headers,
        body,
    })
}

fn network_error(e: reqwest::Error) -> AuthError {
    if e.is_timeout() {
        AuthError::Network("token endpoint request timed out".into())
    } else {
        AuthError::Network(e.to_string())
    }
}

/// Map a failed token endpoint call onto the failure taxonomy.
fn token_error(err: TokenError) -> AuthError {
    match err {
        RequestTokenError::ServerResponse(resp) => {
            tracing::warn!("Token endpoint returned error {}", resp.error());
            let description = resp.error_description().cloned();
            match resp.error() {
                BasicErrorResponseType::InvalidGrant => AuthError::InvalidGrant(
                    description.unwrap_or_else(|| "invalid_grant".to_string()),
                ),
                code => AuthError::Provider {
                    code: code.to_string(),
                    description,
                },
            }
        }
        RequestTokenError::Request(TransportError::Http(e)) => network_error(e),
        RequestTokenError::Request(e) => AuthError::Network(e.to_string()),
        RequestTokenError::Parse(e, _) => {
            tracing::warn!("Unparsable token endpoint response: {}", e);
            AuthError::MalformedResponse(format!("unparsable token response: {}", e))
        }
        RequestTokenError::Other(reason) => {
            tracing::warn!("Unexpected token endpoint response: {}", reason);
            AuthError::MalformedResponse(reason)
        }
    }
}

fn token_grant(resp: BasicTokenResponse) -> Result<TokenGrant, AuthError> {
    let access_token = resp.access_token().secret().to_string();
    if access_token.is_empty() {
        tracing::warn!("Token endpoint response has an empty access_token");
        return Err(AuthError::MalformedResponse(
            "token response missing access_token".into(),
        ));
    }
    Ok(TokenGrant {
        access_token,
        refresh_token: resp
            .refresh_token()
            .map(|t| t.secret().to_string())
            .filter(|t| !t.is_empty()),
        expires_in: resp.expires_in().map(|d| d.as_secs()),
    })
}
