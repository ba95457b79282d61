//! Browser step of the authorization flow
//!
//! The consent screen is rendered by the user's browser. The CLI prints the
//! authorization URL and catches the provider's redirect with a small axum
//! server bound to the configured redirect URI.

use async_trait::async_trait;
use axum::extract::{RawQuery, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

use super::AuthError;

const SUCCESS_PAGE: &str = "<html><body><h3>Signed in.</h3>\
<p>You can close this window and return to the terminal.</p></body></html>";

/// Served when the redirect carries no query. Browsers never send the URL
/// fragment, so the page moves an implicit-flow fragment into the query and
/// reloads.
const FRAGMENT_RELAY_PAGE: &str = "<html><body><script>\
if (location.hash.length > 1) {\
location.replace(location.pathname + '?' + location.hash.substring(1));\
} else {\
document.body.textContent = 'No authorization response received.';\
}\
</script></body></html>";

/// Something that can show an authorization URL to the user and report
/// where the provider redirected afterwards.
#[async_trait]
pub trait UserAgent: Send + Sync {
    /// Returns the full redirect URL. With `interactive = false` the agent
    /// must not show anything; it fails with `InteractionRequired` when the
    /// provider would need to prompt.
    async fn launch(&self, url: &Url, interactive: bool) -> Result<String, AuthError>;

    /// Whether a non-interactive launch can ever succeed (provider session reuse).
    fn supports_silent(&self) -> bool {
        false
    }
}

/// Prints the URL and waits for the redirect on a loopback socket.
#[derive(Debug, Clone)]
pub struct LoopbackUserAgent {
    redirect_uri: Url,
    consent_timeout: Duration,
}

impl LoopbackUserAgent {
    pub fn new(redirect_uri: Url, consent_timeout: Duration) -> Self {
        Self {
            redirect_uri,
            consent_timeout,
        }
    }

    fn bind_addr(&self) -> Result<SocketAddr, AuthError> {
        self.redirect_uri
            .socket_addrs(|| Some(80))
            .ok()
            .and_then(|addrs| addrs.into_iter().next())
            .ok_or_else(|| {
                AuthError::MalformedResponse(format!(
                    "redirect URI {} has no usable address",
                    self.redirect_uri
                ))
            })
    }

    fn router(&self, callback: oneshot::Sender<String>) -> Router {
        let state = CallbackState {
            redirect_uri: self.redirect_uri.clone(),
            callback: Arc::new(Mutex::new(Some(callback))),
        };
        Router::new()
            .route(self.redirect_uri.path(), get(receive_callback))
            .with_state(state)
    }
}

#[derive(Clone)]
struct CallbackState {
    redirect_uri: Url,
    callback: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

async fn receive_callback(
    State(state): State<CallbackState>,
    RawQuery(query): RawQuery,
) -> Html<&'static str> {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        tracing::debug!("Redirect without query; relaying fragment");
        return Html(FRAGMENT_RELAY_PAGE);
    };

    let mut redirect = state.redirect_uri.clone();
    redirect.set_query(Some(&query));
    let sender = state
        .callback
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    match sender {
        Some(tx) => {
            let _ = tx.send(redirect.to_string());
        }
        None => tracing::debug!("Ignoring repeated authorization redirect"),
    }
    Html(SUCCESS_PAGE)
}

/// Stops the listener when the launch returns or is cancelled.
struct ListenerTask(JoinHandle<()>);

impl Drop for ListenerTask {
    fn drop(&mut self) {
        // Open connections run on their own tasks and finish their responses.
        self.0.abort();
    }
}

#[async_trait]
impl UserAgent for LoopbackUserAgent {
    async fn launch(&self, url: &Url, interactive: bool) -> Result<String, AuthError> {
        if !interactive {
            // No browser session to reuse from a terminal.
            return Err(AuthError::InteractionRequired);
        }

        let addr = self.bind_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AuthError::Network(format!("cannot listen on {}: {}", addr, e)))?;

        let (tx, rx) = oneshot::channel();
        let router = self.router(tx);
        let _server = ListenerTask(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!("Loopback listener failed: {}", e);
            }
        }));

        println!();
        println!("To sign in, open this URL in your browser:");
        println!();
        println!("  {}", url);
        println!();

        tracing::info!("Waiting for authorization redirect on {}...", addr);

        tokio::select! {
            received = tokio::time::timeout(self.consent_timeout, rx) => match received {
                Ok(Ok(redirect)) => Ok(redirect),
                Ok(Err(_)) => Err(AuthError::Network("loopback listener stopped".into())),
                Err(_) => {
                    tracing::warn!("No authorization redirect within {:?}", self.consent_timeout);
                    Err(AuthError::UserCancelled)
                }
            },
            _ = tokio::signal::ctrl_c() => Err(AuthError::UserCancelled),
        }
    }
}
