//! CLI entry points for sign-in management

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::sync::Arc;

use super::browser::LoopbackUserAgent;
use super::oauth::ProviderFlow;
use super::store::FileCredentialStore;
use super::{CredentialStore, TokenManager, TokenState};
use crate::config::Settings;

/// Token manager wired to the on-disk credential store and the browser flow.
pub struct Session {
    pub manager: TokenManager,
    store: Arc<dyn CredentialStore>,
}

impl Session {
    pub fn open(settings: &Settings) -> Result<Self> {
        let file_store = FileCredentialStore::new(Settings::credentials_path()?);
        tracing::debug!("Credential store: {}", file_store.path().display());
        let store: Arc<dyn CredentialStore> = Arc::new(file_store);

        let agent = Arc::new(LoopbackUserAgent::new(
            settings.redirect_url()?,
            settings.consent_timeout(),
        ));
        let flow = ProviderFlow::new(settings.auth_config(), agent)
            .context("Failed to set up OAuth client")?;

        let manager = TokenManager::new(store.clone(), Arc::new(flow), settings.expiry_policy());
        Ok(Self::new(manager, store))
    }

    pub fn new(manager: TokenManager, store: Arc<dyn CredentialStore>) -> Self {
        Self { manager, store }
    }

    pub fn status_report(&self) -> StatusReport {
        let stored = self.store.get();
        StatusReport {
            state: self.manager.state(),
            logged_in: self.manager.is_logged_in(),
            refresh_token: stored.as_ref().is_some_and(|c| c.refresh_token.is_some()),
            issued_at: stored.map(|c| c.issued_at),
            usable_for: self.manager.policy().usable_window(),
        }
    }
}

/// Snapshot printed by `pigeon status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub state: TokenState,
    pub logged_in: bool,
    pub refresh_token: bool,
    pub issued_at: Option<chrono::DateTime<chrono::Utc>>,
    usable_for: chrono::Duration,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            TokenState::NoCredential => "none",
            TokenState::Fresh => "valid",
            TokenState::Stale => "stale (will be renewed on next use)",
            TokenState::Refreshing => "refreshing",
            TokenState::AwaitingInteractive => "waiting for sign-in",
            TokenState::PermanentFailure => "revoked (run 'pigeon login')",
        };
        writeln!(f, "Access token: {}", state)?;
        if let Some(issued_at) = self.issued_at {
            writeln!(f, "  issued_at:  {}", issued_at)?;
            writeln!(f, "  renew_at:   {}", issued_at + self.usable_for)?;
        }
        writeln!(
            f,
            "Refresh tok:  {}",
            if self.refresh_token { "present" } else { "none" }
        )?;
        write!(f, "Logged in:    {}", if self.logged_in { "yes" } else { "no" })
    }
}

/// Sign in through the browser unless a usable token already exists.
pub async fn login(session: &Session, force: bool) -> Result<()> {
    let manager = &session.manager;

    if force {
        manager.logout().map_err(|e| anyhow!(e.user_message()))?;
    } else if manager.state() == TokenState::Fresh {
        println!("Already logged in (token valid). Use --force to re-authenticate.");
        return Ok(());
    }

    match manager.ensure_token(true).await {
        Ok(_) => {
            println!("Login successful!");
            Ok(())
        }
        Err(e) => {
            tracing::debug!("Login failed: {:?}", e);
            Err(anyhow!(e.user_message()))
        }
    }
}

pub fn logout(session: &Session) -> Result<()> {
    session
        .manager
        .logout()
        .map_err(|e| anyhow!(e.user_message()))?;
    println!("Logged out.");
    Ok(())
}

/// Display current auth status
pub fn status(session: &Session) -> Result<()> {
    println!("{}", session.status_report());
    Ok(())
}

/// Print a usable access token, renewing silently if needed. Never opens
/// the browser, so it is safe to call from scripts.
pub async fn print_token(session: &Session) -> Result<()> {
    let token = session
        .manager
        .ensure_token(false)
        .await
        .map_err(|e| anyhow!(e.user_message()))?;
    println!("{}", token);
    Ok(())
}
