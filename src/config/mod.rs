//! Configuration and credential file locations

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::auth::{AuthConfig, ExpiryPolicy, ResponseType};

const DEFAULT_CLIENT_ID: &str =
    "150823808984-d7pcq090c9r3743m2506msjtdssthl7u.apps.googleusercontent.com";

/// Application settings, read from `config.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// OAuth2 client ID (overridden by PIGEON_CLIENT_ID)
    pub client_id: String,
    /// Only for confidential clients (overridden by PIGEON_CLIENT_SECRET)
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    /// Must be an http loopback address; the CLI listens there for the redirect
    pub redirect_uri: String,
    pub response_type: ResponseType,
    /// Mail API base URL
    pub api_base: String,
    /// Provider-defined access token lifetime
    pub nominal_lifetime_secs: u64,
    /// Renew this long before the nominal expiry
    pub expiry_margin_secs: u64,
    pub renewal_interval_secs: u64,
    /// Inbox polling period for `watch`
    pub poll_interval_secs: u64,
    /// Messages inspected per poll
    pub max_messages: u32,
    pub request_timeout_secs: u64,
    /// How long to wait for the browser redirect
    pub consent_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_secret: None,
            auth_url: "https://accounts.google.com/o/oauth2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            scopes: vec!["https://www.googleapis.com/auth/gmail.readonly".to_string()],
            redirect_uri: "http://127.0.0.1:8765/callback".to_string(),
            response_type: ResponseType::Code,
            api_base: "https://gmail.googleapis.com/gmail/v1".to_string(),
            nominal_lifetime_secs: 60 * 60,
            expiry_margin_secs: 5 * 60,
            renewal_interval_secs: 15 * 60,
            poll_interval_secs: 60,
            max_messages: 5,
            request_timeout_secs: 30,
            consent_timeout_secs: 5 * 60,
        }
    }
}

impl Settings {
    /// Get config directory path
    pub fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "pigeon", "pigeon")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Credential store file path
    pub fn credentials_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("credentials.toml"))
    }

    /// Load settings from disk, apply environment overrides, and validate
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        let mut settings = if path.exists() {
            let content = fs::read_to_string(&path).context("Failed to read config file")?;
            Self::parse(&content)?
        } else {
            Self::default()
        };

        if let Ok(id) = std::env::var("PIGEON_CLIENT_ID") {
            settings.client_id = id;
        }
        if let Ok(secret) = std::env::var("PIGEON_CLIENT_SECRET") {
            settings.client_secret = Some(secret);
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            bail!("client_id must not be empty");
        }
        if self.nominal_lifetime_secs == 0 {
            bail!("nominal_lifetime_secs must be positive");
        }
        if self.expiry_margin_secs >= self.nominal_lifetime_secs {
            bail!(
                "expiry_margin_secs ({}) must be smaller than nominal_lifetime_secs ({})",
                self.expiry_margin_secs,
                self.nominal_lifetime_secs
            );
        }
        let window = self.nominal_lifetime_secs - self.expiry_margin_secs;
        if self.renewal_interval_secs == 0 || self.renewal_interval_secs >= window {
            bail!(
                "renewal_interval_secs ({}) must be between 1 and {} (lifetime minus margin)",
                self.renewal_interval_secs,
                window - 1
            );
        }
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be positive");
        }
        if self.max_messages == 0 {
            bail!("max_messages must be positive");
        }

        let redirect = self.redirect_url()?;
        let loopback = matches!(
            redirect.host_str(),
            Some("127.0.0.1") | Some("localhost") | Some("[::1]")
        );
        if redirect.scheme() != "http" || !loopback {
            bail!(
                "redirect_uri must be an http loopback address, got {}",
                self.redirect_uri
            );
        }
        Ok(())
    }

    pub fn redirect_url(&self) -> Result<Url> {
        Url::parse(&self.redirect_uri).context("Invalid redirect_uri")
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            auth_url: self.auth_url.clone(),
            token_url: self.token_url.clone(),
            scopes: self.scopes.clone(),
            redirect_uri: self.redirect_uri.clone(),
            response_type: self.response_type,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::new(
            chrono::Duration::seconds(self.nominal_lifetime_secs as i64),
            chrono::Duration::seconds(self.expiry_margin_secs as i64),
        )
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn consent_timeout(&self) -> Duration {
        Duration::from_secs(self.consent_timeout_secs)
    }
}
