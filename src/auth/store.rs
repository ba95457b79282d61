//! File-backed credential store
//!
//! Keeps `authToken`, `authTimestamp` (epoch milliseconds) and `refreshToken`
//! in a TOML file next to the settings file.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::{AuthError, Credential, CredentialStore};

/// On-disk layout. Every key is optional so that a hand-edited or truncated
/// file still parses; incomplete records are reported as no credential.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredEntries {
    #[serde(rename = "authToken", skip_serializing_if = "Option::is_none")]
    auth_token: Option<String>,
    #[serde(rename = "authTimestamp", skip_serializing_if = "Option::is_none")]
    auth_timestamp: Option<i64>,
    #[serde(rename = "refreshToken", skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
}

impl StoredEntries {
    fn into_credential(self) -> Option<Credential> {
        let access_token = self.auth_token.filter(|t| !t.is_empty())?;
        let issued_at: DateTime<Utc> = Utc.timestamp_millis_opt(self.auth_timestamp?).single()?;
        Some(Credential {
            access_token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            issued_at,
        })
    }
}

impl From<&Credential> for StoredEntries {
    fn from(c: &Credential) -> Self {
        Self {
            auth_token: Some(c.access_token.clone()),
            auth_timestamp: Some(c.issued_at.timestamp_millis()),
            refresh_token: c.refresh_token.clone(),
        }
    }
}

/// Credential store persisted to a single file.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Option<StoredEntries> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read credentials file {}: {}", self.path.display(), e);
                return None;
            }
        };
        match toml::from_str(&content) {
            Ok(entries) => Some(entries),
            Err(e) => {
                tracing::warn!("Ignoring unparsable credentials file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    fn write_entries(&self, entries: &StoredEntries) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let content = toml::to_string_pretty(entries)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // Uniquely named sibling, created owner-only, renamed over the target
        // so readers see either the old record or the new one.
        let mut tmp = NamedTempFile::new_in(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Option<Credential> {
        let credential = self.read_entries()?.into_credential();
        if credential.is_none() {
            tracing::debug!("Credentials file has no complete access token record");
        }
        credential
    }

    fn set(&self, credential: &Credential) -> Result<(), AuthError> {
        self.write_entries(&StoredEntries::from(credential))
            .map_err(|e| {
                AuthError::Storage(format!("write {}: {}", self.path.display(), e))
            })
    }

    fn clear(&self) -> Result<(), AuthError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthError::Storage(format!(
                "remove {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}
