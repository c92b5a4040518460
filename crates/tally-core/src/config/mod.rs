//! Backend configuration for client apps.
//!
//! A `BackendConfig` is built once at startup and handed to
//! [`crate::backend::BackendService::init`]; the chosen backend is never
//! hot-swapped in production.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{is_http_url, normalize_text_option};

/// Which concrete backend implementation to run against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local SQLite store; also the development/offline backend
    #[default]
    Sqlite,
    /// Remote Supabase-style REST provider
    Rest,
}

/// Startup configuration selecting and parameterizing the active backend.
///
/// These are safe-to-ship public endpoints/keys; secret credentials must
/// never be stored here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    /// Database path for the SQLite backend; `None` means in-memory
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
    /// Base URL of the REST provider, e.g. `https://demo.supabase.co`
    #[serde(default)]
    pub api_url: Option<String>,
    /// Publishable API key for the REST provider
    #[serde(default)]
    pub api_key: Option<String>,
}

impl BackendConfig {
    /// Configuration for a local SQLite backend at `path`.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: BackendKind::Sqlite,
            sqlite_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Configuration for an in-memory SQLite backend (tests, previews).
    #[must_use]
    pub fn sqlite_in_memory() -> Self {
        Self {
            kind: BackendKind::Sqlite,
            ..Self::default()
        }
    }

    /// Configuration for the REST backend.
    pub fn rest(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            kind: BackendKind::Rest,
            api_url: Some(api_url.into()),
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Validate the configuration, normalizing text fields.
    ///
    /// Failures here are fatal at startup; nothing retries a bad config.
    pub fn validated(mut self) -> Result<Self> {
        self.api_url = normalize_text_option(self.api_url.take());
        self.api_key = normalize_text_option(self.api_key.take());

        if self.kind == BackendKind::Rest {
            let url = self.api_url.as_deref().ok_or_else(|| {
                Error::Configuration("REST backend requires api_url".to_string())
            })?;
            if !is_http_url(url) {
                return Err(Error::Configuration(
                    "api_url must include http:// or https://".to_string(),
                ));
            }
            if self.api_key.is_none() {
                return Err(Error::Configuration(
                    "REST backend requires api_key".to_string(),
                ));
            }
        }
        Ok(self)
    }
}
