//! Account model

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::unix_timestamp_ms;

/// An authenticated or anonymous account.
///
/// Invariant: `is_anonymous` exactly when `email` is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: Option<String>,
    pub is_anonymous: bool,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
}

impl Account {
    /// An account registered with an email credential.
    pub fn registered(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: Some(email.into()),
            is_anonymous: false,
            created_at: unix_timestamp_ms(),
        }
    }

    /// A remote-issued anonymous session.
    pub fn anonymous(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            is_anonymous: true,
            created_at: unix_timestamp_ms(),
        }
    }

    /// A locally synthesized anonymous identity, used when the remote
    /// anonymous sign-in times out or fails so the app stays usable offline.
    ///
    /// Known limitation: this identity is not guaranteed reconcilable with a
    /// later remote session; records created under it stay in the local
    /// anonymous scope until migrated explicitly.
    #[must_use]
    pub fn local_fallback() -> Self {
        Self::anonymous(format!("local-{}", Uuid::new_v4()))
    }

    /// True for identities synthesized by [`Self::local_fallback`].
    pub fn is_local_fallback(&self) -> bool {
        self.id.starts_with("local-")
    }
}
