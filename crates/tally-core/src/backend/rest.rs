//! Supabase-style REST backend
//!
//! Records go through a PostgREST-shaped `rest/v1/records` endpoint and auth
//! through a GoTrue-shaped `auth/v1` endpoint. Only the capability shape is
//! assumed here; the provider's realtime push channel is a wire-protocol
//! concern outside this crate, so subscribers are notified from local
//! knowledge changes with the same full-result-set contract.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;

use crate::backend::{
    AuthCallback, AuthSubscribers, Backend, RecordSubscribers, RecordsCallback, Subscription,
};
use crate::error::{Error, Result};
use crate::models::{
    select_ready_work, Account, Record, RecordId, RecordPatch, StoredRecord, StoredSyncStatus,
    SyncOperation, SyncQueueEntry,
};
use crate::util::{compact_text, is_http_url, unix_timestamp_ms};

/// Bound on the remote anonymous sign-in attempt before falling back to a
/// locally synthesized identity. The only explicit timeout in the system.
const ANONYMOUS_SIGN_IN_TIMEOUT: Duration = Duration::from_secs(10);

struct SessionState {
    account: Account,
    access_token: String,
}

/// REST provider implementation
pub struct RestBackend {
    base_url: String,
    api_key: String,
    client: Client,
    session: Mutex<Option<SessionState>>,
    /// Process-lifetime queue: entries describe local work not yet pushed
    queue: Mutex<HashMap<String, SyncQueueEntry>>,
    record_subscribers: RecordSubscribers,
    auth_subscribers: AuthSubscribers,
}

impl fmt::Debug for RestBackend {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RestBackend")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl RestBackend {
    pub fn new(base_url: impl AsRef<str>, api_key: impl Into<String>) -> Result<Self> {
        let base_url = normalize_base_url(base_url.as_ref())?;
        let api_key = api_key.into().trim().to_string();
        if api_key.is_empty() {
            return Err(Error::Configuration(
                "API key must not be empty".to_string(),
            ));
        }
        Ok(Self {
            base_url,
            api_key,
            client: Client::builder().build()?,
            session: Mutex::new(None),
            queue: Mutex::new(HashMap::new()),
            record_subscribers: RecordSubscribers::default(),
            auth_subscribers: AuthSubscribers::default(),
        })
    }

    fn records_url(&self) -> String {
        format!("{}/rest/v1/records", self.base_url)
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{path}", self.base_url)
    }

    /// Attach the apikey and the strongest available bearer token.
    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .session
            .lock()
            .expect("session state poisoned")
            .as_ref()
            .map_or_else(|| self.api_key.clone(), |s| s.access_token.clone());
        request
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
    }

    async fn fetch_rows(&self, query: &[(&str, String)]) -> Result<Vec<StoredRecord>> {
        let response = self
            .authorized(self.client.get(self.records_url()).query(query))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(parse_api_error(status, &body)));
        }
        Ok(response.json::<Vec<StoredRecord>>().await?)
    }

    async fn fetch_row(&self, id: &str) -> Result<StoredRecord> {
        let rows = self
            .fetch_rows(&[("id", format!("eq.{id}"))])
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn set_session(&self, account: Account, access_token: String) {
        *self.session.lock().expect("session state poisoned") = Some(SessionState {
            account: account.clone(),
            access_token,
        });
        self.auth_subscribers.notify(Some(&account));
    }

    async fn auth_request(&self, request: RequestBuilder) -> Result<AuthResponse> {
        let response = request
            .header("apikey", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(parse_api_error(status, &body)));
        }
        Ok(response.json::<AuthResponse>().await?)
    }

    async fn remote_anonymous_sign_in(&self) -> Result<Account> {
        let payload = serde_json::json!({});
        let response = self
            .auth_request(self.client.post(self.auth_url("signup")).json(&payload))
            .await?;
        response.account()
    }

    /// Re-query a scope and push the full set to matching subscribers.
    async fn notify_scope(&self, owner_id: Option<&str>) {
        if !self
            .record_subscribers
            .active_scopes()
            .iter()
            .any(|scope| scope.as_deref() == owner_id)
        {
            return;
        }
        match self.list_records(owner_id).await {
            Ok(records) => self.record_subscribers.notify(owner_id, &records),
            Err(error) => tracing::warn!("Failed to refresh scope for subscribers: {error}"),
        }
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn create_record(&self, record: &Record) -> Result<Record> {
        let mut acknowledged = record.clone();
        if acknowledged.id.is_temporary() {
            acknowledged.id = RecordId::new();
        }
        let mut row = acknowledged.to_storage_format();
        row.sync_status = StoredSyncStatus::Synced;

        let response = self
            .authorized(
                self.client
                    .post(self.records_url())
                    .header("Prefer", "return=representation")
                    .json(&vec![row]),
            )
            .send()
            .await
            .map_err(|e| Error::Http(e).during("create record"))?;

        match response.status() {
            status if status.is_success() => {
                let rows = response.json::<Vec<StoredRecord>>().await?;
                let stored = rows.into_iter().next().ok_or_else(|| {
                    Error::Transport("Failed to create record: empty representation".to_string())
                })?;
                let created = Record::from_storage_format(&stored)?;
                self.notify_scope(created.owner_id.as_deref()).await;
                Ok(created)
            }
            StatusCode::CONFLICT => Err(Error::AlreadyExists(acknowledged.id.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::Transport(parse_api_error(status, &body)).during("create record"))
            }
        }
    }

    async fn list_records(&self, owner_id: Option<&str>) -> Result<Vec<Record>> {
        let scope = owner_id.map_or_else(|| "is.null".to_string(), |owner| format!("eq.{owner}"));
        let rows = self
            .fetch_rows(&[
                ("owner_id", scope),
                ("order", "updated_at.desc".to_string()),
            ])
            .await
            .map_err(|e| e.during("list records"))?;
        rows.iter().map(Record::from_storage_format).collect()
    }

    async fn update_record(&self, id: &str, patch: &RecordPatch) -> Result<Record> {
        if patch.is_empty() {
            return Err(Error::validation("patch", "no fields to update"));
        }
        if patch.deleted == Some(true) {
            return Err(Error::validation(
                "deleted",
                "deletions go through delete_record",
            ));
        }

        // Fetch first: a missing record is NotFound, not a transport error,
        // and the guard comparison needs the current remote row.
        let existing = self.fetch_row(id).await.map_err(|e| e.during("update record"))?;
        let remote = Record::from_storage_format(&existing)?;
        if let Some(expected) = patch.expected_updated_at {
            if remote.updated_at != expected {
                return Err(Error::Conflict {
                    record_id: id.to_string(),
                    remote: serde_json::to_value(&existing)?,
                });
            }
        }

        let name = match &patch.name {
            Some(raw) => crate::models::sanitize_name(raw)?,
            None => remote.name.clone(),
        };
        let updated_at = chrono::DateTime::from_timestamp_millis(
            unix_timestamp_ms().max(remote.updated_at + 1),
        )
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

        let response = self
            .authorized(
                self.client
                    .patch(self.records_url())
                    .query(&[("id", format!("eq.{id}"))])
                    .header("Prefer", "return=representation")
                    .json(&serde_json::json!({
                        "name": name,
                        "updated_at": updated_at,
                        "sync_status": "synced",
                    })),
            )
            .send()
            .await
            .map_err(|e| Error::Http(e).during("update record"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(parse_api_error(status, &body)).during("update record"));
        }
        let rows = response.json::<Vec<StoredRecord>>().await?;
        let stored = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let updated = Record::from_storage_format(&stored)?;
        self.notify_scope(updated.owner_id.as_deref()).await;
        Ok(updated)
    }

    async fn delete_record(&self, id: &str) -> Result<()> {
        let existing = self.fetch_row(id).await.map_err(|e| e.during("delete record"))?;

        let response = self
            .authorized(
                self.client
                    .delete(self.records_url())
                    .query(&[("id", format!("eq.{id}"))]),
            )
            .send()
            .await
            .map_err(|e| Error::Http(e).during("delete record"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(parse_api_error(status, &body)).during("delete record"));
        }
        self.notify_scope(existing.owner_id.as_deref()).await;
        Ok(())
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<Account> {
        validate_credentials(email, password)?;
        let payload = serde_json::json!({ "email": email, "password": password });
        let response = self
            .auth_request(self.client.post(self.auth_url("signup")).json(&payload))
            .await
            .map_err(|e| e.during("sign up"))?;
        let account = response.account()?;
        if let Some(token) = response_token(&response) {
            self.set_session(account.clone(), token);
        }
        Ok(account)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Account> {
        validate_credentials(email, password)?;
        let payload = serde_json::json!({ "email": email, "password": password });
        let response = self
            .auth_request(
                self.client
                    .post(self.auth_url("token"))
                    .query(&[("grant_type", "password")])
                    .json(&payload),
            )
            .await
            .map_err(|e| e.during("sign in"))?;
        let account = response.account()?;
        if let Some(token) = response_token(&response) {
            self.set_session(account.clone(), token);
        }
        Ok(account)
    }

    async fn sign_in_anonymously(&self) -> Result<Account> {
        match tokio::time::timeout(ANONYMOUS_SIGN_IN_TIMEOUT, self.remote_anonymous_sign_in())
            .await
        {
            Ok(Ok(account)) => {
                self.set_session(account.clone(), self.api_key.clone());
                Ok(account)
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    "Remote anonymous sign-in failed, using local fallback identity: {error}"
                );
                let account = Account::local_fallback();
                self.set_session(account.clone(), self.api_key.clone());
                Ok(account)
            }
            Err(_elapsed) => {
                tracing::warn!(
                    "Remote anonymous sign-in timed out after {:?}, using local fallback identity",
                    ANONYMOUS_SIGN_IN_TIMEOUT
                );
                let account = Account::local_fallback();
                self.set_session(account.clone(), self.api_key.clone());
                Ok(account)
            }
        }
    }

    async fn current_account(&self) -> Result<Option<Account>> {
        Ok(self
            .session
            .lock()
            .expect("session state poisoned")
            .as_ref()
            .map(|s| s.account.clone()))
    }

    async fn sign_out(&self) -> Result<()> {
        let token = self
            .session
            .lock()
            .expect("session state poisoned")
            .take()
            .map(|s| s.access_token);

        if let Some(token) = token {
            // UNAUTHORIZED just means the token already lapsed remotely.
            let response = self
                .client
                .post(self.auth_url("logout"))
                .header("apikey", &self.api_key)
                .bearer_auth(token)
                .send()
                .await;
            match response {
                Ok(response)
                    if !(response.status().is_success()
                        || response.status() == StatusCode::UNAUTHORIZED) =>
                {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    tracing::warn!("Remote sign-out failed: {}", parse_api_error(status, &body));
                }
                Ok(_) => {}
                Err(error) => tracing::warn!("Remote sign-out failed: {error}"),
            }
        }
        self.auth_subscribers.notify(None);
        Ok(())
    }

    async fn put_queue_entry(&self, entry: &SyncQueueEntry) -> Result<()> {
        self.queue
            .lock()
            .expect("queue state poisoned")
            .insert(entry.record_id.clone(), entry.clone());
        Ok(())
    }

    async fn pending_queue_entries(&self) -> Result<Vec<SyncQueueEntry>> {
        let entries: Vec<SyncQueueEntry> = self
            .queue
            .lock()
            .expect("queue state poisoned")
            .values()
            .cloned()
            .collect();
        Ok(select_ready_work(&entries, unix_timestamp_ms()))
    }

    async fn all_queue_entries(&self) -> Result<Vec<SyncQueueEntry>> {
        let mut entries: Vec<SyncQueueEntry> = self
            .queue
            .lock()
            .expect("queue state poisoned")
            .values()
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.pending_since);
        Ok(entries)
    }

    async fn mark_complete(&self, record_id: &str) -> Result<()> {
        self.queue
            .lock()
            .expect("queue state poisoned")
            .remove(record_id);
        Ok(())
    }

    async fn mark_error(&self, record_id: &str, message: &str) -> Result<()> {
        let mut queue = self.queue.lock().expect("queue state poisoned");
        let entry = match queue.get(record_id) {
            Some(entry) if entry.is_permanently_failed() => SyncQueueEntry {
                last_error: Some(message.to_string()),
                ..entry.clone()
            },
            Some(entry) => entry.record_failure(message, unix_timestamp_ms())?,
            None => SyncQueueEntry::enqueue(record_id, "record", SyncOperation::Update, None)?
                .record_failure(message, unix_timestamp_ms())?,
        };
        queue.insert(record_id.to_string(), entry);
        Ok(())
    }

    async fn reset_queue_entry(&self, record_id: &str) -> Result<()> {
        let mut queue = self.queue.lock().expect("queue state poisoned");
        let entry = queue
            .get(record_id)
            .ok_or_else(|| Error::NotFound(record_id.to_string()))?
            .reset();
        queue.insert(record_id.to_string(), entry);
        Ok(())
    }

    fn subscribe_to_records(
        &self,
        owner_id: Option<&str>,
        callback: RecordsCallback,
    ) -> Subscription {
        self.record_subscribers.subscribe(owner_id, callback)
    }

    fn subscribe_to_auth_state(&self, callback: AuthCallback) -> Subscription {
        self.auth_subscribers.subscribe(callback)
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: Option<String>,
    user: Option<AuthUser>,
    // Some deployments nest the user at the top level of a session object
    session: Option<Box<AuthResponse>>,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
    email: Option<String>,
}

impl AuthResponse {
    fn account(&self) -> Result<Account> {
        let user = self
            .user
            .as_ref()
            .or_else(|| self.session.as_ref().and_then(|s| s.user.as_ref()))
            .ok_or_else(|| {
                Error::Transport("Auth response did not include a user".to_string())
            })?;
        Ok(match &user.email {
            Some(email) => Account::registered(user.id.clone(), email.clone()),
            None => Account::anonymous(user.id.clone()),
        })
    }
}

fn response_token(response: &AuthResponse) -> Option<String> {
    response
        .access_token
        .clone()
        .or_else(|| response.session.as_ref().and_then(|s| s.access_token.clone()))
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    error_description: Option<String>,
    message: Option<String>,
    msg: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload
            .message
            .or(payload.msg)
            .or(payload.error_description)
            .or(payload.error)
        {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_base_url(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::Configuration(
            "API base URL must not be empty".to_string(),
        ));
    }
    if !is_http_url(trimmed) {
        return Err(Error::Configuration(
            "API base URL must include http:// or https://".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

fn validate_credentials(email: &str, password: &str) -> Result<()> {
    if email.trim().is_empty() {
        return Err(Error::validation("email", "must not be empty"));
    }
    if password.trim().is_empty() {
        return Err(Error::validation("password", "must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_base_url_trims_trailing_slash() {
        assert_eq!(
            normalize_base_url("https://demo.supabase.co/").unwrap(),
            "https://demo.supabase.co"
        );
    }

    #[test]
    fn normalize_base_url_rejects_invalid_values() {
        assert!(normalize_base_url("").is_err());
        assert!(normalize_base_url("demo.supabase.co").is_err());
    }

    #[test]
    fn debug_redacts_api_key() {
        let backend = RestBackend::new("https://demo.supabase.co", "secret-key").unwrap();
        let rendered = format!("{backend:?}");
        assert!(!rendered.contains("secret-key"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn parse_api_error_prefers_json_message() {
        let message = parse_api_error(
            StatusCode::BAD_REQUEST,
            r#"{"msg": "Signup requires a valid password"}"#,
        );
        assert_eq!(message, "Signup requires a valid password (400)");
    }

    #[test]
    fn parse_api_error_falls_back_to_body_text() {
        assert_eq!(
            parse_api_error(StatusCode::BAD_GATEWAY, ""),
            "HTTP 502"
        );
        assert_eq!(
            parse_api_error(StatusCode::BAD_GATEWAY, " upstream unavailable "),
            "upstream unavailable (502)"
        );
    }

    #[test]
    fn auth_response_parses_nested_session() {
        let response: AuthResponse = serde_json::from_str(
            r#"{"session": {"access_token": "token", "user": {"id": "user-1", "email": "a@b.co"}}}"#,
        )
        .unwrap();
        let account = response.account().unwrap();
        assert_eq!(account.id, "user-1");
        assert!(!account.is_anonymous);
        assert_eq!(response_token(&response).as_deref(), Some("token"));
    }

    #[test]
    fn auth_response_without_email_is_anonymous() {
        let response: AuthResponse = serde_json::from_str(
            r#"{"access_token": "token", "user": {"id": "anon-1", "email": null}}"#,
        )
        .unwrap();
        let account = response.account().unwrap();
        assert!(account.is_anonymous);
        assert!(account.email.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn anonymous_sign_in_falls_back_when_unreachable() {
        // Connection refused locally; must fall back instead of erroring.
        let backend = RestBackend::new("http://127.0.0.1:9", "anon-key").unwrap();
        let account = backend.sign_in_anonymously().await.unwrap();
        assert!(account.is_anonymous);
        assert!(account.email.is_none());
        assert!(account.is_local_fallback());

        let session = backend.current_account().await.unwrap().unwrap();
        assert_eq!(session.id, account.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_rejects_tombstone_patches_before_any_request() {
        // Rejected during validation; nothing is sent over the wire.
        let backend = RestBackend::new("http://127.0.0.1:9", "anon-key").unwrap();
        let err = backend
            .update_record("record-1", &RecordPatch::tombstone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "deleted", .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queue_operations_are_self_contained() {
        let backend = RestBackend::new("https://demo.supabase.co", "anon-key").unwrap();
        backend.mark_error("record-1", "boom").await.unwrap();

        let entries = backend.all_queue_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempts, 1);

        backend.reset_queue_entry("record-1").await.unwrap();
        let pending = backend.pending_queue_entries().await.unwrap();
        assert_eq!(pending[0].attempts, 0);

        backend.mark_complete("record-1").await.unwrap();
        assert!(backend.all_queue_entries().await.unwrap().is_empty());
    }

    #[test]
    fn empty_credentials_are_rejected() {
        assert!(validate_credentials("", "password").is_err());
        assert!(validate_credentials("user@example.com", " ").is_err());
        assert!(validate_credentials("user@example.com", "password").is_ok());
    }
}
