//! REST backend - HTTP communication with the hosted bookmarks table
//!
//! Speaks the PostgREST dialect exposed by the hosted database:
//! - Row filters as `column=eq.value` query parameters
//! - `apikey` header plus bearer token on every request
//! - Change stream emulated by polling and diffing row versions

use super::models::{ChangeEvent, ChangeKind};
use super::remote::{RemoteBackend, RemoteError};
use crate::models::Bookmark;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

const TABLE_PATH: &str = "rest/v1/bookmarks";
const REQUEST_TIMEOUT_SECS: u64 = 30;
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Client for the hosted bookmarks table
#[derive(Clone)]
pub struct RestBackend {
    client: Client,
    base_url: String,
    api_key: String,
    /// User JWT; the api key doubles as bearer when absent
    access_token: Arc<RwLock<Option<String>>>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl RestBackend {
    pub fn new(base_url: &str, api_key: &str, poll_interval: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            access_token: Arc::new(RwLock::new(None)),
            poll_interval,
            shutdown: CancellationToken::new(),
        })
    }

    /// Set access token (after sign-in)
    pub async fn set_token(&self, token: String) {
        let mut guard = self.access_token.write().await;
        *guard = Some(token);
    }

    pub async fn get_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    /// Clear token (sign-out)
    pub async fn clear_token(&self) {
        let mut guard = self.access_token.write().await;
        *guard = None;
    }

    /// Stop every change poller
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn table_url(&self) -> String {
        format!("{}/{}", self.base_url, TABLE_PATH)
    }

    async fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .get_token()
            .await
            .unwrap_or_else(|| self.api_key.clone());
        builder.header("apikey", &self.api_key).bearer_auth(bearer)
    }

    async fn select_where(&self, filters: &[(&str, String)]) -> Result<Vec<Bookmark>, RemoteError> {
        let mut query: Vec<(&str, String)> = filters.to_vec();
        query.push(("select", "*".to_string()));
        query.push(("order", "created_at.desc".to_string()));

        let request = self.authorize(self.client.get(self.table_url()).query(&query)).await;
        let response = request.send().await?;
        handle_response(response).await
    }
}

#[async_trait]
impl RemoteBackend for RestBackend {
    async fn select_bookmarks(&self, user_id: &str) -> Result<Vec<Bookmark>, RemoteError> {
        self.select_where(&[("user_id", format!("eq.{}", user_id))]).await
    }

    async fn fetch_bookmark(&self, user_id: &str, id: &str) -> Result<Option<Bookmark>, RemoteError> {
        let rows = self
            .select_where(&[("id", format!("eq.{}", id)), ("user_id", format!("eq.{}", user_id))])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_bookmark(&self, bookmark: &Bookmark) -> Result<(), RemoteError> {
        let request = self
            .authorize(
                self.client
                    .post(self.table_url())
                    .header("Prefer", "return=minimal")
                    .json(bookmark),
            )
            .await;
        let response = request.send().await?;
        handle_empty(response).await
    }

    async fn update_bookmark(&self, bookmark: &Bookmark) -> Result<(), RemoteError> {
        let request = self
            .authorize(
                self.client
                    .patch(self.table_url())
                    .query(&[
                        ("id", format!("eq.{}", bookmark.id)),
                        ("user_id", format!("eq.{}", bookmark.user_id)),
                    ])
                    .header("Prefer", "return=representation")
                    .json(bookmark),
            )
            .await;
        let response = request.send().await?;
        let rows: Vec<Bookmark> = handle_response(response).await?;

        if rows.is_empty() {
            return Err(RemoteError::NotFound);
        }
        Ok(())
    }

    async fn delete_bookmark(&self, user_id: &str, id: &str) -> Result<bool, RemoteError> {
        let request = self
            .authorize(
                self.client
                    .delete(self.table_url())
                    .query(&[("id", format!("eq.{}", id)), ("user_id", format!("eq.{}", user_id))])
                    .header("Prefer", "return=representation"),
            )
            .await;
        let response = request.send().await?;
        let rows: Vec<Bookmark> = handle_response(response).await?;
        Ok(!rows.is_empty())
    }

    async fn subscribe(&self, user_id: &str) -> Result<broadcast::Receiver<ChangeEvent>, RemoteError> {
        let (tx, rx) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        // Baseline so only later changes are reported
        let mut snapshot = index_rows(self.select_bookmarks(user_id).await?);
        let this = self.clone();
        let user_id = user_id.to_string();

        tokio::spawn(async move {
            log::info!("Polling bookmark changes for {} every {:?}", user_id, this.poll_interval);
            let mut ticker = tokio::time::interval(this.poll_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if tx.receiver_count() == 0 {
                    break;
                }

                match this.select_bookmarks(&user_id).await {
                    Ok(rows) => {
                        let current = index_rows(rows);
                        for event in diff_snapshots(&user_id, &snapshot, &current) {
                            let _ = tx.send(event);
                        }
                        snapshot = current;
                    }
                    Err(e) => log::debug!("Change poll failed for {}: {}", user_id, e),
                }
            }

            log::debug!("Change poller for {} stopped", user_id);
        });

        Ok(rx)
    }
}

fn index_rows(rows: Vec<Bookmark>) -> HashMap<String, Bookmark> {
    rows.into_iter().map(|row| (row.id.clone(), row)).collect()
}

/// Change events that turn `before` into `after`
fn diff_snapshots(
    user_id: &str,
    before: &HashMap<String, Bookmark>,
    after: &HashMap<String, Bookmark>,
) -> Vec<ChangeEvent> {
    let mut events = Vec::new();

    for (id, row) in after {
        let kind = match before.get(id) {
            None => ChangeKind::Insert,
            Some(old) if old.version != row.version => ChangeKind::Update,
            Some(_) => continue,
        };
        events.push(ChangeEvent {
            kind,
            user_id: user_id.to_string(),
            object_id: id.clone(),
            version: row.version,
            record: Some(row.clone()),
        });
    }

    for (id, old) in before {
        if !after.contains_key(id) {
            events.push(ChangeEvent {
                kind: ChangeKind::Delete,
                user_id: user_id.to_string(),
                object_id: id.clone(),
                version: old.version,
                record: None,
            });
        }
    }

    events
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RemoteError> {
    let status = response.status();

    if status.is_success() {
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    } else {
        Err(handle_error(response).await)
    }
}

async fn handle_empty(response: reqwest::Response) -> Result<(), RemoteError> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to RemoteError
async fn handle_error(response: reqwest::Response) -> RemoteError {
    let status = response.status();

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized,
        StatusCode::NOT_FOUND => RemoteError::NotFound,
        StatusCode::CONFLICT => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            RemoteError::Conflict(msg)
        }
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited,
        _ => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            RemoteError::Server {
                status: status.as_u16(),
                message: msg,
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
