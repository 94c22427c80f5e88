//! Connectivity monitor
//!
//! Process-local online/offline signal shared by the cache, the sync service
//! and the request interception layer. Subscribers get a `watch` receiver so a
//! late subscriber always sees the current state. An optional probe loop
//! updates the signal from a periodic HTTP HEAD request.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PROBE_TIMEOUT_SECS: u64 = 5;

#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update the signal, returning `true` if the state changed
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            if online {
                log::info!("Connectivity restored");
            } else {
                log::warn!("Connectivity lost, switching to offline mode");
            }
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Probe `url` every `interval` until `cancel` fires
    pub fn spawn_probe(
        &self,
        url: String,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();

        tokio::spawn(async move {
            let client = match reqwest::Client::builder()
                .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
                .build()
            {
                Ok(client) => client,
                Err(e) => {
                    log::error!("Failed to build connectivity probe client: {}", e);
                    return;
                }
            };

            log::info!("Connectivity probe started: {} every {:?}", url, interval);
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let online = probe_once(&client, &url).await;
                        this.set_online(online);
                    }
                }
            }

            log::info!("Connectivity probe stopped");
        })
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Any HTTP response counts as online; only transport failures count as offline
async fn probe_once(client: &reqwest::Client, url: &str) -> bool {
    match client.head(url).send().await {
        Ok(_) => true,
        Err(e) => {
            log::debug!("Connectivity probe failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[test]
    fn test_set_online_reports_changes() {
        let connectivity = Connectivity::new(true);

        assert!(!connectivity.set_online(true));
        assert!(connectivity.set_online(false));
        assert!(!connectivity.is_online());
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let connectivity = Connectivity::new(false);
        let mut rx = connectivity.subscribe();

        connectivity.set_online(true);

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_probe_marks_online() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("HEAD", "/ping")
            .with_status(204)
            .create_async()
            .await;

        let connectivity = Connectivity::new(false);
        let mut rx = connectivity.subscribe();
        let cancel = CancellationToken::new();
        let handle = connectivity.spawn_probe(
            format!("{}/ping", server.url()),
            Duration::from_millis(50),
            cancel.clone(),
        );

        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(connectivity.is_online());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_marks_offline_on_transport_error() {
        let connectivity = Connectivity::new(true);
        let mut rx = connectivity.subscribe();
        let cancel = CancellationToken::new();
        let handle = connectivity.spawn_probe(
            "http://127.0.0.1:1/ping".to_string(),
            Duration::from_millis(50),
            cancel.clone(),
        );

        tokio::time::timeout(Duration::from_secs(10), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(!connectivity.is_online());

        cancel.cancel();
        handle.await.unwrap();
    }
}
