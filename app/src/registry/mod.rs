use std::collections::HashMap;
use std::sync::Arc;

use coordinator::{CoordinatorEvent, NotReady};
use futures::future::BoxFuture;
use infrastructure::{EventBus, EventEmitter, EventListener};
use support::ExponentialBackoff;
use support::time::Duration;
use tokio::sync::broadcast;

/// One configured instance of an integration.
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    pub id: String,
    pub title: String,
}

#[derive(Debug, derive_more::Display)]
pub enum SetupError {
    /// The source is unreachable right now; setup is retried later.
    #[display("not ready: {_0}")]
    NotReady(NotReady),

    /// Setup cannot succeed without intervention; it is not retried.
    #[display("setup failed: {_0}")]
    Failed(anyhow::Error),
}

impl std::error::Error for SetupError {}

impl From<NotReady> for SetupError {
    fn from(cause: NotReady) -> Self {
        SetupError::NotReady(cause)
    }
}

/// A successfully loaded entry and the future that tears it down again
/// (coordinator shutdown, push transport stop, entity unsubscription).
pub struct LoadedEntry {
    pub entry: ConfigEntry,
    teardown: BoxFuture<'static, ()>,
}

impl LoadedEntry {
    pub fn new(entry: ConfigEntry, teardown: BoxFuture<'static, ()>) -> Self {
        Self { entry, teardown }
    }
}

#[derive(Debug, Clone)]
pub enum PlatformEvent {
    EntryLoaded { entry_id: String },
    EntrySetupRetry { entry_id: String, attempts: u32, next_delay: Duration },
    EntryUnloaded { entry_id: String },
    ReauthRequired { entry_id: String },
}

/// Owns the loaded config entries, one integration instance each. All
/// lookup goes through this explicit map; nothing is stashed in globals.
pub struct EntryManager {
    entries: tokio::sync::Mutex<HashMap<String, LoadedEntry>>,
    events: EventBus<PlatformEvent>,
}

impl EntryManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: tokio::sync::Mutex::new(HashMap::new()),
            events: EventBus::new(32),
        })
    }

    pub fn subscribe(&self) -> EventListener<PlatformEvent> {
        self.events.subscribe()
    }

    fn emitter(&self) -> EventEmitter<PlatformEvent> {
        self.events.emitter()
    }

    /// Sets an entry up in the background. A not-ready integration is
    /// retried with growing delays until it loads; a failed one is dropped.
    pub fn setup_in_background<F, Fut>(self: &Arc<Self>, entry: ConfigEntry, setup: F)
    where
        F: Fn(ConfigEntry) -> Fut + Send + 'static,
        Fut: Future<Output = Result<LoadedEntry, SetupError>> + Send + 'static,
    {
        let manager = self.clone();

        tokio::spawn(async move {
            let mut backoff = ExponentialBackoff::new(Duration::seconds(5), Duration::minutes(10));
            let emitter = manager.emitter();

            loop {
                match setup(entry.clone()).await {
                    Ok(loaded) => {
                        tracing::info!("Config entry {} ({}) loaded", entry.id, entry.title);
                        manager.entries.lock().await.insert(entry.id.clone(), loaded);
                        emitter.send(PlatformEvent::EntryLoaded {
                            entry_id: entry.id.clone(),
                        });
                        return;
                    }
                    Err(SetupError::NotReady(cause)) => {
                        let next_delay = backoff.next_attempt();
                        tracing::warn!(
                            "Config entry {} is not ready (attempt {}), retrying in {}: {}",
                            entry.id,
                            backoff.attempts(),
                            next_delay,
                            cause
                        );
                        emitter.send(PlatformEvent::EntrySetupRetry {
                            entry_id: entry.id.clone(),
                            attempts: backoff.attempts(),
                            next_delay,
                        });
                        tokio::time::sleep(next_delay.into()).await;
                    }
                    Err(SetupError::Failed(cause)) => {
                        tracing::error!("Config entry {} failed to set up: {:?}", entry.id, cause);
                        return;
                    }
                }
            }
        });
    }

    /// Unloads one entry, running its teardown. Returns whether anything
    /// was loaded under that id.
    pub async fn unload(&self, entry_id: &str) -> bool {
        let loaded = self.entries.lock().await.remove(entry_id);

        match loaded {
            Some(loaded) => {
                loaded.teardown.await;
                self.emitter().send(PlatformEvent::EntryUnloaded {
                    entry_id: entry_id.to_string(),
                });
                tracing::info!("Config entry {} unloaded", entry_id);
                true
            }
            None => false,
        }
    }

    pub async fn unload_all(&self) {
        for entry_id in self.loaded_entries().await {
            self.unload(&entry_id).await;
        }
    }

    pub async fn loaded_entries(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Forwards reauth signals of a coordinator onto the platform bus, so
    /// frontends can ask the user to reauthenticate the entry.
    pub fn forward_reauth_events(
        self: &Arc<Self>,
        entry_id: impl Into<String>,
        mut events: broadcast::Receiver<CoordinatorEvent>,
    ) {
        let entry_id = entry_id.into();
        let emitter = self.emitter();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(CoordinatorEvent::ReauthRequired { coordinator }) => {
                        tracing::warn!("{} requires reauthentication by the user", coordinator);
                        emitter.send(PlatformEvent::ReauthRequired {
                            entry_id: entry_id.clone(),
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}
