use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use support::time::{DateTime, Duration};
use tokio_util::sync::CancellationToken;

use crate::error::UpdateError;
use crate::listener::{ListenerHandle, ListenerRegistry};
use crate::refresh::{Flight, RefreshExecutor, RefreshKind};

/// One record of a keyed feed, identified by the id the upstream feed
/// assigns.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry<A> {
    pub external_id: String,
    pub attributes: A,
}

/// A polled source yielding a collection of keyed records instead of one
/// opaque payload. An `Ok` result with no entries means the feed really is
/// empty; communication problems are errors, never an empty collection.
pub trait FeedSource: Send + Sync + 'static {
    type Attributes: Clone + Send + Sync + 'static;

    fn fetch_entries(
        &self,
    ) -> impl Future<Output = Result<Vec<FeedEntry<Self::Attributes>>, UpdateError>> + Send;
}

/// Change notification per external id. Every update round produces at
/// most one event per id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    EntryAdded(String),
    EntryUpdated(String),
    EntryRemoved(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum FeedStatus {
    #[display("OK")]
    Ok,
    #[display("OK_NO_DATA")]
    OkNoData,
    #[display("ERROR")]
    Error,
}

/// Diagnostic side channel for a status entity. Updated on every round,
/// including failed ones and rounds without changes.
#[derive(Debug, Clone)]
pub struct StatusInfo {
    pub status: FeedStatus,
    pub last_update: Option<DateTime>,
    pub last_successful_update: Option<DateTime>,
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub tracked: usize,
}

impl StatusInfo {
    fn initial() -> Self {
        Self {
            status: FeedStatus::OkNoData,
            last_update: None,
            last_successful_update: None,
            created: 0,
            updated: 0,
            removed: 0,
            tracked: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedManagerOptions {
    pub update_interval: Duration,
    pub fetch_timeout: Duration,
}

/// Materializes a dynamic set of entities from one feed: each update
/// diffs the fetched ids against the tracked set and fans out one
/// added/updated/removed event per changed id. The owning integration
/// creates and destroys its entities in response.
pub struct FeedEntityManager<S: FeedSource> {
    name: String,
    source: S,
    update_interval: Duration,
    executor: RefreshExecutor<Vec<FeedEntry<S::Attributes>>>,
    listeners: ListenerRegistry<FeedEvent>,
    status_listeners: ListenerRegistry<StatusInfo>,
    cancel: CancellationToken,
    state: Mutex<FeedState<S::Attributes>>,
}

struct FeedState<A> {
    entries: HashMap<String, A>,
    status: StatusInfo,
    generation: u64,
    timer: Option<CancellationToken>,
    shut_down: bool,
}

impl<S: FeedSource> FeedEntityManager<S> {
    pub fn new(name: impl Into<String>, source: S, options: FeedManagerOptions) -> Arc<Self> {
        let name = name.into();

        Arc::new(Self {
            executor: RefreshExecutor::new(options.fetch_timeout, None),
            listeners: ListenerRegistry::new(name.clone()),
            status_listeners: ListenerRegistry::new(format!("{} status", name)),
            cancel: CancellationToken::new(),
            update_interval: options.update_interval,
            state: Mutex::new(FeedState {
                entries: HashMap::new(),
                status: StatusInfo::initial(),
                generation: 0,
                timer: None,
                shut_down: false,
            }),
            name,
            source,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self, external_id: &str) -> Option<S::Attributes> {
        self.state().entries.get(external_id).cloned()
    }

    pub fn entry_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn status_info(&self) -> StatusInfo {
        self.state().status.clone()
    }

    /// Registers a change listener. Events arrive in a deterministic order
    /// within each round: removals, then updates, then additions, each
    /// sorted by id.
    pub fn add_listener(
        &self,
        callback: impl Fn(&FeedEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.listeners.subscribe(callback)
    }

    /// Registers a listener for the diagnostic status record. It fires once
    /// per update round, also for failed rounds and rounds without changes.
    pub fn add_status_listener(
        &self,
        callback: impl Fn(&StatusInfo) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.status_listeners.subscribe(callback)
    }

    /// Runs the first update and starts the schedule. The first update may
    /// fail; the feed then starts empty with an `ERROR` status and recovers
    /// on a later tick.
    pub async fn start(self: &Arc<Self>) {
        self.update().await;
        self.start_schedule();
    }

    /// One update round: fetch, diff against the tracked ids, fan out.
    /// A failed fetch leaves the tracked entries untouched.
    pub async fn update(&self) {
        let generation = {
            let state = self.state();
            if state.shut_down {
                return;
            }
            state.generation
        };

        let flight = self
            .executor
            .execute(
                RefreshKind::Forced,
                || self.source.fetch_entries(),
                || async { Ok(false) },
            )
            .await;

        let outcome = match flight {
            Flight::Led(outcome) => outcome,
            Flight::Coalesced(_) | Flight::Throttled => return,
        };

        for event in self.apply_entries(generation, outcome) {
            self.listeners.notify_all(&event);
        }

        self.status_listeners.notify_all(&self.status_info());
    }

    fn apply_entries(
        &self,
        generation: u64,
        outcome: Result<Vec<FeedEntry<S::Attributes>>, UpdateError>,
    ) -> Vec<FeedEvent> {
        let now = DateTime::now();
        let mut state = self.state();

        if state.shut_down || state.generation != generation {
            tracing::debug!("Discarding feed update of {} after teardown", self.name);
            return vec![];
        }

        let entries = match outcome {
            Ok(entries) => entries,
            Err(error) => {
                match &error {
                    UpdateError::Unexpected(cause) => {
                        tracing::error!("Unexpected error updating feed {}: {:?}", self.name, cause)
                    }
                    other => tracing::warn!(
                        "Updating feed {} failed, keeping {} tracked entries: {}",
                        self.name,
                        state.entries.len(),
                        other
                    ),
                }

                state.status = StatusInfo {
                    status: FeedStatus::Error,
                    last_update: Some(now),
                    created: 0,
                    updated: 0,
                    removed: 0,
                    ..state.status.clone()
                };
                return vec![];
            }
        };

        let mut current: HashMap<String, S::Attributes> = HashMap::with_capacity(entries.len());
        for entry in entries {
            if current.insert(entry.external_id.clone(), entry.attributes).is_some() {
                tracing::warn!(
                    "Feed {} returned id {} more than once, keeping the last entry",
                    self.name,
                    entry.external_id
                );
            }
        }

        let mut removed: Vec<String> = state
            .entries
            .keys()
            .filter(|id| !current.contains_key(*id))
            .cloned()
            .collect();
        let mut updated: Vec<String> = current
            .keys()
            .filter(|id| state.entries.contains_key(*id))
            .cloned()
            .collect();
        let mut added: Vec<String> = current
            .keys()
            .filter(|id| !state.entries.contains_key(*id))
            .cloned()
            .collect();

        removed.sort();
        updated.sort();
        added.sort();

        tracing::debug!(
            "Feed {} update: {} added, {} updated, {} removed, {} tracked",
            self.name,
            added.len(),
            updated.len(),
            removed.len(),
            current.len()
        );

        state.status = StatusInfo {
            status: if current.is_empty() {
                FeedStatus::OkNoData
            } else {
                FeedStatus::Ok
            },
            last_update: Some(now),
            last_successful_update: Some(now),
            created: added.len(),
            updated: updated.len(),
            removed: removed.len(),
            tracked: current.len(),
        };
        state.entries = current;

        let mut events = Vec::with_capacity(removed.len() + updated.len() + added.len());
        events.extend(removed.into_iter().map(FeedEvent::EntryRemoved));
        events.extend(updated.into_iter().map(FeedEvent::EntryUpdated));
        events.extend(added.into_iter().map(FeedEvent::EntryAdded));
        events
    }

    /// Cancels the schedule and drops tracked ids and listeners. Entities
    /// built from earlier events are the owning integration's to destroy.
    /// Safe to call repeatedly.
    pub fn shutdown(&self) {
        {
            let mut state = self.state();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.generation += 1;
            state.entries.clear();
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
        }

        self.cancel.cancel();
        self.listeners.clear();
        self.status_listeners.clear();
        tracing::debug!("Feed manager {} shut down", self.name);
    }

    fn start_schedule(self: &Arc<Self>) {
        let token = {
            let mut state = self.state();
            if state.shut_down || state.timer.is_some() {
                return;
            }
            let token = self.cancel.child_token();
            state.timer = Some(token.clone());
            token
        };

        let manager = Arc::downgrade(self);
        let interval = self.update_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.into());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            //interval fires immediately; the schedule starts one period out
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(manager) = manager.upgrade() else {
                    break;
                };

                manager.update().await;
            }
        });
    }

    fn state(&self) -> MutexGuard<'_, FeedState<S::Attributes>> {
        self.state.lock().expect("feed state lock poisoned")
    }
}
