use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::coordinator::UpdateCoordinator;
use crate::error::UpdateError;
use crate::source::DataSource;

/// Traffic arriving from a push transport: decoded device events, or
/// failures the transport surfaces in-band.
#[derive(Debug)]
pub enum PushMessage<M> {
    Event(M),
    TransportError(UpdateError),
}

/// The inbound channel of a push-capable integration. Reconnecting and
/// backoff are the transport's own business; the bridge only starts and
/// stops it.
pub trait PushTransport: Send + Sync + 'static {
    type Message: Send + 'static;

    fn start_listener(
        &self,
        sink: mpsc::Sender<PushMessage<Self::Message>>,
    ) -> impl Future<Output = Result<(), UpdateError>> + Send;

    fn stop_listener(&self) -> impl Future<Output = ()> + Send;
}

/// A data source that can also fold pushed messages into its snapshot.
pub trait PushSource: DataSource {
    type Message: Send + 'static;

    fn merge(
        &self,
        previous: Option<Self::Data>,
        message: Self::Message,
    ) -> Result<Self::Data, UpdateError>;
}

/// Feeds out-of-band transport events into a coordinator. Subscribers see
/// pushed updates through the exact same notification path as polled ones.
///
/// Authentication failures follow the renew-once discipline: one credential
/// renewal, one retry of the failed operation, then the bridge goes dormant
/// and the coordinator signals that the user has to reauthenticate.
pub struct PushBridge<S, T>
where
    S: PushSource,
    T: PushTransport<Message = <S as PushSource>::Message>,
{
    coordinator: Arc<UpdateCoordinator<S>>,
    transport: Arc<T>,
    running: Arc<Mutex<Option<CancellationToken>>>,
}

impl<S, T> PushBridge<S, T>
where
    S: PushSource,
    <S as PushSource>::Message: Clone,
    T: PushTransport<Message = <S as PushSource>::Message>,
{
    pub fn new(coordinator: Arc<UpdateCoordinator<S>>, transport: Arc<T>) -> Self {
        Self {
            coordinator,
            transport,
            running: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_slot().is_some()
    }

    /// Starts the transport and the forwarding task. Calling it while
    /// already running is a no-op.
    pub async fn start(&self) -> Result<(), UpdateError> {
        let token = {
            let mut running = self.running.lock().expect("push bridge lock poisoned");
            if running.is_some() {
                return Ok(());
            }
            let token = CancellationToken::new();
            *running = Some(token.clone());
            token
        };

        let (tx, rx) = mpsc::channel(64);

        if let Err(e) = self.transport.start_listener(tx.clone()).await {
            self.running_slot().take();
            return Err(e);
        }

        tracing::debug!("Push transport for {} started", self.coordinator.name());

        let pump = Pump {
            coordinator: self.coordinator.clone(),
            transport: self.transport.clone(),
            running: self.running.clone(),
            sink: tx,
        };
        tokio::spawn(async move { pump.run(rx, token).await });

        Ok(())
    }

    /// Stops the transport and the forwarding task. Tolerates never having
    /// been started.
    pub async fn stop(&self) {
        let Some(token) = self.running_slot().take() else {
            return;
        };

        token.cancel();
        self.transport.stop_listener().await;
        tracing::debug!("Push transport for {} stopped", self.coordinator.name());
    }

    fn running_slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.running.lock().expect("push bridge lock poisoned")
    }
}

struct Pump<S, T>
where
    S: PushSource,
    T: PushTransport<Message = <S as PushSource>::Message>,
{
    coordinator: Arc<UpdateCoordinator<S>>,
    transport: Arc<T>,
    running: Arc<Mutex<Option<CancellationToken>>>,
    sink: mpsc::Sender<PushMessage<<S as PushSource>::Message>>,
}

impl<S, T> Pump<S, T>
where
    S: PushSource,
    <S as PushSource>::Message: Clone,
    T: PushTransport<Message = <S as PushSource>::Message>,
{
    async fn run(
        self,
        mut rx: mpsc::Receiver<PushMessage<<S as PushSource>::Message>>,
        token: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                _ = token.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => {
                        tracing::warn!(
                            "Push transport for {} closed its channel",
                            self.coordinator.name()
                        );
                        break;
                    }
                },
            };

            match message {
                PushMessage::Event(event) => {
                    if !self.handle_event(event).await {
                        self.go_dormant().await;
                        break;
                    }
                }
                PushMessage::TransportError(error) if error.is_auth() => {
                    if !self.restart_after_renewal().await {
                        self.coordinator.record_external_failure(error);
                        self.go_dormant().await;
                        break;
                    }
                }
                PushMessage::TransportError(error) => {
                    self.coordinator.record_external_failure(error);
                }
            }
        }
    }

    /// Applies one pushed event. Returns false when credentials are beyond
    /// renewal and the bridge has to go dormant.
    async fn handle_event(&self, event: <S as PushSource>::Message) -> bool {
        let merged = self
            .coordinator
            .source()
            .merge(self.coordinator.data(), event.clone());

        match merged {
            Ok(data) => {
                self.coordinator.apply_pushed_update(data);
                true
            }
            Err(error) if error.is_auth() => {
                if self.renew_credentials().await
                    && self.retry_merge(event)
                {
                    return true;
                }
                self.coordinator.record_external_failure(error);
                false
            }
            Err(error) => {
                self.coordinator.record_external_failure(error);
                true
            }
        }
    }

    fn retry_merge(&self, event: <S as PushSource>::Message) -> bool {
        match self.coordinator.source().merge(self.coordinator.data(), event) {
            Ok(data) => {
                self.coordinator.apply_pushed_update(data);
                true
            }
            Err(error) => {
                tracing::warn!(
                    "Retry after credential renewal failed for {}: {}",
                    self.coordinator.name(),
                    error
                );
                false
            }
        }
    }

    async fn restart_after_renewal(&self) -> bool {
        if !self.renew_credentials().await {
            return false;
        }

        self.transport.stop_listener().await;
        match self.transport.start_listener(self.sink.clone()).await {
            Ok(()) => {
                tracing::info!(
                    "Push transport for {} restarted after credential renewal",
                    self.coordinator.name()
                );
                true
            }
            Err(error) => {
                tracing::warn!(
                    "Restarting push transport for {} failed: {}",
                    self.coordinator.name(),
                    error
                );
                false
            }
        }
    }

    async fn renew_credentials(&self) -> bool {
        match self.coordinator.source().reauthorize().await {
            Ok(renewed) => renewed,
            Err(error) => {
                tracing::warn!(
                    "Credential renewal for {} failed: {}",
                    self.coordinator.name(),
                    error
                );
                false
            }
        }
    }

    async fn go_dormant(&self) {
        self.running.lock().expect("push bridge lock poisoned").take();
        self.transport.stop_listener().await;
        tracing::warn!(
            "Push bridge for {} is dormant until reauthentication",
            self.coordinator.name()
        );
    }
}
