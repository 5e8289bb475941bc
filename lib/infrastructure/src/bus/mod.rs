use tokio::sync::broadcast::error::RecvError;

pub struct EventBus<T> {
    tx: tokio::sync::broadcast::Sender<T>,
}

pub struct EventListener<T> {
    rx: tokio::sync::broadcast::Receiver<T>,
}

#[derive(Clone)]
pub struct EventEmitter<T> {
    tx: tokio::sync::broadcast::Sender<T>,
}

impl<T: Clone + std::fmt::Debug> EventBus<T> {
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(buffer_size);
        Self { tx }
    }

    pub fn subscribe(&self) -> EventListener<T> {
        EventListener {
            rx: self.tx.subscribe(),
        }
    }

    pub fn emitter(&self) -> EventEmitter<T> {
        EventEmitter { tx: self.tx.clone() }
    }
}

impl<T: Clone> EventListener<T> {
    /// Next event, or `None` once all emitters are gone. A receiver that
    /// fell behind skips the lost events and keeps going.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Closed) => {
                    tracing::error!(
                        "Event channel of {} is closed",
                        std::any::type_name::<T>()
                    );
                    return None;
                }
                Err(RecvError::Lagged(count)) => {
                    tracing::warn!(
                        "Event listener of {} lagged by {} events, resuming",
                        std::any::type_name::<T>(),
                        count
                    );
                }
            }
        }
    }
}

impl<T: Clone + std::fmt::Debug> EventEmitter<T> {
    pub fn send(&self, event: T) {
        //send only fails without receivers, which is not an error for a bus
        if self.tx.send(event).is_err() {
            tracing::debug!(
                "No listener for event on {} bus",
                std::any::type_name::<T>()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_all_listeners() {
        let bus = EventBus::<u32>::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emitter().send(42);

        assert_eq!(first.recv().await, Some(42));
        assert_eq!(second.recv().await, Some(42));
    }

    #[tokio::test]
    async fn test_lagged_listener_resumes() {
        let bus = EventBus::<u32>::new(1);
        let mut listener = bus.subscribe();

        let emitter = bus.emitter();
        emitter.send(1);
        emitter.send(2);

        //buffer size 1: the first event is lost, the second arrives
        assert_eq!(listener.recv().await, Some(2));
    }
}
