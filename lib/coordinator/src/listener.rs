use std::sync::{Arc, Mutex, Weak};

type Callback<M> = Arc<dyn Fn(&M) -> anyhow::Result<()> + Send + Sync>;

/// Subscribers of one coordinator, notified in registration order.
///
/// Every notification round works on a snapshot of the current set:
/// listeners that subscribe or unsubscribe during a round do not change
/// that round, and a failing callback never keeps the remaining listeners
/// from being notified.
pub struct ListenerRegistry<M> {
    name: String,
    inner: Arc<Mutex<Listeners<M>>>,
}

struct Listeners<M> {
    next_id: u64,
    entries: Vec<(u64, Callback<M>)>,
}

impl<M: 'static> ListenerRegistry<M> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                entries: vec![],
            })),
        }
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&M) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push((id, Arc::new(callback)));
            id
        };

        let registry = Arc::downgrade(&self.inner);
        ListenerHandle {
            remove: Some(Box::new(move || remove_listener(registry, id))),
        }
    }

    pub fn notify_all(&self, message: &M) {
        let snapshot = self.lock().entries.clone();

        for (id, callback) in snapshot {
            if let Err(e) = callback(message) {
                tracing::error!("Listener {} of {} failed: {:?}", id, self.name, e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Listeners<M>> {
        self.inner.lock().expect("listener registry lock poisoned")
    }
}

fn remove_listener<M>(registry: Weak<Mutex<Listeners<M>>>, id: u64) {
    if let Some(inner) = registry.upgrade() {
        inner
            .lock()
            .expect("listener registry lock poisoned")
            .entries
            .retain(|(entry_id, _)| *entry_id != id);
    }
}

/// Keeps a listener subscribed. Dropping the handle, or calling
/// [`ListenerHandle::unsubscribe`], removes the listener; removal during a
/// notification round takes effect with the next round.
pub struct ListenerHandle {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
    pub fn unsubscribe(mut self) {
        self.remove_now();
    }

    fn remove_now(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.remove_now();
    }
}
