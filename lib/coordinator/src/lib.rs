//! Update coordination for device integrations: one coordinator per
//! upstream source owns the refresh schedule, the last-good snapshot and
//! the subscriber fan-out. Push transports and keyed feeds plug into the
//! same notification path.

mod coordinator;
mod error;
mod feed;
mod listener;
mod push;
mod refresh;
mod source;

pub use coordinator::{CoordinatorEvent, CoordinatorOptions, PollMode, UpdateCoordinator};
pub use error::{NotReady, UpdateError};
pub use feed::{
    FeedEntityManager, FeedEntry, FeedEvent, FeedManagerOptions, FeedSource, FeedStatus, StatusInfo,
};
pub use listener::{ListenerHandle, ListenerRegistry};
pub use push::{PushBridge, PushMessage, PushSource, PushTransport};
pub use source::DataSource;
