//! Pub/sub support
//!
//! - [`Subscription`]: decodes subscribe/unsubscribe/message frames on one connection
//! - [`ResilientPubSubService`]: managed background subscriber with a lifecycle
//!   state machine, heartbeat, control channel, and auto-restart

pub mod control;
pub mod service;
pub mod state;
pub mod subscription;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::error::Error;

pub use control::{ControlMessage, Operation, operation_name};
pub use service::{PubSubCallbacks, PubSubServiceBuilder, ResilientPubSubService};
pub use state::{ServiceState, StateCell};
pub use subscription::{Subscription, SubscriptionCallbacks, SubscriptionEvent};

pub type Callback = Arc<dyn Fn() + Send + Sync>;
/// `(channel, message)`
pub type MessageCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;
/// `(channel, payload)`
pub type BytesMessageCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;
/// Channel name, or control command name
pub type NameCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Run a user callback; a panic is logged instead of unwinding into the service
pub(crate) fn guarded(name: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!("{} callback panicked", name);
    }
}
