//! Real-time layer: the broadcasting connection, the channel registry, and
//! the per-feature subscription bindings.

pub(crate) mod client;
mod connection;
pub(crate) mod registry;
mod subscriptions;

pub use client::{RealtimeClient, Subscription};
pub use connection::{ConnectionState, ConnectionStatus, WsConnection, WsHandle};
pub use registry::BindingId;
pub use subscriptions::{PostEvent, UserEvent};
