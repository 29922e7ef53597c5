//! Parlor client core.
//!
//! The real-time layer of a social-networking client: one broadcasting
//! connection with a channel registry and typed per-feature subscriptions,
//! a bearer-authenticated REST client, and a one-to-one call signaling flow
//! over a document-style store.
//!
//! Services are explicitly constructed and injected; there is no global
//! state. A typical setup:
//!
//! ```no_run
//! use parlor_client::{AuthSession, ClientConfig, RealtimeClient};
//!
//! # async fn run() {
//! let session = AuthSession::new();
//! let realtime = RealtimeClient::new(ClientConfig::from_env(), session.clone());
//!
//! let _feed = realtime.subscribe_feed(|post| {
//!     println!("new post from {}", post.author.name);
//! });
//! # }
//! ```

pub mod api_client;
pub mod auth_session;
pub mod call;
pub mod config;
pub mod storage;
pub mod ws;

pub use api_client::ApiClient;
pub use auth_session::AuthSession;
pub use call::{CallConfig, CallSession, CallState, MemorySignalingStore, RemoteSignalingStore};
pub use config::{ClientConfig, IceServerConfig, ReconnectConfig};
pub use storage::SessionCache;
pub use ws::{ConnectionState, ConnectionStatus, RealtimeClient, Subscription};

pub use parlor_shared as shared;
