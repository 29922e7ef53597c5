//! The broadcasting client: owns the single transport connection and the
//! channel registry, and hands out subscription guards.

use std::sync::{Arc, Mutex, Weak};

use parlor_shared::{ApiError, ChannelEvent, ChannelKind, EventKind, ServerEvent, Topic, WsEnvelope};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::api_client::ApiClient;
use crate::auth_session::AuthSession;
use crate::config::ClientConfig;
use crate::ws::connection::{ConnectionStatus, WsConnection, WsHandle};
use crate::ws::registry::{BindingId, ChannelRegistry, Handler};

/// Client for the broadcasting service. Explicitly constructed and injected
/// wherever live events are consumed; each instance owns exactly one
/// transport connection, created lazily on first use.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<RealtimeInner>,
}

pub(crate) struct RealtimeInner {
    config: ClientConfig,
    session: AuthSession,
    api: ApiClient,
    registry: Arc<ChannelRegistry>,
    conn: Mutex<Option<WsConnection>>,
    handle: Mutex<Option<WsHandle>>,
}

impl RealtimeClient {
    pub fn new(config: ClientConfig, session: AuthSession) -> Self {
        let api = ApiClient::new(config.api_base.clone(), session.clone());
        Self {
            inner: Arc::new(RealtimeInner {
                config,
                session,
                api,
                registry: Arc::new(ChannelRegistry::new()),
                conn: Mutex::new(None),
                handle: Mutex::new(None),
            }),
        }
    }

    /// The REST client this instance uses for channel authorization. Shares
    /// the same auth session.
    pub fn api(&self) -> ApiClient {
        self.inner.api.clone()
    }

    /// Establish the transport connection if it does not exist yet.
    /// Idempotent: a second call does nothing. Must run inside a tokio
    /// runtime (the connection loop is a background task).
    pub fn initialize(&self) {
        let mut conn = self.inner.conn.lock().unwrap();
        if conn.is_some() || self.inner.handle.lock().unwrap().is_some() {
            return;
        }

        let ws_url = self.inner.config.ws_url.clone();
        let session = self.inner.session.clone();
        // The token is read here, at connect time, not captured once: a
        // rotated token is picked up on the next reconnect attempt.
        let url_builder = move || {
            let mut url = match Url::parse(&ws_url) {
                Ok(url) => url,
                Err(e) => {
                    warn!("invalid broadcasting url {ws_url}: {e}");
                    return None;
                }
            };
            if let Some(token) = session.bearer() {
                url.query_pairs_mut().append_pair("token", &token);
            }
            Some(url.to_string())
        };

        let registry = self.inner.registry.clone();
        let on_event = move |envelope: WsEnvelope<ServerEvent>| match envelope.payload {
            ServerEvent::Broadcast {
                channel,
                event,
                payload,
            } => registry.dispatch(&channel, &event, &payload),
            ServerEvent::Ack { channel } => {
                debug!(channel = %channel, "subscription acknowledged");
            }
            ServerEvent::Error {
                code,
                message,
                correlation_id,
            } => {
                warn!(code = %code, ?correlation_id, "broadcasting server error: {message}");
            }
        };

        let connection =
            WsConnection::new(url_builder, on_event, self.inner.config.reconnect.clone());
        *self.inner.handle.lock().unwrap() = Some(connection.handle());
        spawn_rejoin_task(&self.inner, connection.watch_status());
        *conn = Some(connection);
        info!("broadcasting client initialized");
    }

    /// Subscribe to a public channel. Transport-level failures are logged and
    /// reflected in the connection state; they are not surfaced here.
    pub fn subscribe(
        &self,
        topic: Topic,
        event: EventKind,
        handler: impl Fn(ChannelEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.attach_with(topic, vec![(event, Arc::new(handler))], None)
    }

    /// Subscribe to a private channel: authorization is obtained from the
    /// dedicated auth endpoint before the join is issued.
    pub async fn subscribe_private(
        &self,
        topic: Topic,
        event: EventKind,
        handler: impl Fn(ChannelEvent) + Send + Sync + 'static,
    ) -> Result<Subscription, ApiError> {
        self.attach_private(topic, vec![(event, Arc::new(handler))])
            .await
    }

    pub(crate) async fn attach_private(
        &self,
        topic: Topic,
        bindings: Vec<(EventKind, Handler)>,
    ) -> Result<Subscription, ApiError> {
        let auth = self.inner.api.authorize_channel(&topic.name()).await?;
        Ok(self.attach_with(topic, bindings, Some(auth)))
    }

    pub(crate) fn attach_with(
        &self,
        topic: Topic,
        bindings: Vec<(EventKind, Handler)>,
        auth: Option<String>,
    ) -> Subscription {
        self.initialize();

        let mut ids = Vec::with_capacity(bindings.len());
        let mut needs_join = false;
        for (event, handler) in bindings {
            let (id, first) = self.inner.registry.attach(&topic, event, handler);
            ids.push(id);
            needs_join |= first;
        }

        if needs_join {
            let name = topic.name();
            debug!(channel = %name, "joining channel");
            self.send(|handle| handle.subscribe(&name, auth));
        }

        Subscription {
            ids,
            topic,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Tear down the named channel regardless of remaining bindings. Unknown
    /// topics are a no-op, not an error.
    pub fn unsubscribe(&self, topic: &Topic) {
        let name = topic.name();
        if self.inner.registry.remove(&name) {
            self.send(|handle| handle.unsubscribe(&name));
        }
    }

    /// Tear down every registered channel; used on logout.
    pub fn unsubscribe_all(&self) {
        for name in self.inner.registry.clear() {
            self.send(|handle| handle.unsubscribe(&name));
        }
    }

    /// Current connection state plus transport detail. Display only; nothing
    /// in this crate takes decisions off it.
    pub fn connection_status(&self) -> ConnectionStatus {
        let conn = self.inner.conn.lock().unwrap();
        match conn.as_ref() {
            Some(conn) => conn.status(),
            None => ConnectionStatus::disconnected("not initialized"),
        }
    }

    fn send(&self, f: impl FnOnce(&WsHandle) -> Result<(), parlor_shared::TransportError>) {
        RealtimeInner::send(&self.inner, f);
    }

    #[cfg(test)]
    pub(crate) fn with_test_handle(
        config: ClientConfig,
        session: AuthSession,
    ) -> (
        Self,
        futures_channel::mpsc::UnboundedReceiver<WsEnvelope<parlor_shared::ClientCommand>>,
    ) {
        let (tx, rx) = futures_channel::mpsc::unbounded();
        let api = ApiClient::new(config.api_base.clone(), session.clone());
        let client = Self {
            inner: Arc::new(RealtimeInner {
                config,
                session,
                api,
                registry: Arc::new(ChannelRegistry::new()),
                conn: Mutex::new(None),
                handle: Mutex::new(Some(WsHandle::new(tx))),
            }),
        };
        (client, rx)
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &ChannelRegistry {
        &self.inner.registry
    }
}

impl RealtimeInner {
    fn send(
        inner: &Arc<Self>,
        f: impl FnOnce(&WsHandle) -> Result<(), parlor_shared::TransportError>,
    ) {
        let guard = inner.handle.lock().unwrap();
        if let Some(handle) = guard.as_ref() {
            if let Err(e) = f(handle) {
                // Report, don't recover: reconnection is the transport
                // loop's business and commands are requeued by callers'
                // user-initiated retries.
                warn!("{e}");
            }
        }
    }
}

/// RAII guard for one channel binding. Dropping it detaches the handlers
/// synchronously; when the last binding on a channel drops, the
/// transport-level subscription is released.
pub struct Subscription {
    ids: Vec<BindingId>,
    topic: Topic,
    inner: Weak<RealtimeInner>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        for id in self.ids.drain(..) {
            if let Some(name) = inner.registry.detach(id) {
                debug!(channel = %name, "leaving channel");
                RealtimeInner::send(&inner, |handle| handle.unsubscribe(&name));
            }
        }
    }
}

/// Re-issue joins after a reconnect. The first connection is skipped: joins
/// issued before it are still queued in the command channel. Private
/// channels are re-authorized with a fresh token.
fn spawn_rejoin_task(inner: &Arc<RealtimeInner>, mut status: watch::Receiver<ConnectionStatus>) {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut seen_first_connect = false;
        let mut was_connected = false;
        while status.changed().await.is_ok() {
            let connected = status.borrow().state.is_connected();
            if connected && !was_connected {
                if !seen_first_connect {
                    seen_first_connect = true;
                } else {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    rejoin_all(&inner).await;
                }
            }
            was_connected = connected;
        }
    });
}

async fn rejoin_all(inner: &Arc<RealtimeInner>) {
    for topic in inner.registry.topics() {
        let name = topic.name();
        let auth = match topic.kind() {
            ChannelKind::Public => None,
            ChannelKind::Private => match inner.api.authorize_channel(&name).await {
                Ok(auth) => Some(auth),
                Err(e) => {
                    warn!(channel = %name, "channel re-authorization failed: {e}");
                    continue;
                }
            },
        };
        info!(channel = %name, "rejoining after reconnect");
        RealtimeInner::send(inner, |handle| handle.subscribe(&name, auth));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parlor_shared::ClientCommand;

    use super::*;

    fn test_client() -> (
        RealtimeClient,
        futures_channel::mpsc::UnboundedReceiver<WsEnvelope<ClientCommand>>,
    ) {
        RealtimeClient::with_test_handle(ClientConfig::default(), AuthSession::new())
    }

    fn drain_commands(
        rx: &mut futures_channel::mpsc::UnboundedReceiver<WsEnvelope<ClientCommand>>,
    ) -> Vec<ClientCommand> {
        let mut commands = Vec::new();
        while let Ok(Some(envelope)) = rx.try_next() {
            commands.push(envelope.payload);
        }
        commands
    }

    #[tokio::test]
    async fn double_subscribe_joins_once() {
        let (client, mut rx) = test_client();
        let counter = Arc::new(AtomicUsize::new(0));
        let c1 = counter.clone();
        let c2 = counter.clone();

        let _a = client.subscribe(Topic::Post(7), EventKind::PostLiked, move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let _b = client.subscribe(Topic::Post(7), EventKind::PostLiked, move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        let commands = drain_commands(&mut rx);
        assert_eq!(commands.len(), 1, "exactly one transport join for post.7");
        assert!(matches!(
            &commands[0],
            ClientCommand::Subscribe { channel, .. } if channel == "post.7"
        ));

        // A single incoming event fires both callbacks.
        client.registry().dispatch(
            "post.7",
            "post.liked",
            &serde_json::json!({ "postId": 7, "userId": 1, "likeCount": 1 }),
        );
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropping_the_last_guard_leaves_the_channel() {
        let (client, mut rx) = test_client();

        let a = client.subscribe(Topic::Post(7), EventKind::PostLiked, |_| {});
        let b = client.subscribe(Topic::Post(7), EventKind::PostLiked, |_| {});
        drain_commands(&mut rx);

        drop(a);
        assert!(drain_commands(&mut rx).is_empty(), "channel still has a binding");

        drop(b);
        let commands = drain_commands(&mut rx);
        assert!(matches!(
            &commands[..],
            [ClientCommand::Unsubscribe { channel }] if channel == "post.7"
        ));
        assert!(!client.registry().contains("post.7"));
    }

    #[tokio::test]
    async fn guard_dropped_before_handshake_resolves_leaves_nothing_behind() {
        let (client, mut rx) = test_client();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();

        // The join command is still queued (no server ever acks it) when the
        // guard drops.
        let guard = client.subscribe(Topic::Conversation(42), EventKind::MessageNew, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        drop(guard);

        let commands = drain_commands(&mut rx);
        assert_eq!(commands.len(), 2); // subscribe then unsubscribe
        assert!(!client.registry().contains("conversation.42"));

        // A late event delivered after the drop reaches no handler.
        client.registry().dispatch(
            "conversation.42",
            "message.new",
            &serde_json::json!({
                "id": 1, "conversationId": 42,
                "sender": { "id": 2, "name": "bo", "avatar": null },
                "body": "late", "createdAt": "2026-01-01T00:00:00Z"
            }),
        );
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let (client, mut rx) = test_client();

        let _guard = client.subscribe(Topic::Post(9), EventKind::CommentCreated, |_| {});
        drain_commands(&mut rx);

        client.unsubscribe(&Topic::Post(9));
        client.unsubscribe(&Topic::Post(9));

        let commands = drain_commands(&mut rx);
        assert_eq!(commands.len(), 1, "second unsubscribe is a no-op");
    }

    #[tokio::test]
    async fn unsubscribe_all_empties_the_registry() {
        let (client, mut rx) = test_client();

        let _a = client.subscribe(Topic::Feed, EventKind::PostCreated, |_| {});
        let _b = client.subscribe(Topic::Post(1), EventKind::PostLiked, |_| {});
        drain_commands(&mut rx);

        client.unsubscribe_all();
        let leaves = drain_commands(&mut rx);
        assert_eq!(leaves.len(), 2);
        assert!(leaves
            .iter()
            .all(|c| matches!(c, ClientCommand::Unsubscribe { .. })));
        assert_eq!(client.registry().channel_count(), 0);
    }
}
