//! Per-feature subscription bindings.
//!
//! Thin typed wrappers over the broadcasting client: each one names the
//! channel and events for a feature and hands the caller a guard whose drop
//! releases the binding. No state of their own.

use std::sync::Arc;

use parlor_shared::{
    ApiError, ChannelEvent, Comment, CommentDeleted, ConversationMessage, EventKind,
    FriendshipRequest, Notification, Post, PostLike, Topic,
};

use crate::ws::client::{RealtimeClient, Subscription};
use crate::ws::registry::Handler;

/// Live updates for a single post's page.
#[derive(Debug, Clone, PartialEq)]
pub enum PostEvent {
    Liked(PostLike),
    CommentCreated(Comment),
    CommentDeleted(CommentDeleted),
}

/// Live updates on a user's private channel.
#[derive(Debug, Clone, PartialEq)]
pub enum UserEvent {
    FriendshipRequest(FriendshipRequest),
    Notification(Notification),
}

impl RealtimeClient {
    /// New posts on the flat feed channel.
    pub fn subscribe_feed(
        &self,
        on_post: impl Fn(Post) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(Topic::Feed, EventKind::PostCreated, move |event| {
            if let ChannelEvent::PostCreated(post) = event {
                on_post(post);
            }
        })
    }

    /// Likes and comment changes for one post.
    pub fn subscribe_post(
        &self,
        post_id: u64,
        on_event: impl Fn(PostEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let on_event = Arc::new(on_event);
        let bindings: Vec<(EventKind, Handler)> = vec![
            (EventKind::PostLiked, {
                let cb = on_event.clone();
                Arc::new(move |event: ChannelEvent| {
                    if let ChannelEvent::PostLiked(like) = event {
                        cb(PostEvent::Liked(like));
                    }
                })
            }),
            (EventKind::CommentCreated, {
                let cb = on_event.clone();
                Arc::new(move |event: ChannelEvent| {
                    if let ChannelEvent::CommentCreated(comment) = event {
                        cb(PostEvent::CommentCreated(comment));
                    }
                })
            }),
            (EventKind::CommentDeleted, {
                let cb = on_event;
                Arc::new(move |event: ChannelEvent| {
                    if let ChannelEvent::CommentDeleted(deleted) = event {
                        cb(PostEvent::CommentDeleted(deleted));
                    }
                })
            }),
        ];
        self.attach_with(Topic::Post(post_id), bindings, None)
    }

    /// Friendship requests and notifications for the signed-in user.
    /// Private: requires channel authorization.
    pub async fn subscribe_user(
        &self,
        user_id: u64,
        on_event: impl Fn(UserEvent) + Send + Sync + 'static,
    ) -> Result<Subscription, ApiError> {
        let on_event = Arc::new(on_event);
        let bindings: Vec<(EventKind, Handler)> = vec![
            (EventKind::FriendshipRequestReceived, {
                let cb = on_event.clone();
                Arc::new(move |event: ChannelEvent| {
                    if let ChannelEvent::FriendshipRequestReceived(request) = event {
                        cb(UserEvent::FriendshipRequest(request));
                    }
                })
            }),
            (EventKind::NotificationCreated, {
                let cb = on_event;
                Arc::new(move |event: ChannelEvent| {
                    if let ChannelEvent::NotificationCreated(notification) = event {
                        cb(UserEvent::Notification(notification));
                    }
                })
            }),
        ];
        self.attach_private(Topic::User(user_id), bindings).await
    }

    /// New messages within one conversation. Private.
    pub async fn subscribe_conversation(
        &self,
        conversation_id: u64,
        on_message: impl Fn(ConversationMessage) + Send + Sync + 'static,
    ) -> Result<Subscription, ApiError> {
        self.subscribe_private(
            Topic::Conversation(conversation_id),
            EventKind::MessageNew,
            move |event| {
                if let ChannelEvent::MessageNew(message) = event {
                    on_message(message);
                }
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::auth_session::AuthSession;
    use crate::config::ClientConfig;

    use super::*;

    #[tokio::test]
    async fn feed_binding_delivers_typed_posts() {
        let (client, _rx) =
            RealtimeClient::with_test_handle(ClientConfig::default(), AuthSession::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let _guard = client.subscribe_feed(move |post| {
            sink.lock().unwrap().push(post.id);
        });

        client.registry().dispatch(
            "posts",
            "post.created",
            &serde_json::json!({
                "id": 11,
                "author": { "id": 1, "name": "ada", "avatar": null },
                "body": "hello",
                "likeCount": 0,
                "commentCount": 0,
                "createdAt": "2026-01-01T00:00:00Z"
            }),
        );
        assert_eq!(*seen.lock().unwrap(), vec![11]);
    }

    #[tokio::test]
    async fn post_binding_routes_all_three_events_through_one_callback() {
        let (client, mut rx) =
            RealtimeClient::with_test_handle(ClientConfig::default(), AuthSession::new());
        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();

        let _guard = client.subscribe_post(7, move |_event| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        // Three event bindings, one transport join.
        let mut joins = 0;
        while let Ok(Some(envelope)) = rx.try_next() {
            if matches!(envelope.payload, parlor_shared::ClientCommand::Subscribe { .. }) {
                joins += 1;
            }
        }
        assert_eq!(joins, 1);

        client.registry().dispatch(
            "post.7",
            "post.liked",
            &serde_json::json!({ "postId": 7, "userId": 2, "likeCount": 4 }),
        );
        client.registry().dispatch(
            "post.7",
            "CommentDeleted",
            &serde_json::json!({ "id": 5, "postId": 7 }),
        );
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
