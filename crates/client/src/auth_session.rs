//! Authentication session shared by the REST client and the broadcasting
//! connection.
//!
//! The bearer token is read at call time, never cached by consumers, so a
//! rotated token is picked up on the next request or reconnect. A 401 from
//! the API clears the session and flips the auth watch; the application
//! decides how to route the user back to login.

use std::sync::{Arc, RwLock};

use parlor_shared::UserSummary;
use tokio::sync::watch;

#[derive(Clone)]
pub struct AuthSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    token: RwLock<Option<String>>,
    user: RwLock<Option<UserSummary>>,
    authenticated: watch::Sender<bool>,
}

impl AuthSession {
    pub fn new() -> Self {
        let (authenticated, _) = watch::channel(false);
        Self {
            inner: Arc::new(SessionInner {
                token: RwLock::new(None),
                user: RwLock::new(None),
                authenticated,
            }),
        }
    }

    /// Store credentials after a successful login.
    pub fn login(&self, token: String, user: UserSummary) {
        *self.inner.token.write().unwrap() = Some(token);
        *self.inner.user.write().unwrap() = Some(user);
        let _ = self.inner.authenticated.send_replace(true);
    }

    /// Current bearer token, if any. Always read fresh at call time.
    pub fn bearer(&self) -> Option<String> {
        self.inner.token.read().unwrap().clone()
    }

    pub fn user(&self) -> Option<UserSummary> {
        self.inner.user.read().unwrap().clone()
    }

    pub fn user_id(&self) -> Option<u64> {
        self.inner.user.read().unwrap().as_ref().map(|u| u.id)
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.token.read().unwrap().is_some()
    }

    /// Drop the local token and mark the session unauthenticated. Used on
    /// explicit logout and when the API rejects the token.
    pub fn clear(&self) {
        *self.inner.token.write().unwrap() = None;
        *self.inner.user.write().unwrap() = None;
        let _ = self.inner.authenticated.send_replace(false);
    }

    /// Watch authentication state; flips to `false` on logout or expiry.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.inner.authenticated.subscribe()
    }
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserSummary {
        UserSummary {
            id: 1,
            name: "ada".to_string(),
            avatar: None,
        }
    }

    #[test]
    fn clear_drops_token_and_flips_watch() {
        let session = AuthSession::new();
        let watch = session.watch();
        assert!(!session.is_authenticated());

        session.login("tok-1".to_string(), user());
        assert_eq!(session.bearer().as_deref(), Some("tok-1"));
        assert!(*watch.borrow());

        session.clear();
        assert_eq!(session.bearer(), None);
        assert_eq!(session.user_id(), None);
        assert!(!*watch.borrow());
    }

    #[test]
    fn token_rotation_is_visible_to_later_reads() {
        let session = AuthSession::new();
        session.login("tok-1".to_string(), user());
        session.login("tok-2".to_string(), user());
        assert_eq!(session.bearer().as_deref(), Some("tok-2"));
    }
}
