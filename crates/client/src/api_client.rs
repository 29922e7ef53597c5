//! HTTP API client with bearer-token auth.

use parlor_shared::{try_error_detail, try_validation_errors, ApiError, ChannelAuth, Envelope};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::auth_session::AuthSession;

/// REST client for the social API. The bearer token is read from the injected
/// [`AuthSession`] on every request; a 401 clears the session.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    session: AuthSession,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, session: AuthSession) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            session,
        }
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    fn authorize(&self, rb: RequestBuilder) -> RequestBuilder {
        match self.session.bearer() {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    async fn execute<TRes: DeserializeOwned>(&self, rb: RequestBuilder) -> Result<TRes, ApiError> {
        let resp = rb
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();

        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            return Err(self.map_failure(status, text));
        }

        serde_json::from_str(&text).map_err(|e| ApiError::Deserialize(e.to_string()))
    }

    fn map_failure(&self, status: u16, body: String) -> ApiError {
        match status {
            401 => {
                // Forced logout: drop the local token so the auth watch flips.
                self.session.clear();
                ApiError::AuthExpired
            }
            422 => match try_validation_errors(&body) {
                Some(errors) => ApiError::Validation(errors),
                None => ApiError::Http { status, body },
            },
            _ => {
                let body = try_error_detail(&body).unwrap_or(body);
                ApiError::Http { status, body }
            }
        }
    }

    pub async fn get_json<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ApiError> {
        let rb = self.authorize(self.client.get(self.url(path)));
        self.execute(rb).await
    }

    /// GET that unwraps the `{ "data": ... }` envelope (handles the endpoints
    /// that nest a second envelope).
    pub async fn get_data<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ApiError> {
        let value: serde_json::Value = self.get_json(path).await?;
        serde_json::from_value(parlor_shared::unwrap_data(value))
            .map_err(|e| ApiError::Deserialize(e.to_string()))
    }

    pub async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let rb = self.authorize(self.client.post(self.url(path)).json(body));
        self.execute(rb).await
    }

    /// POST where the response body is empty or irrelevant.
    pub async fn post_unit<TReq: Serialize>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<(), ApiError> {
        let rb = self.authorize(self.client.post(self.url(path)).json(body));
        self.execute_unit(rb).await
    }

    pub async fn put_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let rb = self.authorize(self.client.put(self.url(path)).json(body));
        self.execute(rb).await
    }

    pub async fn put_unit<TReq: Serialize>(&self, path: &str, body: &TReq) -> Result<(), ApiError> {
        let rb = self.authorize(self.client.put(self.url(path)).json(body));
        self.execute_unit(rb).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        let rb = self.authorize(self.client.delete(self.url(path)));
        self.execute_unit(rb).await
    }

    async fn execute_unit(&self, rb: RequestBuilder) -> Result<(), ApiError> {
        let resp = rb
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        if resp.status().is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        Err(self.map_failure(status, text))
    }

    /// Request authorization for a private channel from the dedicated auth
    /// endpoint. Returns the signed token the broadcasting server expects in
    /// the subscribe command.
    pub async fn authorize_channel(&self, channel: &str) -> Result<String, ApiError> {
        let body = serde_json::json!({ "channelName": channel });
        let auth: ChannelAuth = self.post_json("/api/broadcasting/auth", &body).await?;
        Ok(auth.auth)
    }
}

// Convenience wrappers for the envelope shape most endpoints use.
impl ApiClient {
    pub async fn get_enveloped<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let envelope: Envelope<T> = self.get_json(path).await?;
        Ok(envelope.data)
    }
}

#[cfg(test)]
mod tests {
    use parlor_shared::UserSummary;

    use super::*;

    fn client_with_token() -> ApiClient {
        let session = AuthSession::new();
        session.login(
            "tok".to_string(),
            UserSummary {
                id: 1,
                name: "ada".to_string(),
                avatar: None,
            },
        );
        ApiClient::new("http://localhost:8000", session)
    }

    #[test]
    fn rejected_token_clears_the_session() {
        let client = client_with_token();
        assert!(client.session().is_authenticated());

        let err = client.map_failure(401, r#"{"message":"Unauthenticated."}"#.to_string());
        assert_eq!(err, ApiError::AuthExpired);
        assert!(!client.session().is_authenticated());
        assert_eq!(client.session().bearer(), None);
    }

    #[test]
    fn unprocessable_entity_maps_to_validation() {
        let client = client_with_token();
        let body = r#"{"message":"The given data was invalid.","errors":{"body":["Required."]}}"#;
        match client.map_failure(422, body.to_string()) {
            ApiError::Validation(errors) => assert_eq!(errors["body"], vec!["Required."]),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn other_failures_surface_the_detail_message() {
        let client = client_with_token();
        let err = client.map_failure(404, r#"{"message":"Post not found"}"#.to_string());
        assert_eq!(
            err,
            ApiError::Http {
                status: 404,
                body: "Post not found".to_string()
            }
        );
    }

    #[test]
    fn url_joining_handles_slashes_and_absolutes() {
        let client = client_with_token();
        assert_eq!(client.url("/api/posts"), "http://localhost:8000/api/posts");
        assert_eq!(client.url("api/posts"), "http://localhost:8000/api/posts");
        assert_eq!(client.url("https://cdn.example/x"), "https://cdn.example/x");
    }
}
