//! Signaling store backed by the application API.
//!
//! Records persist as documents behind the REST boundary; live updates
//! (answer arrival, appended candidates) ride the same broadcasting
//! transport as every other channel, as `call.{session}` private-channel
//! events. There is no second real-time backend.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures_util::Stream;
use parlor_shared::{
    ApiError, CallRecord, CandidateSide, ChannelEvent, EventKind, IceCandidate,
    SessionDescription, SignalingError, Topic,
};
use tracing::debug;

use crate::api_client::ApiClient;
use crate::call::store::{SignalingStore, SignalingUpdate, UpdateStream};
use crate::ws::client::{RealtimeClient, Subscription};
use crate::ws::registry::Handler;

pub struct RemoteSignalingStore {
    api: ApiClient,
    realtime: RealtimeClient,
}

impl RemoteSignalingStore {
    /// Share the realtime client's transport and auth session.
    pub fn new(realtime: &RealtimeClient) -> Self {
        Self {
            api: realtime.api(),
            realtime: realtime.clone(),
        }
    }
}

fn store_err(e: ApiError) -> SignalingError {
    SignalingError::Store(e.to_string())
}

#[async_trait]
impl SignalingStore for RemoteSignalingStore {
    async fn create(&self, session_id: &str) -> Result<(), SignalingError> {
        self.api
            .post_unit("/api/calls", &serde_json::json!({ "sessionId": session_id }))
            .await
            .map_err(store_err)
    }

    async fn read(&self, session_id: &str) -> Result<Option<CallRecord>, SignalingError> {
        match self
            .api
            .get_enveloped::<CallRecord>(&format!("/api/calls/{session_id}"))
            .await
        {
            Ok(record) => Ok(Some(record)),
            Err(ApiError::Http { status: 404, .. }) => Ok(None),
            Err(e) => Err(store_err(e)),
        }
    }

    async fn put_offer(
        &self,
        session_id: &str,
        offer: SessionDescription,
    ) -> Result<(), SignalingError> {
        match self
            .api
            .put_unit(&format!("/api/calls/{session_id}/offer"), &offer)
            .await
        {
            Ok(()) => Ok(()),
            Err(ApiError::Http { status: 404, .. }) => {
                Err(SignalingError::SessionNotFound(session_id.to_string()))
            }
            Err(e) => Err(store_err(e)),
        }
    }

    async fn put_answer(
        &self,
        session_id: &str,
        answer: SessionDescription,
    ) -> Result<(), SignalingError> {
        match self
            .api
            .put_unit(&format!("/api/calls/{session_id}/answer"), &answer)
            .await
        {
            Ok(()) => Ok(()),
            Err(ApiError::Http { status: 404, .. }) => {
                Err(SignalingError::SessionNotFound(session_id.to_string()))
            }
            Err(ApiError::Http { status: 409, .. }) => {
                Err(SignalingError::AnswerAlreadySet(session_id.to_string()))
            }
            Err(e) => Err(store_err(e)),
        }
    }

    async fn add_candidate(
        &self,
        session_id: &str,
        side: CandidateSide,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        self.api
            .post_unit(
                &format!("/api/calls/{session_id}/candidates"),
                &serde_json::json!({ "side": side, "candidate": candidate }),
            )
            .await
            .map_err(store_err)
    }

    async fn updates(
        &self,
        session_id: &str,
        side: CandidateSide,
    ) -> Result<UpdateStream, SignalingError> {
        let (tx, rx) = futures_channel::mpsc::unbounded();

        // Join the live channel before reading the record so nothing recorded
        // after the read is missed. An update that lands in both (recorded
        // during the read, then replayed) is tolerated downstream: a repeated
        // answer fails to re-apply and is logged, repeated candidates are
        // harmless to the ICE agent.
        let subscription = self
            .realtime
            .attach_private(
                Topic::Call(session_id.to_string()),
                live_bindings(session_id, side, &tx),
            )
            .await
            .map_err(store_err)?;

        let replay = self.read(session_id).await?;
        if let Some(record) = replay {
            if side == CandidateSide::Callee {
                if let Some(answer) = record.answer {
                    let _ = tx.unbounded_send(SignalingUpdate::Answer(answer));
                }
            }
            let candidates: Vec<IceCandidate> = self
                .api
                .get_enveloped(&format!(
                    "/api/calls/{session_id}/candidates?side={}",
                    side_name(side)
                ))
                .await
                .map_err(store_err)?;
            for candidate in candidates {
                let _ = tx.unbounded_send(SignalingUpdate::Candidate(candidate));
            }
        }

        Ok(Box::pin(GuardedStream {
            rx,
            _subscription: subscription,
        }))
    }
}

fn side_name(side: CandidateSide) -> &'static str {
    match side {
        CandidateSide::Caller => "caller",
        CandidateSide::Callee => "callee",
    }
}

fn live_bindings(
    session_id: &str,
    side: CandidateSide,
    tx: &UnboundedSender<SignalingUpdate>,
) -> Vec<(EventKind, Handler)> {
    let mut bindings: Vec<(EventKind, Handler)> = Vec::new();

    if side == CandidateSide::Callee {
        let tx = tx.clone();
        let session = session_id.to_string();
        bindings.push((
            EventKind::CallAnswer,
            Arc::new(move |event: ChannelEvent| {
                if let ChannelEvent::CallAnswer(ev) = event {
                    if ev.session_id == session {
                        let _ = tx.unbounded_send(SignalingUpdate::Answer(ev.answer));
                    }
                }
            }),
        ));
    }

    let tx = tx.clone();
    let session = session_id.to_string();
    bindings.push((
        EventKind::CallCandidate,
        Arc::new(move |event: ChannelEvent| {
            if let ChannelEvent::CallCandidate(ev) = event {
                if ev.session_id == session && ev.side == side {
                    let _ = tx.unbounded_send(SignalingUpdate::Candidate(ev.candidate));
                } else {
                    debug!("ignoring candidate for other side/session");
                }
            }
        }),
    ));

    bindings
}

/// Keeps the channel subscription alive for as long as the update stream is
/// polled; dropping the stream releases the channel binding.
struct GuardedStream {
    rx: UnboundedReceiver<SignalingUpdate>,
    _subscription: Subscription,
}

impl Stream for GuardedStream {
    type Item = SignalingUpdate;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().rx).poll_next(cx)
    }
}
