//! The signaling store: persisted call-session documents plus a live update
//! feed per session.
//!
//! Record invariants enforced here: the offer is written before the answer,
//! the answer is written at most once and merges into the record, and
//! candidates append at any time after their side's description exists. The
//! update feed replays already-recorded state before streaming live changes,
//! so a peer that subscribes late misses nothing.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use parlor_shared::{
    CallRecord, CandidateSide, IceCandidate, SessionDescription, SignalingError,
};
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

/// One change on a session record, as seen by the opposite peer.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingUpdate {
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

pub type UpdateStream = Pin<Box<dyn Stream<Item = SignalingUpdate> + Send>>;

#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Create the session record. Creating an existing session is a no-op.
    async fn create(&self, session_id: &str) -> Result<(), SignalingError>;

    async fn read(&self, session_id: &str) -> Result<Option<CallRecord>, SignalingError>;

    async fn put_offer(
        &self,
        session_id: &str,
        offer: SessionDescription,
    ) -> Result<(), SignalingError>;

    /// Write the answer and the established marker, merging into the record.
    /// Fails with `SessionNotFound` when no offer exists and with
    /// `AnswerAlreadySet` on a second write.
    async fn put_answer(
        &self,
        session_id: &str,
        answer: SessionDescription,
    ) -> Result<(), SignalingError>;

    async fn add_candidate(
        &self,
        session_id: &str,
        side: CandidateSide,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError>;

    /// Stream the contributions of `side` (the remote peer's side, from the
    /// subscriber's point of view): recorded state first, live updates after.
    async fn updates(
        &self,
        session_id: &str,
        side: CandidateSide,
    ) -> Result<UpdateStream, SignalingError>;
}

#[derive(Clone)]
struct StoreEvent {
    side: CandidateSide,
    update: SignalingUpdate,
}

struct SessionEntry {
    record: CallRecord,
    caller_candidates: Vec<IceCandidate>,
    callee_candidates: Vec<IceCandidate>,
    events: broadcast::Sender<StoreEvent>,
}

impl SessionEntry {
    fn new(session_id: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            record: CallRecord {
                session_id: session_id.to_string(),
                offer: None,
                answer: None,
                is_established: false,
            },
            caller_candidates: Vec::new(),
            callee_candidates: Vec::new(),
            events,
        }
    }

    fn candidates(&self, side: CandidateSide) -> &[IceCandidate] {
        match side {
            CandidateSide::Caller => &self.caller_candidates,
            CandidateSide::Callee => &self.callee_candidates,
        }
    }
}

/// In-process signaling store. The reference implementation of the record
/// invariants; backs tests and single-process development.
pub struct MemorySignalingStore {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl MemorySignalingStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemorySignalingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingStore for MemorySignalingStore {
    async fn create(&self, session_id: &str) -> Result<(), SignalingError> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry::new(session_id));
        Ok(())
    }

    async fn read(&self, session_id: &str) -> Result<Option<CallRecord>, SignalingError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).map(|entry| entry.record.clone()))
    }

    async fn put_offer(
        &self,
        session_id: &str,
        offer: SessionDescription,
    ) -> Result<(), SignalingError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| SignalingError::SessionNotFound(session_id.to_string()))?;
        entry.record.offer = Some(offer);
        Ok(())
    }

    async fn put_answer(
        &self,
        session_id: &str,
        answer: SessionDescription,
    ) -> Result<(), SignalingError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .filter(|entry| entry.record.offer.is_some())
            .ok_or_else(|| SignalingError::SessionNotFound(session_id.to_string()))?;

        if entry.record.answer.is_some() {
            return Err(SignalingError::AnswerAlreadySet(session_id.to_string()));
        }

        entry.record.answer = Some(answer.clone());
        entry.record.is_established = true;
        let _ = entry.events.send(StoreEvent {
            side: CandidateSide::Callee,
            update: SignalingUpdate::Answer(answer),
        });
        Ok(())
    }

    async fn add_candidate(
        &self,
        session_id: &str,
        side: CandidateSide,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| SignalingError::SessionNotFound(session_id.to_string()))?;

        match side {
            CandidateSide::Caller => entry.caller_candidates.push(candidate.clone()),
            CandidateSide::Callee => entry.callee_candidates.push(candidate.clone()),
        }
        let _ = entry.events.send(StoreEvent {
            side,
            update: SignalingUpdate::Candidate(candidate),
        });
        Ok(())
    }

    async fn updates(
        &self,
        session_id: &str,
        side: CandidateSide,
    ) -> Result<UpdateStream, SignalingError> {
        // Subscribe and snapshot under the same lock: writes also broadcast
        // under the lock, so nothing lands between the snapshot and the live
        // feed, and nothing is replayed twice.
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| SignalingError::SessionNotFound(session_id.to_string()))?;

        let mut live = entry.events.subscribe();
        let mut replay = Vec::new();
        if side == CandidateSide::Callee {
            if let Some(answer) = entry.record.answer.clone() {
                replay.push(SignalingUpdate::Answer(answer));
            }
        }
        replay.extend(
            entry
                .candidates(side)
                .iter()
                .cloned()
                .map(SignalingUpdate::Candidate),
        );
        drop(sessions);

        let (tx, rx) = futures_channel::mpsc::unbounded();
        tokio::spawn(async move {
            for update in replay {
                if tx.unbounded_send(update).is_err() {
                    return;
                }
            }
            loop {
                match live.recv().await {
                    Ok(event) => {
                        if event.side != side {
                            continue;
                        }
                        if tx.unbounded_send(event.update).is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "signaling update feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(Box::pin(rx))
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use parlor_shared::SdpKind;

    use super::*;

    fn offer() -> SessionDescription {
        SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0 offer".to_string(),
        }
    }

    fn answer() -> SessionDescription {
        SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 answer".to_string(),
        }
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122252543 192.0.2.1 5000{n} typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn answer_before_offer_is_session_not_found() {
        let store = MemorySignalingStore::new();
        store.create("s1").await.unwrap();

        let result = store.put_answer("s1", answer()).await;
        assert!(matches!(result, Err(SignalingError::SessionNotFound(_))));

        // Unknown session behaves the same.
        let result = store.put_answer("nope", answer()).await;
        assert!(matches!(result, Err(SignalingError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn answer_is_written_at_most_once_and_merges() {
        let store = MemorySignalingStore::new();
        store.create("s1").await.unwrap();
        store.put_offer("s1", offer()).await.unwrap();
        store
            .add_candidate("s1", CandidateSide::Caller, candidate(1))
            .await
            .unwrap();

        store.put_answer("s1", answer()).await.unwrap();
        let result = store.put_answer("s1", answer()).await;
        assert!(matches!(result, Err(SignalingError::AnswerAlreadySet(_))));

        // The answer write merged: offer and established marker both present.
        let record = store.read("s1").await.unwrap().unwrap();
        assert_eq!(record.offer, Some(offer()));
        assert_eq!(record.answer, Some(answer()));
        assert!(record.is_established);
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let store = MemorySignalingStore::new();
        store.create("s1").await.unwrap();
        store.put_offer("s1", offer()).await.unwrap();
        store.create("s1").await.unwrap();

        let record = store.read("s1").await.unwrap().unwrap();
        assert_eq!(record.offer, Some(offer()));
    }

    #[tokio::test]
    async fn late_subscriber_gets_recorded_state_then_live_updates() {
        let store = MemorySignalingStore::new();
        store.create("s1").await.unwrap();
        store.put_offer("s1", offer()).await.unwrap();
        store.put_answer("s1", answer()).await.unwrap();
        store
            .add_candidate("s1", CandidateSide::Callee, candidate(1))
            .await
            .unwrap();

        // Subscriber arrives after the answer and a candidate were recorded.
        let mut updates = store.updates("s1", CandidateSide::Callee).await.unwrap();
        assert_eq!(
            updates.next().await,
            Some(SignalingUpdate::Answer(answer()))
        );
        assert_eq!(
            updates.next().await,
            Some(SignalingUpdate::Candidate(candidate(1)))
        );

        store
            .add_candidate("s1", CandidateSide::Callee, candidate(2))
            .await
            .unwrap();
        assert_eq!(
            updates.next().await,
            Some(SignalingUpdate::Candidate(candidate(2)))
        );
    }

    #[tokio::test]
    async fn updates_are_filtered_by_side() {
        let store = MemorySignalingStore::new();
        store.create("s1").await.unwrap();
        store.put_offer("s1", offer()).await.unwrap();

        let mut caller_feed = store.updates("s1", CandidateSide::Caller).await.unwrap();
        store
            .add_candidate("s1", CandidateSide::Callee, candidate(1))
            .await
            .unwrap();
        store
            .add_candidate("s1", CandidateSide::Caller, candidate(2))
            .await
            .unwrap();

        // The callee candidate never shows up on the caller-side feed.
        assert_eq!(
            caller_feed.next().await,
            Some(SignalingUpdate::Candidate(candidate(2)))
        );
    }

    #[tokio::test]
    async fn updates_for_unknown_session_fail() {
        let store = MemorySignalingStore::new();
        let result = store.updates("ghost", CandidateSide::Caller).await;
        assert!(matches!(result, Err(SignalingError::SessionNotFound(_))));
    }
}
