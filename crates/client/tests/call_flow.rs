//! End-to-end call signaling scenarios over the in-process store.

use std::sync::Arc;
use std::time::Duration;

use parlor_client::call::{
    CallConfig, CallSession, CallState, DeniedMediaDevices, MemorySignalingStore, SignalingStore,
    SyntheticMediaDevices,
};
use parlor_client::shared::{CandidateSide, IceCandidate, MediaError, SignalingError};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn caller_session(store: &Arc<MemorySignalingStore>) -> CallSession {
    CallSession::new(
        store.clone(),
        Arc::new(SyntheticMediaDevices),
        CallConfig::default(),
    )
}

fn test_candidate() -> IceCandidate {
    IceCandidate {
        candidate: "candidate:1 1 udp 2122252543 192.0.2.10 50004 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

async fn wait_for_state(session: &CallSession, want: CallState) {
    let mut rx = session.watch_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            rx.changed().await.expect("state watch closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want:?}, got {:?}", session.state()));
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn caller_and_callee_complete_the_handshake() {
    init_logging();
    let store = Arc::new(MemorySignalingStore::new());

    let caller = caller_session(&store);
    let session_id = caller.start().await.expect("caller start");
    assert_eq!(caller.state(), CallState::AwaitingAnswer);

    let record = store.read(&session_id).await.unwrap().expect("record exists");
    assert!(record.offer.is_some(), "offer written before any answer");
    assert!(record.answer.is_none());

    let callee = caller_session(&store);
    callee.join(&session_id).await.expect("callee join");
    assert_eq!(callee.state(), CallState::Connected);

    // The caller's update listener picks up the answer and connects too.
    wait_for_state(&caller, CallState::Connected).await;

    let record = store.read(&session_id).await.unwrap().unwrap();
    assert!(record.answer.is_some());
    assert!(record.is_established);
    assert!(record.offer.is_some(), "answer write merged, offer intact");

    // Callee-side candidates reach the caller's candidate listener.
    store
        .add_candidate(&session_id, CandidateSide::Callee, test_candidate())
        .await
        .unwrap();
    wait_for("caller to consume a callee candidate", || {
        caller.remote_candidate_count() >= 1
    })
    .await;

    caller.hang_up().await;
    callee.hang_up().await;
    assert!(!caller.is_active().await);
    assert!(!callee.is_active().await);
}

#[tokio::test]
async fn callee_tolerates_candidates_arriving_after_join() {
    let store = Arc::new(MemorySignalingStore::new());

    let caller = caller_session(&store);
    let session_id = caller.start().await.unwrap();

    let callee = caller_session(&store);
    callee.join(&session_id).await.unwrap();

    // Caller-side candidates appended only now, well after the callee began
    // listening: the live subscription still delivers them.
    store
        .add_candidate(&session_id, CandidateSide::Caller, test_candidate())
        .await
        .unwrap();
    wait_for("callee to consume a caller candidate", || {
        callee.remote_candidate_count() >= 1
    })
    .await;

    caller.hang_up().await;
    callee.hang_up().await;
}

#[tokio::test]
async fn denied_permission_leaves_idle_with_nothing_allocated() {
    let store = Arc::new(MemorySignalingStore::new());
    let session = CallSession::new(
        store,
        Arc::new(DeniedMediaDevices(MediaError::PermissionDenied)),
        CallConfig::default(),
    );

    let err = session.start().await.unwrap_err();
    assert_eq!(err, SignalingError::Media(MediaError::PermissionDenied));
    assert_eq!(session.state(), CallState::Idle);
    assert!(!session.is_active().await, "no peer connection left allocated");
    assert_eq!(session.session_id().await, None);
}

#[tokio::test]
async fn joining_a_session_without_an_offer_fails_cleanly() {
    let store = Arc::new(MemorySignalingStore::new());
    store.create("empty").await.unwrap();

    let callee = caller_session(&store);

    let err = callee.join("missing").await.unwrap_err();
    assert!(matches!(err, SignalingError::SessionNotFound(_)));

    let err = callee.join("empty").await.unwrap_err();
    assert!(matches!(err, SignalingError::SessionNotFound(_)));

    assert_eq!(callee.state(), CallState::Idle);
    assert!(!callee.is_active().await);
}

#[tokio::test]
async fn hang_up_is_idempotent_from_any_state() {
    let store = Arc::new(MemorySignalingStore::new());

    // Never started: both calls are no-ops on absent resources.
    let idle = caller_session(&store);
    idle.hang_up().await;
    idle.hang_up().await;
    assert_eq!(idle.state(), CallState::Ended);
    assert!(!idle.is_active().await);
    assert_eq!(idle.session_id().await, None);

    // Mid-call: resources are fully released and the remote sink detaches.
    let caller = caller_session(&store);
    let session_id = caller.start().await.unwrap();
    assert!(caller.is_active().await);

    caller.hang_up().await;
    caller.hang_up().await;
    assert_eq!(caller.state(), CallState::Ended);
    assert!(!caller.is_active().await);
    assert_eq!(caller.session_id().await, None);
    assert!(caller.watch_remote().borrow().is_none());

    // The record survives teardown; only local resources are released.
    assert!(store.read(&session_id).await.unwrap().is_some());
}

#[tokio::test]
async fn starting_twice_without_hanging_up_is_rejected() {
    let store = Arc::new(MemorySignalingStore::new());
    let caller = caller_session(&store);

    caller.start().await.unwrap();
    let err = caller.start().await.unwrap_err();
    assert!(matches!(err, SignalingError::Negotiation(_)));

    caller.hang_up().await;
    // After teardown a fresh call can start again.
    caller.start().await.unwrap();
    caller.hang_up().await;
}
