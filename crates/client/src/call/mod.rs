//! One-to-one call flow: media seam, peer construction, signaling store,
//! and the call session state machine.

mod media;
mod peer;
mod remote;
mod session;
mod store;

pub use media::{
    DeniedMediaDevices, LocalMedia, MediaConstraints, MediaDevices, SyntheticMediaDevices,
};
pub use remote::RemoteSignalingStore;
pub use session::{CallConfig, CallRole, CallSession, CallState};
pub use store::{MemorySignalingStore, SignalingStore, SignalingUpdate, UpdateStream};
