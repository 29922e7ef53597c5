//! Local media acquisition seam.
//!
//! Capture hardware is platform territory; the call flow only needs "give me
//! local tracks or a typed failure". Real capture backends implement
//! [`MediaDevices`]; [`SyntheticMediaDevices`] provides silent/blank tracks
//! for tests and headless operation.

use std::sync::Arc;

use async_trait::async_trait;
use parlor_shared::MediaError;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// The local tracks backing one call. Owned by exactly one `CallSession`;
/// `stop` releases every track and is safe to call repeatedly.
pub struct LocalMedia {
    tracks: Vec<Arc<TrackLocalStaticSample>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<TrackLocalStaticSample>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<TrackLocalStaticSample>] {
        &self.tracks
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Stop every local track. The sample writers observe the dropped
    /// references and stop feeding; the RTP senders were already torn down
    /// with the peer connection.
    pub fn stop(&mut self) {
        self.tracks.clear();
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn capture(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Produces placeholder tracks (silent Opus, blank VP8) without touching any
/// hardware.
pub struct SyntheticMediaDevices;

#[async_trait]
impl MediaDevices for SyntheticMediaDevices {
    async fn capture(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        if !constraints.audio && !constraints.video {
            return Err(MediaError::DeviceUnavailable);
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    ..Default::default()
                },
                "audio".to_string(),
                "parlor-local".to_string(),
            )));
        }
        if constraints.video {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    ..Default::default()
                },
                "video".to_string(),
                "parlor-local".to_string(),
            )));
        }

        Ok(LocalMedia::new(tracks))
    }
}

/// Always refuses capture with the given error. Stands in for a user denying
/// the browser permission prompt or missing hardware.
pub struct DeniedMediaDevices(pub MediaError);

#[async_trait]
impl MediaDevices for DeniedMediaDevices {
    async fn capture(&self, _constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        Err(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn synthetic_capture_honors_constraints() {
        let devices = SyntheticMediaDevices;
        let both = devices.capture(MediaConstraints::default()).await.unwrap();
        assert_eq!(both.tracks().len(), 2);

        let audio_only = devices
            .capture(MediaConstraints {
                audio: true,
                video: false,
            })
            .await
            .unwrap();
        assert_eq!(audio_only.tracks().len(), 1);

        let neither = devices
            .capture(MediaConstraints {
                audio: false,
                video: false,
            })
            .await;
        assert!(matches!(neither, Err(MediaError::DeviceUnavailable)));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let devices = SyntheticMediaDevices;
        let mut media = devices.capture(MediaConstraints::default()).await.unwrap();
        media.stop();
        media.stop();
        assert!(media.is_stopped());
    }
}
