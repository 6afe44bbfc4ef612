//! Creates and tears down WebRTC peer connections: one primary (video out +
//! data channel in) and N audiences (video out only, sharing the primary's
//! track), with manual H.264 codec registration and an RTCP reader per
//! connection.

use crate::coordinator::{RoutineCoordinator, RtcpPacket};
use crate::error::BridgeError;
use crate::peer_registry::PeerRegistry;
use crate::state::{ApplicationState, DroneState};
use drone_bridge_protocol::{DataChannelCommand, DataChannelNotice, DroneCommand, IceServerEntry, MotionVector};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

pub struct RtcConfig {
    pub ice_servers: Vec<IceServerEntry>,
}

struct Inner {
    config: Option<RtcConfig>,
    primary_connection: Option<Arc<RTCPeerConnection>>,
    primary_id: Option<String>,
    audiences: HashMap<String, Arc<RTCPeerConnection>>,
    shared_video_track: Option<Arc<TrackLocalStaticSample>>,
}

/// Invariant: audience connections may only be created once `shared_video_track`
/// exists, i.e. after a primary has offered.
pub struct RtcHandler {
    inner: Mutex<Inner>,
    pub is_connected: AtomicBool,
    registry: Mutex<PeerRegistry>,
}

impl RtcHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                config: None,
                primary_connection: None,
                primary_id: None,
                audiences: HashMap::new(),
                shared_video_track: None,
            }),
            is_connected: AtomicBool::new(false),
            registry: Mutex::new(PeerRegistry::new()),
        })
    }

    pub async fn registry(&self) -> tokio::sync::MutexGuard<'_, PeerRegistry> {
        self.registry.lock().await
    }

    /// Closes the primary and every audience connection, drops the shared
    /// video track, and replaces the registry with a fresh one. Called once
    /// a restart has stopped the coordinator's channels, so a subsequent
    /// primary offer starts from EMPTY instead of hitting a stale EXIST.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(primary) = inner.primary_connection.take() {
            let _ = primary.close().await;
        }
        for (_, connection) in inner.audiences.drain() {
            let _ = connection.close().await;
        }
        inner.primary_id = None;
        inner.shared_video_track = None;
        drop(inner);

        self.is_connected.store(false, Ordering::SeqCst);
        *self.registry.lock().await = PeerRegistry::new();
    }

    /// `SetConfig`: stores ICE server config for subsequent connection creation.
    pub async fn set_config(&self, config: RtcConfig) {
        self.inner.lock().await.config = Some(config);
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, BridgeError> {
        let ice_servers = {
            let inner = self.inner.lock().await;
            inner.config.as_ref().map(|c| c.ice_servers.clone()).unwrap_or_default()
        };

        let mut media_engine = MediaEngine::default();

        // Register only H.264; no register_default_codecs() so Chrome never
        // negotiates VP8/VP9 against a track that only ever carries H.264.
        let h264_feedback = vec![
            RTCPFeedback { typ: "goog-remb".into(), parameter: "".into() },
            RTCPFeedback { typ: "ccm".into(), parameter: "fir".into() },
            RTCPFeedback { typ: "nack".into(), parameter: "".into() },
            RTCPFeedback { typ: "nack".into(), parameter: "pli".into() },
            RTCPFeedback { typ: "transport-cc".into(), parameter: "".into() },
        ];
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_string(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: H264_FMTP.to_string(),
                        rtcp_feedback: h264_feedback,
                    },
                    payload_type: 125,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| BridgeError::Negotiation(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| BridgeError::Negotiation(e.to_string()))?;

        let api = APIBuilder::new().with_media_engine(media_engine).with_interceptor_registry(registry).build();

        let rtc_ice_servers: Vec<RTCIceServer> = if ice_servers.is_empty() {
            vec![RTCIceServer { urls: vec!["stun:stun.l.google.com:19302".to_string()], ..Default::default() }]
        } else {
            ice_servers
                .into_iter()
                .map(|s| RTCIceServer {
                    urls: s.urls,
                    username: s.username.unwrap_or_default(),
                    credential: s.credential.unwrap_or_default(),
                })
                .collect()
        };

        let config = RTCConfiguration { ice_servers: rtc_ice_servers, ..Default::default() };
        let peer_connection = api.new_peer_connection(config).await.map_err(|e| BridgeError::Negotiation(e.to_string()))?;
        Ok(Arc::new(peer_connection))
    }

    /// Blocks on ICE-gathering-complete so the answer carries every
    /// candidate and trickle is avoided, per the negotiation contract.
    async fn negotiate(peer_connection: &Arc<RTCPeerConnection>, offer_sdp: &str) -> Result<String, BridgeError> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string()).map_err(|e| BridgeError::Parse(e.to_string()))?;
        peer_connection.set_remote_description(offer).await.map_err(|e| BridgeError::Negotiation(e.to_string()))?;

        let answer = peer_connection.create_answer(None).await.map_err(|e| BridgeError::Negotiation(e.to_string()))?;

        let mut gathering_complete = peer_connection.gathering_complete_promise().await;
        peer_connection.set_local_description(answer).await.map_err(|e| BridgeError::Negotiation(e.to_string()))?;
        let _ = gathering_complete.recv().await;

        let local_description = peer_connection
            .local_description()
            .await
            .ok_or_else(|| BridgeError::Negotiation("no local description after gathering".into()))?;
        Ok(local_description.sdp)
    }

    /// `StartPrimaryConnection`.
    pub async fn start_primary_connection(
        self: &Arc<Self>,
        peer_connection_id: String,
        offer_sdp: &str,
        coordinator: &Arc<RoutineCoordinator>,
        app_state: &Arc<ApplicationState>,
    ) -> Result<String, BridgeError> {
        let peer_connection = self.new_peer_connection().await?;

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                sdp_fmtp_line: H264_FMTP.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "ground-bridge".to_string(),
        ));

        let sender = peer_connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| BridgeError::Negotiation(e.to_string()))?;

        {
            let mut inner = self.inner.lock().await;
            inner.primary_connection = Some(Arc::clone(&peer_connection));
            inner.primary_id = Some(peer_connection_id.clone());
            inner.shared_video_track = Some(Arc::clone(&video_track));
        }

        // Primary's RTCP reader publishes every packet (PLI and REMB both
        // drive the supervisor's bitrate/keyframe decisions).
        spawn_rtcp_reader(sender, peer_connection_id.clone(), Arc::clone(coordinator), false);

        let handler = Arc::clone(self);
        let state_for_ice = Arc::clone(app_state);
        let coordinator_for_ice = Arc::clone(coordinator);
        let pc_id_for_ice = peer_connection_id.clone();
        peer_connection.on_ice_connection_state_change(Box::new(move |ice_state| {
            let handler = Arc::clone(&handler);
            let app_state = Arc::clone(&state_for_ice);
            let coordinator = Arc::clone(&coordinator_for_ice);
            let pc_id = pc_id_for_ice.clone();
            Box::pin(async move {
                match ice_state {
                    RTCIceConnectionState::Connected => {
                        handler.is_connected.store(true, Ordering::SeqCst);
                        app_state.set_drone_state(DroneState::Land);
                        info!(peer_connection_id = %pc_id, "primary peer connected");
                    }
                    RTCIceConnectionState::Disconnected
                    | RTCIceConnectionState::Failed
                    | RTCIceConnectionState::Closed => {
                        handler.is_connected.store(false, Ordering::SeqCst);
                        app_state.set_drone_state(DroneState::Ready);
                        coordinator.send_command(DroneCommand::Vector(MotionVector::ZERO)).await;
                        warn!(peer_connection_id = %pc_id, ?ice_state, "primary peer connection dropped");
                    }
                    _ => {}
                }
            })
        }));

        let data_channel_tx = Arc::clone(coordinator);
        peer_connection.on_data_channel(Box::new(move |dc| {
            let coordinator_out = Arc::clone(&data_channel_tx);
            let coordinator_in = Arc::clone(&data_channel_tx);
            Box::pin(async move {
                let dc_for_open = Arc::clone(&dc);
                dc.on_open(Box::new(move || {
                    let dc = Arc::clone(&dc_for_open);
                    let coordinator = coordinator_out;
                    Box::pin(async move {
                        let mut out_rx = coordinator.subscribe_data_channel_out().await;
                        let mut stop_rx = coordinator.subscribe_stop().await;
                        loop {
                            tokio::select! {
                                _ = stop_rx.recv() => break,
                                text = out_rx.recv() => {
                                    let Ok(text) = text else { break };
                                    let notice = DataChannelNotice::new(text);
                                    let Ok(json) = serde_json::to_string(&notice) else { continue };
                                    if dc.send_text(json).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        let _ = dc.close().await;
                    })
                }));

                dc.on_message(Box::new(move |msg| {
                    let coordinator = Arc::clone(&coordinator_in);
                    Box::pin(async move {
                        match serde_json::from_slice::<DataChannelCommand>(&msg.data) {
                            Ok(parsed) => coordinator.send_command(DroneCommand::Vector(parsed.command)).await,
                            Err(e) => warn!("invalid data-channel command: {e}"),
                        }
                    })
                }));
            })
        }));

        let answer_sdp = Self::negotiate(&peer_connection, offer_sdp).await?;

        spawn_frame_pump(Arc::clone(coordinator), video_track);

        Ok(answer_sdp)
    }

    /// `StartAudienceConnection`.
    pub async fn start_audience_connection(
        self: &Arc<Self>,
        peer_connection_id: String,
        offer_sdp: &str,
        coordinator: &Arc<RoutineCoordinator>,
    ) -> Result<String, BridgeError> {
        let video_track = {
            let inner = self.inner.lock().await;
            inner.shared_video_track.clone().ok_or_else(|| BridgeError::Negotiation("NoVideoTrack".into()))?
        };

        let peer_connection = self.new_peer_connection().await?;
        let sender = peer_connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| BridgeError::Negotiation(e.to_string()))?;

        {
            let mut inner = self.inner.lock().await;
            inner.audiences.insert(peer_connection_id.clone(), Arc::clone(&peer_connection));
        }

        // Audience RTCP readers only forward PLI; REMB from an audience must
        // never influence the encoder bitrate.
        spawn_rtcp_reader(sender, peer_connection_id.clone(), Arc::clone(coordinator), true);

        // Teardown waiter: closes and removes this connection on either its
        // own stop signal (close message / DeleteAudience) or a global Stop.
        if let Some(stop_signal) = self.registry.lock().await.audience_stop_signal(&peer_connection_id) {
            spawn_audience_teardown_waiter(
                Arc::clone(self),
                peer_connection_id.clone(),
                stop_signal,
                Arc::clone(coordinator),
            );
        }

        let answer_sdp = Self::negotiate(&peer_connection, offer_sdp).await?;
        Ok(answer_sdp)
    }

    pub async fn send_audience_stop(&self, peer_connection_id: &str) {
        self.registry.lock().await.send_audience_stop(peer_connection_id);
    }

    pub async fn delete_audience(&self, peer_connection_id: &str) {
        self.registry.lock().await.delete_audience(peer_connection_id);
        let connection = self.inner.lock().await.audiences.remove(peer_connection_id);
        if let Some(connection) = connection {
            let _ = connection.close().await;
        }
    }
}

fn spawn_rtcp_reader(
    sender: Arc<webrtc::rtp_transceiver::rtp_sender::RTCRtpSender>,
    peer_connection_id: String,
    coordinator: Arc<RoutineCoordinator>,
    pli_only: bool,
) {
    coordinator.acquire_socket();
    tokio::spawn(async move {
        while let Ok((packets, _)) = sender.read_rtcp().await {
            for packet in packets {
                let is_pli =
                    packet.as_any().is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>();
                if pli_only && !is_pli {
                    continue;
                }
                coordinator
                    .send_rtcp(RtcpPacket { peer_connection_id: peer_connection_id.clone(), packet })
                    .await;
            }
        }
        coordinator.release_socket();
    });
}

/// Waits on the audience's own stop signal or a global `Stop`, then removes
/// and closes its connection. Tolerates the entry already being gone (e.g.
/// `delete_audience` raced it) since `HashMap::remove` just returns `None`.
fn spawn_audience_teardown_waiter(
    handler: Arc<RtcHandler>,
    peer_connection_id: String,
    stop_signal: Arc<Notify>,
    coordinator: Arc<RoutineCoordinator>,
) {
    tokio::spawn(async move {
        let mut global_stop = coordinator.subscribe_stop().await;
        tokio::select! {
            _ = stop_signal.notified() => {}
            _ = global_stop.recv() => {}
        }
        let connection = handler.inner.lock().await.audiences.remove(&peer_connection_id);
        if let Some(connection) = connection {
            let _ = connection.close().await;
        }
    });
}

fn spawn_frame_pump(coordinator: Arc<RoutineCoordinator>, video_track: Arc<TrackLocalStaticSample>) {
    tokio::spawn(async move {
        let Some(mut frames_rx) = coordinator.take_frames_rx().await else { return };
        let mut stop_rx = coordinator.subscribe_stop().await;
        let mut previous = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                frame = frames_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let now = tokio::time::Instant::now();
                    let duration = now.saturating_duration_since(previous);
                    previous = now;
                    let sample = webrtc::media::Sample {
                        data: frame,
                        duration: if duration.is_zero() { Duration::from_millis(33) } else { duration },
                        ..Default::default()
                    };
                    if video_track.write_sample(&sample).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn audience_connection_requires_shared_track_first() {
        let handler = RtcHandler::new();
        let coordinator = RoutineCoordinator::new();
        let result = handler.start_audience_connection("A1".to_string(), "v=0\r\n", &coordinator).await;
        assert!(matches!(result, Err(BridgeError::Negotiation(msg)) if msg == "NoVideoTrack"));
    }

    #[tokio::test]
    async fn is_connected_defaults_false() {
        let handler = RtcHandler::new();
        assert!(!handler.is_connected.load(Ordering::SeqCst));
    }
}
