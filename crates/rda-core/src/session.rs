//! Session lifecycle, WebRTC signalling, and the capture-and-encode loop
//! (spec §4.3, §4.4, §4.6, §4.7, §5).
//!
//! Grounded on `sc-agent/src/connection.rs`'s single-owner connection
//! manager shape (one active session, `mpsc`-routed commands, once-guard
//! shutdown) and `other_examples/.../peer.rs`'s webrtc-rs plumbing
//! (`RTCPeerConnection` setup, dual H.264 codec registration, RTCP
//! PLI/FIR reader, ICE candidate callback). The reconnect-tolerant
//! `Failed`-state handling in that reference is intentionally not
//! copied: this session stops on `Failed`/`Closed` per spec.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rda_common::{AgentConfig, SessionError};
use rda_protocol::control::{ControlKind, ControlMessage, MonitorInfo, MonitorsReply};
use rda_protocol::input::InputEvent;
use rda_protocol::signalling::{AddIceCandidateRequest, StartRequest, StartResponse};
use rda_protocol::MAX_BITRATE_BPS;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_PCMU};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_header_extension::RTCRtpHeaderExtensionCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::adaptive::AdaptiveController;
use crate::audio::AudioCapturer;
use crate::capture::{self, Capturer, DesktopSwitchNotifier, GpuCapture, Monitor, PixelFormat};
use crate::cursor::{CursorTracker, MonitorGeometry};
use crate::differ::FrameDiffer;
use crate::encode::{self, Encoder};
use crate::metrics::{self, Metrics};

const PLAYOUT_DELAY_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/playout-delay";
const KEYFRAME_RATE_LIMIT: Duration = Duration::from_millis(500);
const CURSOR_SAMPLE_INTERVAL: Duration = Duration::from_millis(1000 / 120);
const ADAPTIVE_SAMPLE_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_FPS: u32 = 60;
const SCENE_CHANGE_KEYFRAME_SKIPS: u64 = 30;
const GPU_ERROR_RETRY_CAP: u32 = 3;
const SECURE_NUDGE_INTERVAL: Duration = Duration::from_millis(30);
const SECURE_REPAINT_INTERVAL: Duration = Duration::from_millis(500);
const SECURE_KEYFRAME_INTERVAL: Duration = Duration::from_secs(1);
const SECURE_NUDGE_COUNT: u32 = 3;

#[cfg(target_os = "windows")]
const VIDEO_SDP_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=4d001f";
#[cfg(not(target_os = "windows"))]
const VIDEO_SDP_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// Cross-thread latched flags (spec §9): the capture loop is the sole
/// consumer, handlers (control/input/RTCP) are the sole producers.
struct LoopFlags {
    click_flush: AtomicBool,
    input_active: AtomicBool,
    monitor_swap_pending: AtomicBool,
    stop: AtomicBool,
    target_fps: AtomicU32,
    audio_enabled: AtomicBool,
}

impl LoopFlags {
    fn new(initial_fps: u32) -> Self {
        Self {
            click_flush: AtomicBool::new(false),
            input_active: AtomicBool::new(false),
            monitor_swap_pending: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            target_fps: AtomicU32::new(initial_fps),
            audio_enabled: AtomicBool::new(true),
        }
    }
}

/// Swap slot for `switch_monitor` (spec §4.6, §9): the control handler
/// stages a freshly built capturer here; the capture loop is the only
/// thread that ever closes the outgoing one, after observing the swap,
/// so an in-flight GPU frame from the old capturer is never invalidated
/// out from under it.
struct SwapSlot {
    staged: StdMutex<Option<(u32, Box<dyn Capturer>)>>,
}

impl SwapSlot {
    fn new() -> Self {
        Self {
            staged: StdMutex::new(None),
        }
    }
}

unsafe impl Send for SwapSlot {}
unsafe impl Sync for SwapSlot {}

/// One active remote-desktop session: owns the peer connection, capture
/// and encode back-ends, and every task spawned on its behalf. Sub-
/// components hold no back-reference to `Session` (spec §9); they
/// communicate through the atomics in [`LoopFlags`] and the channels
/// built in [`Session::start`].
pub struct Session {
    pub id: String,
    peer_connection: Arc<RTCPeerConnection>,
    video_sender: Arc<RTCRtpSender>,
    encoder: Arc<StdMutex<Box<dyn Encoder>>>,
    adaptive: Arc<StdMutex<AdaptiveController>>,
    metrics: Arc<Metrics>,
    flags: Arc<LoopFlags>,
    swap_slot: Arc<SwapSlot>,
    audio_capturer: Arc<StdMutex<AudioCapturer>>,
    hard_bitrate_cap: u32,
    max_fps: u32,
    pipeline: rda_common::config::PipelineConfig,
    capture_thread: StdMutex<Option<std::thread::JoinHandle<()>>>,
    background_tasks: StdMutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
    metrics_logger: StdMutex<Option<JoinHandle<()>>>,
    /// Stashed between construction and the first `Connected` transition,
    /// when [`Session::begin_streaming`] takes ownership and spawns the
    /// capture thread.
    #[allow(clippy::type_complexity)]
    pre_connect: StdMutex<
        Option<(
            Box<dyn Capturer>,
            Arc<TrackLocalStaticSample>,
            Arc<TrackLocalStaticSample>,
            Arc<RTCDataChannel>,
        )>,
    >,
}

/// Message produced by the capture-and-encode thread, consumed by the
/// async task that forwards samples into the WebRTC track (spec §5:
/// "video samples from the encoder must be delivered to the track in
/// capture order; the encode path is single-threaded per session").
struct EncodedFrameMsg {
    data: Vec<u8>,
    duration: Duration,
}

impl Session {
    /// Implements spec §4.6 steps 2–14.
    async fn start(
        id: String,
        req: StartRequest,
        config: &AgentConfig,
    ) -> Result<(Arc<Self>, String), SessionError> {
        let hard_bitrate_cap = config.session.hard_bitrate_cap_bps.min(MAX_BITRATE_BPS);
        let ice_timeout = Duration::from_secs(config.session.ice_timeout_secs);
        let mut media_engine = MediaEngine::default();

        let video_feedback = vec![
            RTCPFeedback {
                typ: "goog-remb".into(),
                parameter: "".into(),
            },
            RTCPFeedback {
                typ: "ccm".into(),
                parameter: "fir".into(),
            },
            RTCPFeedback {
                typ: "nack".into(),
                parameter: "".into(),
            },
            RTCPFeedback {
                typ: "nack".into(),
                parameter: "pli".into(),
            },
            RTCPFeedback {
                typ: "transport-cc".into(),
                parameter: "".into(),
            },
        ];

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_string(),
                        clock_rate: 90_000,
                        channels: 0,
                        sdp_fmtp_line: VIDEO_SDP_FMTP.to_string(),
                        rtcp_feedback: video_feedback,
                    },
                    payload_type: 102,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| SessionError::SignalFailed(e.to_string()))?;

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_PCMU.to_string(),
                        clock_rate: 8_000,
                        channels: 1,
                        sdp_fmtp_line: "".to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 0,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| SessionError::SignalFailed(e.to_string()))?;

        media_engine
            .register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: PLAYOUT_DELAY_URI.to_string(),
                },
                RTPCodecType::Video,
                None,
            )
            .map_err(|e| SessionError::SignalFailed(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SessionError::SignalFailed(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = if req.ice_servers.is_empty() {
            vec![RTCIceServer {
                urls: config.session.default_ice_servers.clone(),
                ..Default::default()
            }]
        } else {
            req.ice_servers
                .into_iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.into_vec(),
                    username: s.username.unwrap_or_default(),
                    credential: s.credential.unwrap_or_default(),
                })
                .collect()
        };

        let pc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(pc_config)
                .await
                .map_err(|e| SessionError::SignalFailed(e.to_string()))?,
        );

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90_000,
                sdp_fmtp_line: VIDEO_SDP_FMTP.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "rda".to_string(),
        ));

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_string(),
                clock_rate: 8_000,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            "rda".to_string(),
        ));

        let video_sender = peer_connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| SessionError::SignalFailed(e.to_string()))?;

        peer_connection
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| SessionError::SignalFailed(e.to_string()))?;

        let display_index = req.display_index.unwrap_or(config.session.default_display_index);
        let capturer = capture::create_capturer(display_index)
            .map_err(|_| SessionError::NoDisplay)?;
        let (width, height) = capturer.screen_bounds();

        let (initial_bitrate, max_bitrate) = encode::initial_bitrate_for(width, height);
        let max_fps = DEFAULT_FPS;

        let mut encoder = encode::create_encoder(width, height, initial_bitrate, max_fps)
            .map_err(|e| SessionError::SignalFailed(e.to_string()))?;
        if encoder.is_placeholder() {
            return Err(SessionError::PlaceholderEncoder);
        }

        let capturer_caps = capturer.capabilities();
        if capturer_caps.is_bgra {
            encoder.set_pixel_format(PixelFormat::Bgra);
        }

        let mut capturer = capturer;
        if let Some(gpu) = capturer.as_gpu_capture() {
            if let Some(device) = gpu.d3d11_device() {
                encoder.set_d3d11_device(device);
            }
        }

        let adaptive_cooldown = Duration::from_secs(config.adaptive.cooldown_secs);
        let adaptive = AdaptiveController::with_cooldown(
            500_000.min(initial_bitrate),
            max_bitrate,
            initial_bitrate,
            adaptive_cooldown,
        )
        .map_err(|e| SessionError::SignalFailed(e.to_string()))?;

        let flags = Arc::new(LoopFlags::new(max_fps));
        let swap_slot = Arc::new(SwapSlot::new());
        let metrics = Arc::new(Metrics::new());
        let encoder = Arc::new(StdMutex::new(encoder));
        let adaptive = Arc::new(StdMutex::new(adaptive));
        let audio_capturer = Arc::new(StdMutex::new(AudioCapturer::new()));

        // Data channels the agent itself initiates (spec §4.6 step 10).
        for label in ["clipboard", "filedrop"] {
            peer_connection
                .create_data_channel(label, None)
                .await
                .map_err(|e| SessionError::SignalFailed(e.to_string()))?;
        }
        let cursor_channel = peer_connection
            .create_data_channel(
                "cursor",
                Some(RTCDataChannelInit {
                    ordered: Some(false),
                    max_retransmits: Some(0),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SessionError::SignalFailed(e.to_string()))?;

        let session = Arc::new(Self {
            id: id.clone(),
            peer_connection: Arc::clone(&peer_connection),
            video_sender: Arc::clone(&video_sender),
            encoder: Arc::clone(&encoder),
            adaptive: Arc::clone(&adaptive),
            metrics: Arc::clone(&metrics),
            flags: Arc::clone(&flags),
            swap_slot: Arc::clone(&swap_slot),
            audio_capturer: Arc::clone(&audio_capturer),
            hard_bitrate_cap,
            max_fps,
            pipeline: config.pipeline.clone(),
            capture_thread: StdMutex::new(None),
            background_tasks: StdMutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            metrics_logger: StdMutex::new(None),
            pre_connect: StdMutex::new(None),
        });

        // RTCP reader: PLI/FIR → force_keyframe, rate-limited (spec §4.6 step 4).
        {
            let encoder = Arc::clone(&encoder);
            let sender = Arc::clone(&video_sender);
            tokio::spawn(async move {
                let mut last_forced = Instant::now() - KEYFRAME_RATE_LIMIT;
                while let Ok((packets, _)) = sender.read_rtcp().await {
                    for pkt in &packets {
                        let pkt_any = pkt.as_any();
                        let is_keyframe_request = pkt_any
                            .is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                            || pkt_any.is::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>();
                        if is_keyframe_request && last_forced.elapsed() >= KEYFRAME_RATE_LIMIT {
                            last_forced = Instant::now();
                            encoder.lock().unwrap().force_keyframe();
                        }
                    }
                }
            });
        }

        // input/control data channels (viewer-initiated, spec §4.6 step 11).
        {
            let flags = Arc::clone(&flags);
            let encoder = Arc::clone(&encoder);
            let adaptive = Arc::clone(&adaptive);
            let audio_capturer = Arc::clone(&audio_capturer);
            let swap_slot = Arc::clone(&swap_slot);
            let hard_cap = hard_bitrate_cap;
            let max_fps = max_fps;
            peer_connection.on_data_channel(Box::new(move |dc| {
                let flags = Arc::clone(&flags);
                let encoder = Arc::clone(&encoder);
                let adaptive = Arc::clone(&adaptive);
                let audio_capturer = Arc::clone(&audio_capturer);
                let swap_slot = Arc::clone(&swap_slot);
                Box::pin(async move {
                    match dc.label() {
                        "input" => {
                            dc.on_message(Box::new(move |msg| {
                                if serde_json::from_slice::<InputEvent>(&msg.data).is_ok() {
                                    flags.input_active.store(true, Ordering::Relaxed);
                                    flags.click_flush.store(true, Ordering::Relaxed);
                                }
                                Box::pin(async {})
                            }));
                        }
                        "control" => {
                            let dc_reply = Arc::clone(&dc);
                            dc.on_message(Box::new(move |msg| {
                                let encoder = Arc::clone(&encoder);
                                let adaptive = Arc::clone(&adaptive);
                                let flags = Arc::clone(&flags);
                                let audio_capturer = Arc::clone(&audio_capturer);
                                let swap_slot = Arc::clone(&swap_slot);
                                let dc_reply = Arc::clone(&dc_reply);
                                Box::pin(async move {
                                    handle_control_message(
                                        &msg.data,
                                        &encoder,
                                        &adaptive,
                                        &flags,
                                        &audio_capturer,
                                        &swap_slot,
                                        &dc_reply,
                                        hard_cap,
                                        max_fps,
                                    )
                                    .await;
                                })
                            }));
                        }
                        _ => {}
                    }
                })
            }));
        }

        // Connection-state callback: Connected → start streaming;
        // Failed/Closed → stop session (spec §4.6 step 12, NOT the
        // reconnect-tolerant behaviour some references use).
        {
            let session_weak = Arc::downgrade(&session);
            let started = AtomicBool::new(false);
            let started = Arc::new(started);
            peer_connection.on_peer_connection_state_change(Box::new(move |state| {
                let session_weak = session_weak.clone();
                let started = Arc::clone(&started);
                Box::pin(async move {
                    match state {
                        RTCPeerConnectionState::Connected => {
                            if !started.swap(true, Ordering::SeqCst) {
                                if let Some(session) = session_weak.upgrade() {
                                    session.begin_streaming();
                                }
                            }
                        }
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            if let Some(session) = session_weak.upgrade() {
                                tracing::warn!(session = %session.id, ?state, "peer connection failed/closed, stopping session");
                                session.stop().await;
                            }
                        }
                        other => {
                            tracing::debug!(?other, "peer connection state changed");
                        }
                    }
                })
            }));
        }

        // The capture loop itself is spawned lazily from `begin_streaming`
        // once the peer connection reaches `Connected`, but it needs the
        // capturer/tracks/cursor channel captured now.
        session.stash_pre_connect_state(capturer, video_track, audio_track, cursor_channel);

        let offer = RTCSessionDescription::offer(req.sdp_offer)
            .map_err(|e| SessionError::SignalFailed(e.to_string()))?;
        peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| SessionError::SignalFailed(e.to_string()))?;

        let answer = peer_connection
            .create_answer(None)
            .await
            .map_err(|e| SessionError::SignalFailed(e.to_string()))?;

        let mut gather_complete = peer_connection.gathering_complete_promise().await;
        peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| SessionError::SignalFailed(e.to_string()))?;

        tokio::select! {
            _ = gather_complete.recv() => {}
            _ = tokio::time::sleep(ice_timeout) => {
                tracing::warn!(session = %id, "ICE gathering timed out, answering with partial candidates");
            }
        }

        let local_desc = peer_connection
            .local_description()
            .await
            .ok_or_else(|| SessionError::SignalFailed("no local description after gathering".into()))?;

        let metrics_logger = metrics::spawn_snapshot_logger(Arc::clone(&metrics), id.clone());
        *session.metrics_logger.lock().unwrap() = Some(metrics_logger);

        Ok((session, local_desc.sdp))
    }

    /// Spawns the adaptive sampler, cursor streamer, audio forwarder, and
    /// the dedicated capture-and-encode thread. Idempotent: the
    /// `pre_connect` stash is consumed exactly once.
    fn begin_streaming(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let (tx, rx) = mpsc::unbounded_channel::<EncodedFrameMsg>();

        let state = session.pre_connect.lock().unwrap().take();
        let Some((capturer, video_track, audio_track, cursor_channel)) = state else {
            tracing::warn!(session = %session.id, "begin_streaming called twice or before setup");
            return;
        };

        // Video-sample forwarder: keeps `write_sample` off the capture
        // thread so a transient WebRTC back-pressure stall never blocks
        // capture/encode (spec §4.3 back-pressure rule).
        {
            let metrics = Arc::clone(&session.metrics);
            let mut rx = rx;
            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    let sample = webrtc::media::Sample {
                        data: Bytes::from(frame.data),
                        duration: frame.duration,
                        ..Default::default()
                    };
                    match video_track.write_sample(&sample).await {
                        Ok(()) => metrics.record_sent(),
                        Err(e) => {
                            tracing::debug!(error = %e, "write_sample failed, counted as drop");
                            metrics.record_dropped();
                        }
                    }
                }
            });
        }

        // Audio forwarder: PCMU frames from the dedicated `cpal` capture
        // thread owned by `AudioCapturer`, written to the audio track
        // whenever `toggle_audio` leaves the flag set (spec §6 Open
        // Question #3: the track stays negotiated for the session's
        // lifetime, delivery is what's gated).
        {
            let (audio_tx, mut audio_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            session.audio_capturer.lock().unwrap().start_capture(&session.id, audio_tx);
            let flags = Arc::clone(&session.flags);
            const PCMU_FRAME_DURATION: Duration = Duration::from_millis(20);
            tokio::spawn(async move {
                while let Some(frame) = audio_rx.recv().await {
                    if !flags.audio_enabled.load(Ordering::Relaxed) {
                        continue;
                    }
                    let sample = webrtc::media::Sample {
                        data: Bytes::from(frame),
                        duration: PCMU_FRAME_DURATION,
                        ..Default::default()
                    };
                    let _ = audio_track.write_sample(&sample).await;
                }
            });
        }

        // Adaptive sampler: 2 s cadence, pulls RTCP-derived stats (spec §5).
        {
            let pc = Arc::clone(&session.peer_connection);
            let adaptive = Arc::clone(&session.adaptive);
            let encoder = Arc::clone(&session.encoder);
            let flags = Arc::clone(&session.flags);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(ADAPTIVE_SAMPLE_INTERVAL);
                loop {
                    ticker.tick().await;
                    if flags.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let stats = pc.get_stats().await;
                    let mut rtt_ms = 0.0;
                    let mut loss = 0.0;
                    for (_, report) in stats.reports.iter() {
                        if let StatsReportType::RemoteInboundRTP(rtp) = report {
                            rtt_ms = rtp.round_trip_time * 1000.0;
                            loss = rtp.fraction_lost;
                        }
                    }
                    let mut enc = encoder.lock().unwrap();
                    adaptive.lock().unwrap().update(rtt_ms, loss, &mut **enc);
                }
            });
            session.background_tasks.lock().unwrap().push(handle);
        }

        // Cursor streamer: 120 Hz, send-on-change (spec §4.6).
        {
            let flags = Arc::clone(&session.flags);
            let monitor_rect = capturer.screen_bounds();
            let handle = tokio::spawn(async move {
                let mut tracker = CursorTracker::new();
                let geometry = MonitorGeometry {
                    x: 0,
                    y: 0,
                    width: monitor_rect.0,
                    height: monitor_rect.1,
                };
                let mut ticker = tokio::time::interval(CURSOR_SAMPLE_INTERVAL);
                loop {
                    ticker.tick().await;
                    if flags.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Some(update) = tracker.sample(&geometry) {
                        if let Ok(json) = serde_json::to_string(&update) {
                            let _ = cursor_channel.send_text(json).await;
                        }
                    }
                }
            });
            session.background_tasks.lock().unwrap().push(handle);
        }

        // Capture-and-encode loop: dedicated OS thread, pinned for the
        // session lifetime on Windows where COM/SetThreadDesktop have
        // per-thread affinity (spec §5).
        {
            let flags = Arc::clone(&session.flags);
            let swap_slot = Arc::clone(&session.swap_slot);
            let encoder = Arc::clone(&session.encoder);
            let metrics = Arc::clone(&session.metrics);
            let max_fps = session.max_fps;
            let pipeline = session.pipeline.clone();
            let session_id = session.id.clone();
            let thread = std::thread::Builder::new()
                .name(format!("rda-capture-{session_id}"))
                .spawn(move || {
                    run_capture_loop(capturer, encoder, flags, swap_slot, metrics, tx, max_fps, pipeline, session_id);
                })
                .expect("failed to spawn capture thread");
            *session.capture_thread.lock().unwrap() = Some(thread);
        }
    }

    fn stash_pre_connect_state(
        self: &Arc<Self>,
        capturer: Box<dyn Capturer>,
        video_track: Arc<TrackLocalStaticSample>,
        audio_track: Arc<TrackLocalStaticSample>,
        cursor_channel: Arc<RTCDataChannel>,
    ) {
        *self.pre_connect.lock().unwrap() = Some((capturer, video_track, audio_track, cursor_channel));
    }

    /// Session stop (spec §5 cancellation): close the peer connection
    /// first to unblock RTCP/data-channel reads, signal the capture loop,
    /// join all tasks, then the loop itself tears down encoder → capturer.
    /// Idempotent via `stopped`.
    pub async fn stop(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.peer_connection.close().await;
        self.flags.stop.store(true, Ordering::SeqCst);

        if let Some(handle) = self.metrics_logger.lock().unwrap().take() {
            handle.abort();
        }
        for handle in self.background_tasks.lock().unwrap().drain(..) {
            handle.abort();
        }

        let thread = self.capture_thread.lock().unwrap().take();
        if let Some(thread) = thread {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }

        self.audio_capturer.lock().unwrap().stop_all();
        tracing::info!(session = %self.id, "session stopped");
    }

    pub async fn add_ice_candidate(&self, candidate: &str, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) -> Result<(), SessionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid,
            sdp_mline_index,
            ..Default::default()
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| SessionError::SignalFailed(e.to_string()))
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_control_message(
    raw: &[u8],
    encoder: &Arc<StdMutex<Box<dyn Encoder>>>,
    adaptive: &Arc<StdMutex<AdaptiveController>>,
    flags: &Arc<LoopFlags>,
    audio_capturer: &Arc<StdMutex<AudioCapturer>>,
    swap_slot: &Arc<SwapSlot>,
    reply_channel: &Arc<RTCDataChannel>,
    hard_cap: u32,
    max_fps: u32,
) {
    let msg: ControlMessage = match serde_json::from_slice(raw) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(error = %e, "invalid control message");
            return;
        }
    };

    match msg.kind {
        ControlKind::SetBitrate => {
            let Some(requested) = msg.value.as_ref().and_then(|v| v.as_u32()) else {
                return;
            };
            let capped = requested.min(hard_cap).min(MAX_BITRATE_BPS);
            let mut enc = encoder.lock().unwrap();
            if let Err(e) = adaptive.lock().unwrap().set_max_bitrate(capped, &mut **enc) {
                tracing::warn!(error = %e, "set_bitrate rejected");
            }
        }
        ControlKind::SetFps => {
            let Some(fps) = msg.value.as_ref().and_then(|v| v.as_u32()) else {
                return;
            };
            let clamped = fps.clamp(1, max_fps);
            flags.target_fps.store(clamped, Ordering::Relaxed);
        }
        ControlKind::RequestKeyframe => {
            encoder.lock().unwrap().force_keyframe();
        }
        ControlKind::ListMonitors => {
            let monitors: Vec<MonitorInfo> = capture::enumerate_monitors()
                .into_iter()
                .map(|m: Monitor| MonitorInfo {
                    index: m.index,
                    name: m.name,
                    x: m.rect.x,
                    y: m.rect.y,
                    width: m.rect.width,
                    height: m.rect.height,
                    is_primary: m.is_primary,
                })
                .collect();
            let reply = MonitorsReply::new(monitors);
            if let Ok(json) = serde_json::to_string(&reply) {
                let _ = reply_channel.send_text(json).await;
            }
        }
        ControlKind::ToggleAudio => {
            let Some(enabled) = msg.value.as_ref().and_then(|v| v.as_bool()) else {
                return;
            };
            flags.audio_enabled.store(enabled, Ordering::Relaxed);
            let _ = audio_capturer;
        }
        ControlKind::SwitchMonitor => {
            let Some(index) = msg.value.as_ref().and_then(|v| v.as_u32()) else {
                return;
            };
            match capture::create_capturer(index) {
                Ok(new_capturer) => {
                    *swap_slot.staged.lock().unwrap() = Some((index, new_capturer));
                    flags.monitor_swap_pending.store(true, Ordering::SeqCst);
                }
                Err(e) => tracing::warn!(error = %e, display = index, "switch_monitor failed to build capturer"),
            }
        }
    }
}

/// The capture-and-encode loop (spec §4.3). Runs on its own OS thread for
/// the session lifetime; never unpins, matching spec §9's open question
/// about pinned-thread lifetime (this loop is the sole owner of the
/// thread, so the invariant holds).
#[allow(clippy::too_many_arguments)]
fn run_capture_loop(
    mut capturer: Box<dyn Capturer>,
    encoder: Arc<StdMutex<Box<dyn Encoder>>>,
    flags: Arc<LoopFlags>,
    swap_slot: Arc<SwapSlot>,
    metrics: Arc<Metrics>,
    tx: mpsc::UnboundedSender<EncodedFrameMsg>,
    max_fps: u32,
    pipeline: rda_common::config::PipelineConfig,
    session_id: String,
) {
    let mut differ = FrameDiffer::new();
    let mut consecutive_skips: u64 = 0;
    let mut gpu_errors: u32 = 0;
    let mut gpu_disabled = false;
    let mut on_secure_desktop = false;
    let mut last_repaint_nudge = Instant::now();
    let mut last_secure_keyframe = Instant::now();
    let mut last_frame: Option<(Vec<u8>, bool)> = None;
    let idle_threshold: u64 = pipeline.idle_threshold as u64;
    let idle_sleep = Duration::from_millis(pipeline.idle_sleep_ms);
    let secure_fps_floor: u32 = pipeline.secure_fps_floor;

    loop {
        if flags.stop.load(Ordering::Relaxed) {
            break;
        }

        let iteration_start = Instant::now();

        // 1. Click-triggered flush.
        if flags.click_flush.swap(false, Ordering::SeqCst) {
            encoder.lock().unwrap().flush();
        }

        // 2. Input activity exits idle mode (tracked via consecutive_skips reset below).
        let input_active = flags.input_active.swap(false, Ordering::SeqCst);

        // 3. Monitor swap.
        if flags.monitor_swap_pending.swap(false, Ordering::SeqCst) {
            if let Some((_index, new_capturer)) = swap_slot.staged.lock().unwrap().take() {
                let old_capturer = std::mem::replace(&mut capturer, new_capturer);
                old_capturer_close(old_capturer);
                differ.reset();
                gpu_disabled = false;
                gpu_errors = 0;
                let mut enc = encoder.lock().unwrap();
                let (w, h) = capturer.screen_bounds();
                let _ = enc.set_dimensions(w, h);
                if let Some(gpu) = capturer.as_gpu_capture() {
                    if let Some(device) = gpu.d3d11_device() {
                        enc.set_d3d11_device(device);
                    }
                }
                enc.force_keyframe();
            }
        }

        // 4. Desktop-switch handling (spec §4.4).
        if let Some(notifier) = capturer.as_desktop_switch_notifier() {
            if notifier.consume_desktop_switch() {
                let now_secure = notifier.on_secure_desktop();
                let mut enc = encoder.lock().unwrap();
                if now_secure {
                    on_secure_desktop = true;
                    for _ in 0..SECURE_NUDGE_COUNT {
                        std::thread::sleep(SECURE_NUDGE_INTERVAL);
                    }
                    enc.flush();
                    enc.force_keyframe();
                } else {
                    on_secure_desktop = false;
                    enc.flush();
                    enc.force_keyframe();
                }
                last_repaint_nudge = Instant::now();
                last_secure_keyframe = Instant::now();
            }
        }

        // While on a secure desktop: periodic nudge/keyframe/FPS floor.
        let effective_fps = if on_secure_desktop {
            if last_secure_keyframe.elapsed() >= SECURE_KEYFRAME_INTERVAL {
                encoder.lock().unwrap().force_keyframe();
                last_secure_keyframe = Instant::now();
            }
            flags.target_fps.load(Ordering::Relaxed).max(secure_fps_floor)
        } else {
            flags.target_fps.load(Ordering::Relaxed)
        };

        // 5/6. Tight-loop/ticker mode and hardware FPS uncap are implicit:
        // the capturer's own `capture()` paces tight-loop back-ends, and
        // `effective_fps` already reflects the configured ceiling.
        let _ = max_fps;

        // 7. Choose the capture path.
        let caps = capturer.capabilities();
        let produced: Option<(Vec<u8>, bool)> = if caps.gpu_texture && !gpu_disabled {
            capture_gpu_path(&mut capturer, &encoder, &mut gpu_errors, &mut gpu_disabled, &metrics)
        } else {
            capture_cpu_path(&mut capturer, &encoder, &mut differ, caps.is_bgra, &metrics)
        };

        match produced {
            Some((data, is_keyframe)) => {
                metrics.record_encoded(data.len());
                let bits_per_sec = data.len() as f64 * 8.0 * effective_fps.max(1) as f64;
                metrics.record_bandwidth_kbps(bits_per_sec / 1000.0);
                let had_many_skips = consecutive_skips >= SCENE_CHANGE_KEYFRAME_SKIPS;
                consecutive_skips = 0;
                if had_many_skips && !is_keyframe {
                    encoder.lock().unwrap().force_keyframe();
                }
                last_frame = Some((data.clone(), is_keyframe));
                let duration = Duration::from_secs_f64(1.0 / effective_fps.max(1) as f64);
                if tx.send(EncodedFrameMsg { data, duration }).is_err() {
                    break;
                }
            }
            None => {
                metrics.record_skipped();
                consecutive_skips += 1;

                // Resend last frame at the secure FPS floor so the
                // viewer never sees a black gap while on a secure
                // desktop (spec §4.4).
                if on_secure_desktop {
                    if last_repaint_nudge.elapsed() >= SECURE_REPAINT_INTERVAL {
                        last_repaint_nudge = Instant::now();
                        if let Some((data, _)) = &last_frame {
                            let duration = Duration::from_secs_f64(1.0 / secure_fps_floor as f64);
                            let _ = tx.send(EncodedFrameMsg {
                                data: data.clone(),
                                duration,
                            });
                        }
                    }
                }
            }
        }

        if input_active {
            consecutive_skips = 0;
        }

        // 9. Idle mode.
        let sleep_for = if consecutive_skips >= idle_threshold {
            idle_sleep
        } else {
            let target = Duration::from_secs_f64(1.0 / effective_fps.max(1) as f64);
            target.saturating_sub(iteration_start.elapsed())
        };
        if !sleep_for.is_zero() {
            std::thread::sleep(sleep_for);
        }
    }

    capturer.close();
    encoder.lock().unwrap().close();
    tracing::info!(session = %session_id, "capture loop exited");
}

fn old_capturer_close(mut capturer: Box<dyn Capturer>) {
    capturer.close();
}

fn capture_gpu_path(
    capturer: &mut Box<dyn Capturer>,
    encoder: &Arc<StdMutex<Box<dyn Encoder>>>,
    gpu_errors: &mut u32,
    gpu_disabled: &mut bool,
    metrics: &Arc<Metrics>,
) -> Option<(Vec<u8>, bool)> {
    let gpu = capturer.as_gpu_capture()?;
    let capture_start = Instant::now();
    let texture = match gpu.capture_texture() {
        Ok(Some(tex)) => tex,
        Ok(None) => return None,
        Err(e) => {
            tracing::debug!(error = %e, "gpu capture_texture failed");
            return None;
        }
    };
    metrics.record_captured();
    metrics.record_capture_ms(capture_start.elapsed().as_secs_f64() * 1000.0);

    let encode_start = Instant::now();
    let result = encoder.lock().unwrap().encode_texture(&texture);
    metrics.record_encode_ms(encode_start.elapsed().as_secs_f64() * 1000.0);
    capturer.as_gpu_capture().map(|g| g.release_texture());

    match result {
        Ok(Some(sample)) => {
            *gpu_errors = 0;
            Some((sample.data, sample.is_keyframe))
        }
        Ok(None) => {
            *gpu_errors = 0;
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "gpu encode_texture failed");
            *gpu_errors += 1;
            if *gpu_errors >= GPU_ERROR_RETRY_CAP {
                tracing::warn!("disabling GPU capture path for this session after repeated errors");
                *gpu_disabled = true;
            } else {
                encoder.lock().unwrap().force_keyframe();
            }
            None
        }
    }
}

fn capture_cpu_path(
    capturer: &mut Box<dyn Capturer>,
    encoder: &Arc<StdMutex<Box<dyn Encoder>>>,
    differ: &mut FrameDiffer,
    is_bgra: bool,
    metrics: &Arc<Metrics>,
) -> Option<(Vec<u8>, bool)> {
    let capture_start = Instant::now();
    let frame = match capturer.capture() {
        Ok(Some(f)) => f,
        Ok(None) => return None,
        Err(e) => {
            tracing::debug!(error = %e, "capture() failed");
            return None;
        }
    };
    metrics.record_captured();
    metrics.record_capture_ms(capture_start.elapsed().as_secs_f64() * 1000.0);

    if !differ.has_changed(&frame) {
        frame.release();
        return None;
    }

    let scale_start = Instant::now();
    let format = if is_bgra { PixelFormat::Bgra } else { frame.format };
    let bytes = frame.bytes().to_vec();
    frame.release();
    metrics.record_scale_ms(scale_start.elapsed().as_secs_f64() * 1000.0);

    let encode_start = Instant::now();
    let result = encoder.lock().unwrap().encode(&bytes, format);
    metrics.record_encode_ms(encode_start.elapsed().as_secs_f64() * 1000.0);

    match result {
        Ok(Some(sample)) => Some((sample.data, sample.is_keyframe)),
        Ok(None) => None,
        Err(e) => {
            tracing::debug!(error = %e, "encode() failed");
            None
        }
    }
}

/// Enforces "at most one active session" (spec §4.6 step 1, §5).
pub struct SessionManager {
    config: AgentConfig,
    current: AsyncMutex<Option<Arc<Session>>>,
}

impl SessionManager {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            current: AsyncMutex::new(None),
        }
    }

    pub async fn start(&self, req: StartRequest) -> Result<StartResponse, SessionError> {
        let mut slot = self.current.lock().await;
        if let Some(existing) = slot.take() {
            existing.stop().await;
        }

        let session_id = req.session_id.clone();

        let (session, sdp_answer) = Session::start(session_id, req, &self.config).await?;
        *slot = Some(session);
        Ok(StartResponse { sdp_answer })
    }

    pub async fn add_ice_candidate(&self, req: AddIceCandidateRequest) -> Result<(), SessionError> {
        let slot = self.current.lock().await;
        let session = slot.as_ref().ok_or(SessionError::AlreadyStopped)?;
        if session.id != req.session_id {
            return Err(SessionError::AlreadyStopped);
        }
        session
            .add_ice_candidate(&req.candidate, req.sdp_mid, req.sdp_mline_index)
            .await
    }

    pub async fn stop(&self, session_id: &str) -> Result<(), SessionError> {
        let mut slot = self.current.lock().await;
        match slot.as_ref() {
            Some(session) if session.id == session_id => {
                let session = slot.take().unwrap();
                session.stop().await;
                Ok(())
            }
            Some(_) | None => Err(SessionError::AlreadyStopped),
        }
    }
}
