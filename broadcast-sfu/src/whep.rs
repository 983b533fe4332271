//! Subscriber session
//!
//! A [`WhepSession`] owns one outbound peer connection and its two outbound
//! tracks. It decides per relayed packet whether to forward it, rewrites the
//! sequence number and timestamp onto its own continuous numbering, and keeps
//! video gated on a keyframe after every layer switch.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{RelayMode, SfuConfig};
use crate::connection::MediaConnection;
use crate::error::SfuError;
use crate::multi_codec_track::RtpWriter;
use crate::relay::{RelayPacket, RewriteState};
use crate::status::WhepSessionState;
use crate::types::{MediaKind, SessionId};

const BITRATE_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Outbound state of one media kind. Only mutated while relaying.
struct Outbound {
    writer: Option<Arc<dyn RtpWriter>>,
    rewrite: RewriteState,
    packets_written: u64,
    bytes_written: u64,
}

impl Outbound {
    fn new(writer: Arc<dyn RtpWriter>) -> Self {
        Self {
            writer: Some(writer),
            rewrite: RewriteState::default(),
            packets_written: 0,
            bytes_written: 0,
        }
    }
}

/// Bounded hand-off between a publisher read loop and this subscriber
struct PacketQueue {
    tx: mpsc::Sender<RelayPacket>,
    rx: Mutex<Option<mpsc::Receiver<RelayPacket>>>,
}

impl PacketQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

pub struct WhepSession {
    id: SessionId,
    connection: Arc<dyn MediaConnection>,

    closed: AtomicBool,
    waiting_for_keyframe: AtomicBool,

    audio_layer: RwLock<String>,
    video_layer: RwLock<String>,

    audio: Mutex<Outbound>,
    video: Mutex<Outbound>,
    audio_packets_dropped: AtomicU64,
    video_packets_dropped: AtomicU64,
    video_bitrate: AtomicU64,

    audio_queue: Option<PacketQueue>,
    video_queue: Option<PacketQueue>,

    events_tx: mpsc::Sender<String>,
    events_rx: Mutex<Option<mpsc::Receiver<String>>>,

    cancel: CancellationToken,
}

impl WhepSession {
    /// Create a subscriber. Relay queues are only drained once
    /// [`WhepSession::spawn_workers`] has been called.
    pub fn new(
        id: SessionId,
        connection: Arc<dyn MediaConnection>,
        audio: Arc<dyn RtpWriter>,
        video: Arc<dyn RtpWriter>,
        config: &SfuConfig,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(config.sse_channel_capacity.max(1));
        let (audio_queue, video_queue) = match config.relay_mode {
            RelayMode::Direct => (None, None),
            RelayMode::Queued => (
                Some(PacketQueue::new(config.audio_queue_capacity)),
                Some(PacketQueue::new(config.video_queue_capacity)),
            ),
        };

        info!(session_id = %id, relay_mode = ?config.relay_mode, "Creating WHEP session");

        Arc::new(Self {
            id,
            connection,
            closed: AtomicBool::new(false),
            waiting_for_keyframe: AtomicBool::new(true),
            audio_layer: RwLock::new(String::new()),
            video_layer: RwLock::new(String::new()),
            audio: Mutex::new(Outbound::new(audio)),
            video: Mutex::new(Outbound::new(video)),
            audio_packets_dropped: AtomicU64::new(0),
            video_packets_dropped: AtomicU64::new(0),
            video_bitrate: AtomicU64::new(0),
            audio_queue,
            video_queue,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            cancel: parent.child_token(),
        })
    }

    /// Start the queue drain tasks and the bitrate sampler.
    pub fn spawn_workers(self: &Arc<Self>) {
        for kind in [MediaKind::Audio, MediaKind::Video] {
            let receiver = self.queue(kind).and_then(|queue| queue.rx.lock().take());
            if let Some(receiver) = receiver {
                tokio::spawn(Arc::clone(self).drain_queue(kind, receiver));
            }
        }
        tokio::spawn(Arc::clone(self).sample_bitrate());
    }

    async fn drain_queue(self: Arc<Self>, kind: MediaKind, mut receiver: mpsc::Receiver<RelayPacket>) {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                packet = receiver.recv() => match packet {
                    Some(packet) => self.send_packet(kind, packet).await,
                    None => break,
                },
            }
        }
        debug!(session_id = %self.id, ?kind, "WHEP relay queue drained");
    }

    async fn sample_bitrate(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(BITRATE_SAMPLE_INTERVAL);
        let mut last_bytes = 0u64;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let bytes = self.video.lock().bytes_written;
                    self.video_bitrate
                        .store(bytes.saturating_sub(last_bytes), Ordering::Relaxed);
                    last_bytes = bytes;
                }
            }
        }
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_waiting_for_keyframe(&self) -> bool {
        self.waiting_for_keyframe.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn audio_layer(&self) -> String {
        self.audio_layer.read().clone()
    }

    #[must_use]
    pub fn video_layer(&self) -> String {
        self.video_layer.read().clone()
    }

    #[must_use]
    pub fn layer(&self, kind: MediaKind) -> String {
        match kind {
            MediaKind::Audio => self.audio_layer(),
            MediaKind::Video => self.video_layer(),
        }
    }

    /// True when this subscriber is tuned to `layer` for `kind`.
    #[must_use]
    pub fn is_tuned_to(&self, kind: MediaKind, layer: &str) -> bool {
        match kind {
            MediaKind::Audio => *self.audio_layer.read() == layer,
            MediaKind::Video => *self.video_layer.read() == layer,
        }
    }

    pub fn set_audio_layer(&self, rid: &str) {
        info!(session_id = %self.id, rid = %rid, "Setting audio layer");
        *self.audio_layer.write() = rid.to_string();
    }

    /// Switch video layer. Nothing is written until the next keyframe.
    pub fn set_video_layer(&self, rid: &str) {
        info!(session_id = %self.id, rid = %rid, "Setting video layer");
        *self.video_layer.write() = rid.to_string();
        self.waiting_for_keyframe.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn audio_packets_dropped(&self) -> u64 {
        self.audio_packets_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn video_packets_dropped(&self) -> u64 {
        self.video_packets_dropped.load(Ordering::Relaxed)
    }

    /// Packets waiting in the relay queue of `kind`
    #[must_use]
    pub fn queued_packets(&self, kind: MediaKind) -> usize {
        self.queue(kind).map_or(0, PacketQueue::len)
    }

    fn queue(&self, kind: MediaKind) -> Option<&PacketQueue> {
        match kind {
            MediaKind::Audio => self.audio_queue.as_ref(),
            MediaKind::Video => self.video_queue.as_ref(),
        }
    }

    fn dropped_counter(&self, kind: MediaKind) -> &AtomicU64 {
        match kind {
            MediaKind::Audio => &self.audio_packets_dropped,
            MediaKind::Video => &self.video_packets_dropped,
        }
    }

    /// Hand a relayed packet to this subscriber without blocking the caller
    /// on a slow peer. Returns false when the packet was dropped because the
    /// relay queue is full.
    pub async fn deliver(&self, kind: MediaKind, packet: RelayPacket) -> bool {
        let Some(queue) = self.queue(kind) else {
            self.send_packet(kind, packet).await;
            return true;
        };

        match queue.tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped_counter(kind).fetch_add(1, Ordering::Relaxed);
                trace!(session_id = %self.id, ?kind, "Relay queue full, dropping packet");
                false
            }
            // Queue consumer is gone, the session is closing
            Err(TrySendError::Closed(_)) => true,
        }
    }

    pub async fn send_packet(&self, kind: MediaKind, packet: RelayPacket) {
        match kind {
            MediaKind::Audio => self.send_audio_packet(packet).await,
            MediaKind::Video => self.send_video_packet(packet).await,
        }
    }

    pub async fn send_audio_packet(&self, packet: RelayPacket) {
        if self.is_closed() {
            return;
        }
        self.write(MediaKind::Audio, packet).await;
    }

    pub async fn send_video_packet(&self, packet: RelayPacket) {
        if self.is_closed() {
            return;
        }

        if self.is_waiting_for_keyframe() {
            if !packet.is_keyframe {
                return;
            }
            let _ = self.waiting_for_keyframe.compare_exchange(
                true,
                false,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            debug!(session_id = %self.id, layer = %packet.layer, "Keyframe received, resuming video");
        }

        self.write(MediaKind::Video, packet).await;
    }

    async fn write(&self, kind: MediaKind, mut packet: RelayPacket) {
        let writer = {
            let mut outbound = match kind {
                MediaKind::Audio => self.audio.lock(),
                MediaKind::Video => self.video.lock(),
            };
            let Some(writer) = outbound.writer.clone() else {
                return;
            };
            let (sequence_number, timestamp) = outbound
                .rewrite
                .advance(packet.sequence_delta, packet.timestamp_delta);
            outbound.packets_written += 1;
            outbound.bytes_written += packet.packet.payload.len() as u64;
            packet.packet.header.sequence_number = sequence_number;
            packet.packet.header.timestamp = timestamp;
            writer
        };

        if let Err(e) = writer.write_rtp(&mut packet.packet, packet.codec).await {
            self.dropped_counter(kind).fetch_add(1, Ordering::Relaxed);
            match e {
                SfuError::TransportClosed => {
                    info!(session_id = %self.id, "WHEP connection dropped");
                    self.close().await;
                }
                SfuError::UnresolvedCodec(codec) => {
                    debug!(session_id = %self.id, ?codec, "Skipping packet with unnegotiated codec");
                }
                e => warn!(session_id = %self.id, ?kind, error = %e, "Failed to write RTP packet"),
            }
        }
    }

    /// Queue a pre-rendered SSE event. Dropped when the client is not
    /// keeping up.
    pub fn send_event(&self, event: String) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.events_tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                debug!(session_id = %self.id, "SSE channel full, skipping event");
                false
            }
        }
    }

    /// Take the SSE event receiver (can only be called once).
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<String>> {
        self.events_rx.lock().take()
    }

    /// Close the session. Only the first call has any effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(session_id = %self.id, "Closing WHEP session");

        if let Err(e) = self.connection.close().await {
            warn!(session_id = %self.id, error = %e, "Failed to close WHEP peer connection");
        }

        self.audio.lock().writer = None;
        self.video.lock().writer = None;

        self.cancel.cancel();
    }

    #[must_use]
    pub fn state(&self) -> WhepSessionState {
        let audio = self.audio.lock();
        let video = self.video.lock();

        WhepSessionState {
            id: self.id.clone(),
            audio_layer_current: self.audio_layer(),
            audio_timestamp: audio.rewrite.timestamp,
            audio_packets_written: audio.packets_written,
            audio_packets_dropped: self.audio_packets_dropped(),
            audio_sequence_number: audio.rewrite.sequence_number,
            video_layer_current: self.video_layer(),
            video_timestamp: video.rewrite.timestamp,
            video_bitrate: self.video_bitrate.load(Ordering::Relaxed),
            video_packets_written: video.packets_written,
            video_packets_dropped: self.video_packets_dropped(),
            video_sequence_number: video.rewrite.sequence_number,
        }
    }
}
