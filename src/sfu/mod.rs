use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZero;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use dashmap::DashMap;
use mediasoup::prelude::*;
use mediasoup::webrtc_transport::{
    WebRtcTransportListenInfos, WebRtcTransportOptions, WebRtcTransportRemoteParameters,
};
use mediasoup::worker::{WorkerLogLevel, WorkerSettings};
use mediasoup::worker_manager::WorkerManager;
use serde_json::Value;
use uuid::Uuid;

use crate::config::SfuConfig;
use crate::error::GatewayError;
use crate::types::events::TransportDirection;

// ── Worker pool ────────────────────────────────────────

/// One mediasoup worker per logical CPU, handed out round-robin to new
/// routers. A dying worker takes the whole server down: media state is not
/// recoverable and clients must reconnect to a fresh instance.
struct WorkerPool {
    workers: Vec<Worker>,
    next: AtomicUsize,
}

impl WorkerPool {
    async fn spawn(manager: &WorkerManager, size: usize) -> anyhow::Result<Self> {
        let mut workers = Vec::with_capacity(size);
        for _ in 0..size {
            let mut settings = WorkerSettings::default();
            settings.log_level = WorkerLogLevel::Warn;

            let worker = manager
                .create_worker(settings)
                .await
                .map_err(|e| anyhow!("failed to spawn SFU worker: {e}"))?;

            worker
                .on_dead(|reason| {
                    tracing::error!(?reason, "SFU worker died, shutting down");
                    std::process::exit(1);
                })
                .detach();

            workers.push(worker);
        }

        tracing::info!(workers = workers.len(), "SFU worker pool ready");
        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    fn get(&self) -> &Worker {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[index]
    }
}

// ── Voice sessions ─────────────────────────────────────

/// Media state for one user in one voice channel. Owned exclusively by the
/// session that created it; other sessions only read producer listings.
struct VoiceSession {
    user_id: Uuid,
    nickname: String,
    send_transport: Option<WebRtcTransport>,
    recv_transport: Option<WebRtcTransport>,
    producer: Option<Producer>,
    consumers: HashMap<ConsumerId, Consumer>,
}

impl VoiceSession {
    fn new(user_id: Uuid, nickname: String) -> Self {
        Self {
            user_id,
            nickname,
            send_transport: None,
            recv_transport: None,
            producer: None,
            consumers: HashMap::new(),
        }
    }
}

/// A voice channel backed by a mediasoup Router.
struct VoiceRoom {
    router: Router,
    sessions: DashMap<Uuid, VoiceSession>,
}

/// Transport connection details sent back through the handshake ack.
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Consumer details sent back through the handshake ack.
#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub kind: String,
    pub rtp_parameters: Value,
}

// ── Coordinator ────────────────────────────────────────

/// Owns the worker pool, the per-channel routers, and every voice session.
/// Routers come up lazily on the first voice event for a channel and go away
/// with the last session.
pub struct SfuCoordinator {
    _manager: WorkerManager,
    worker_pool: WorkerPool,
    rooms: Arc<DashMap<Uuid, VoiceRoom>>,
    /// producer -> owning user, recorded at produce time so every
    /// PRODUCER_CLOSED can carry both ids.
    producer_owners: Arc<DashMap<ProducerId, Uuid>>,
    listen_ip: IpAddr,
    announced_ip: Option<String>,
    rtc_port_range: RangeInclusive<u16>,
}

impl SfuCoordinator {
    pub async fn new(config: &SfuConfig) -> anyhow::Result<Self> {
        let listen_ip: IpAddr = config
            .listen_ip
            .parse()
            .map_err(|e| anyhow!("invalid SFU listen ip {:?}: {e}", config.listen_ip))?;

        let announced_ip = if config.announced_ip.is_empty() {
            None
        } else {
            Some(config.announced_ip.clone())
        };

        let workers = std::thread::available_parallelism()
            .map(NonZero::get)
            .unwrap_or(1);

        let manager = WorkerManager::new();
        let worker_pool = WorkerPool::spawn(&manager, workers).await?;

        Ok(Self {
            _manager: manager,
            worker_pool,
            rooms: Arc::new(DashMap::new()),
            producer_owners: Arc::new(DashMap::new()),
            listen_ip,
            announced_ip,
            rtc_port_range: config.rtc_min_port..=config.rtc_max_port,
        })
    }

    /// Router capability descriptor for a channel, creating the router on
    /// first use.
    pub async fn router_capabilities(&self, channel_id: Uuid) -> Result<Value, GatewayError> {
        let router = self.get_or_create_router(channel_id).await?;
        serde_json::to_value(router.rtp_capabilities())
            .map_err(|e| GatewayError::Sfu(anyhow!("failed to serialize capabilities: {e}")))
    }

    /// Create a send- or recv-direction transport for the user and remember
    /// it in their session slot.
    pub async fn create_transport(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
        nickname: &str,
        direction: TransportDirection,
    ) -> Result<TransportInfo, GatewayError> {
        let router = self.get_or_create_router(channel_id).await?;
        let transport = self.create_webrtc_transport(&router).await?;
        let info = transport_info(&transport);

        let room = self
            .rooms
            .get(&channel_id)
            .ok_or(GatewayError::NotFound("Voice room"))?;
        let mut session = room
            .sessions
            .entry(user_id)
            .or_insert_with(|| VoiceSession::new(user_id, nickname.to_string()));
        match direction {
            TransportDirection::Send => session.send_transport = Some(transport),
            TransportDirection::Recv => session.recv_transport = Some(transport),
        }

        tracing::debug!(%channel_id, %user_id, ?direction, transport_id = %info.id, "transport created");
        Ok(info)
    }

    /// Complete the DTLS handshake on whichever of the session's transports
    /// matches the id.
    pub async fn connect_transport(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), GatewayError> {
        let transport = {
            let room = self
                .rooms
                .get(&channel_id)
                .ok_or(GatewayError::NotFound("Voice room"))?;
            let session = room
                .sessions
                .get(&user_id)
                .ok_or(GatewayError::NotFound("Voice session"))?;

            if session.send_transport.as_ref().map(|t| t.id()) == Some(transport_id) {
                session.send_transport.clone()
            } else if session.recv_transport.as_ref().map(|t| t.id()) == Some(transport_id) {
                session.recv_transport.clone()
            } else {
                return Err(GatewayError::NotFound("Transport"));
            }
        };

        let transport = transport.ok_or(GatewayError::NotFound("Transport"))?;
        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| GatewayError::Sfu(anyhow!("failed to connect transport: {e}")))?;

        tracing::debug!(%channel_id, %user_id, %transport_id, "transport connected");
        Ok(())
    }

    /// Create the session's sole audio producer on its send transport.
    pub async fn produce(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, GatewayError> {
        if kind != MediaKind::Audio {
            return Err(GatewayError::InvalidInput("Only audio can be produced".into()));
        }

        let transport = {
            let room = self
                .rooms
                .get(&channel_id)
                .ok_or(GatewayError::NotFound("Voice room"))?;
            let session = room
                .sessions
                .get(&user_id)
                .ok_or(GatewayError::NotFound("Voice session"))?;
            let transport = session
                .send_transport
                .clone()
                .ok_or_else(|| GatewayError::Precondition("Send transport not ready".into()))?;
            if transport.id() != transport_id {
                return Err(GatewayError::Precondition(
                    "Producing requires the send transport".into(),
                ));
            }
            transport
        };

        let producer = transport
            .produce(ProducerOptions::new(kind, rtp_parameters))
            .await
            .map_err(|e| GatewayError::Sfu(anyhow!("failed to produce: {e}")))?;

        let producer_id = producer.id();
        self.producer_owners.insert(producer_id, user_id);

        // Clear the session's reference when the transport underneath goes
        // away, so stale producers are not listed to late joiners.
        {
            let rooms = Arc::clone(&self.rooms);
            let owners = Arc::clone(&self.producer_owners);
            producer
                .on_transport_close(move || {
                    owners.remove(&producer_id);
                    if let Some(room) = rooms.get(&channel_id) {
                        if let Some(mut session) = room.sessions.get_mut(&user_id) {
                            session.producer = None;
                        }
                    }
                })
                .detach();
        }

        if let Some(room) = self.rooms.get(&channel_id) {
            if let Some(mut session) = room.sessions.get_mut(&user_id) {
                session.producer = Some(producer);
            }
        }

        tracing::debug!(%channel_id, %user_id, %producer_id, "producer created");
        Ok(producer_id)
    }

    /// Create a paused consumer for `producer_id` on the session's recv
    /// transport. `on_producer_close` fires (once) when the source producer
    /// goes away, after the consumer has been dropped from the session.
    pub async fn consume(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
        producer_id: ProducerId,
        rtp_capabilities: Option<RtpCapabilities>,
        on_producer_close: impl FnOnce() + Send + 'static,
    ) -> Result<ConsumerInfo, GatewayError> {
        let (router, transport) = {
            let room = self
                .rooms
                .get(&channel_id)
                .ok_or(GatewayError::NotFound("Voice room"))?;
            let session = room
                .sessions
                .get(&user_id)
                .ok_or(GatewayError::NotFound("Voice session"))?;
            let transport = session
                .recv_transport
                .clone()
                .ok_or_else(|| GatewayError::Precondition("Receive transport not ready".into()))?;
            (room.router.clone(), transport)
        };

        let capabilities = match rtp_capabilities {
            Some(caps) => caps,
            None => router_consumer_capabilities(&router)?,
        };

        if !router.can_consume(&producer_id, &capabilities) {
            return Err(GatewayError::Precondition(
                "Cannot consume producer with the given capabilities".into(),
            ));
        }

        let mut options = ConsumerOptions::new(producer_id, capabilities);
        options.paused = true;

        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| GatewayError::Sfu(anyhow!("failed to consume: {e}")))?;

        let consumer_id = consumer.id();
        let info = ConsumerInfo {
            id: consumer_id.to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: media_kind_str(consumer.kind()).to_string(),
            rtp_parameters: serde_json::to_value(consumer.rtp_parameters())
                .map_err(|e| GatewayError::Sfu(anyhow!("failed to serialize parameters: {e}")))?,
        };

        {
            let rooms = Arc::clone(&self.rooms);
            consumer
                .on_producer_close(move || {
                    if let Some(room) = rooms.get(&channel_id) {
                        if let Some(mut session) = room.sessions.get_mut(&user_id) {
                            session.consumers.remove(&consumer_id);
                        }
                    }
                    on_producer_close();
                })
                .detach();
        }

        if let Some(room) = self.rooms.get(&channel_id) {
            if let Some(mut session) = room.sessions.get_mut(&user_id) {
                session.consumers.insert(consumer_id, consumer);
            }
        }

        tracing::debug!(%channel_id, %user_id, consumer_id = %info.id, %producer_id, "consumer created");
        Ok(info)
    }

    /// Resume a consumer created in the paused state.
    pub async fn resume_consumer(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
        consumer_id: ConsumerId,
    ) -> Result<(), GatewayError> {
        let consumer = {
            let room = self
                .rooms
                .get(&channel_id)
                .ok_or(GatewayError::NotFound("Voice room"))?;
            let session = room
                .sessions
                .get(&user_id)
                .ok_or(GatewayError::NotFound("Voice session"))?;
            session
                .consumers
                .get(&consumer_id)
                .cloned()
                .ok_or(GatewayError::NotFound("Consumer"))?
        };

        consumer
            .resume()
            .await
            .map_err(|e| GatewayError::Sfu(anyhow!("failed to resume consumer: {e}")))?;

        tracing::debug!(%channel_id, %user_id, %consumer_id, "consumer resumed");
        Ok(())
    }

    /// Close the session's producer. Returns an error if the id does not
    /// match the session's current producer.
    pub fn close_producer(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
        producer_id: ProducerId,
    ) -> Result<(), GatewayError> {
        let room = self
            .rooms
            .get(&channel_id)
            .ok_or(GatewayError::NotFound("Voice room"))?;
        let mut session = room
            .sessions
            .get_mut(&user_id)
            .ok_or(GatewayError::NotFound("Voice session"))?;

        match session.producer.as_ref().map(|p| p.id()) {
            Some(id) if id == producer_id => {
                session.producer = None;
                self.producer_owners.remove(&producer_id);
                tracing::debug!(%channel_id, %user_id, %producer_id, "producer closed");
                Ok(())
            }
            _ => Err(GatewayError::NotFound("Producer")),
        }
    }

    /// Every live producer in the channel except the given user's own.
    pub fn existing_producers(
        &self,
        channel_id: Uuid,
        except_user: Uuid,
    ) -> Vec<(Uuid, String, ProducerId)> {
        let Some(room) = self.rooms.get(&channel_id) else {
            return Vec::new();
        };

        room.sessions
            .iter()
            .filter(|entry| *entry.key() != except_user)
            .filter_map(|entry| {
                entry
                    .producer
                    .as_ref()
                    .map(|p| (entry.user_id, entry.nickname.clone(), p.id()))
            })
            .collect()
    }

    pub fn producer_owner(&self, producer_id: ProducerId) -> Option<Uuid> {
        self.producer_owners.get(&producer_id).map(|e| *e)
    }

    /// Tear down a user's voice session: consumers, producer, then both
    /// transports. Returns the closed producer id (for the PRODUCER_CLOSED
    /// broadcast) if one existed. Closes the router when the room empties.
    pub fn cleanup_session(&self, channel_id: Uuid, user_id: Uuid) -> Option<ProducerId> {
        let mut closed_producer = None;
        let mut room_empty = false;

        if let Some(room) = self.rooms.get(&channel_id) {
            if let Some((_, mut session)) = room.sessions.remove(&user_id) {
                session.consumers.clear();
                if let Some(producer) = session.producer.take() {
                    let producer_id = producer.id();
                    self.producer_owners.remove(&producer_id);
                    drop(producer);
                    closed_producer = Some(producer_id);
                }
                session.send_transport.take();
                session.recv_transport.take();
            }
            room_empty = room.sessions.is_empty();
        }

        if room_empty {
            // Dropping the room closes the router and everything under it
            self.rooms.remove(&channel_id);
            tracing::debug!(%channel_id, "voice room closed");
        }

        tracing::debug!(%channel_id, %user_id, "voice session cleaned up");
        closed_producer
    }

    /// Drop a whole channel's voice room (channel deleted).
    pub fn close_room(&self, channel_id: Uuid) {
        if let Some((_, room)) = self.rooms.remove(&channel_id) {
            for entry in room.sessions.iter() {
                if let Some(producer) = entry.producer.as_ref() {
                    self.producer_owners.remove(&producer.id());
                }
            }
            tracing::info!(%channel_id, "voice room closed");
        }
    }

    /// Shutdown: drop every room so routers close before the workers do.
    pub fn close(&self) {
        self.rooms.clear();
        self.producer_owners.clear();
        tracing::info!("SFU closed");
    }

    // ── Internal helpers ───────────────────────────────

    async fn get_or_create_router(&self, channel_id: Uuid) -> Result<Router, GatewayError> {
        if let Some(room) = self.rooms.get(&channel_id) {
            return Ok(room.router.clone());
        }

        let worker = self.worker_pool.get();
        let router = worker
            .create_router(RouterOptions::new(media_codecs()))
            .await
            .map_err(|e| GatewayError::Sfu(anyhow!("failed to create router: {e}")))?;

        tracing::info!(%channel_id, "voice router created");

        // A racing creation may have won the entry; hand back the stored one
        let room = self.rooms.entry(channel_id).or_insert_with(|| VoiceRoom {
            router: router.clone(),
            sessions: DashMap::new(),
        });
        Ok(room.router.clone())
    }

    async fn create_webrtc_transport(
        &self,
        router: &Router,
    ) -> Result<WebRtcTransport, GatewayError> {
        let udp_info = ListenInfo {
            protocol: Protocol::Udp,
            ip: self.listen_ip,
            announced_address: self.announced_ip.clone(),
            port: None,
            port_range: Some(self.rtc_port_range.clone()),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        };

        let tcp_info = ListenInfo {
            protocol: Protocol::Tcp,
            ip: self.listen_ip,
            announced_address: self.announced_ip.clone(),
            port: None,
            port_range: Some(self.rtc_port_range.clone()),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        };

        let listen_infos = WebRtcTransportListenInfos::new(udp_info).insert(tcp_info);
        let mut transport_options = WebRtcTransportOptions::new(listen_infos);
        transport_options.enable_udp = true;
        transport_options.enable_tcp = true;
        transport_options.prefer_udp = true;

        router
            .create_webrtc_transport(transport_options)
            .await
            .map_err(|e| GatewayError::Sfu(anyhow!("failed to create transport: {e}")))
    }
}

/// Convert RtpCapabilitiesFinalized to RtpCapabilities via serde (same JSON
/// schema), for clients that did not send their own capabilities.
fn router_consumer_capabilities(router: &Router) -> Result<RtpCapabilities, GatewayError> {
    let value = serde_json::to_value(router.rtp_capabilities())
        .map_err(|e| GatewayError::Sfu(anyhow!("failed to serialize capabilities: {e}")))?;
    serde_json::from_value(value)
        .map_err(|e| GatewayError::Sfu(anyhow!("failed to deserialize capabilities: {e}")))
}

fn transport_info(transport: &WebRtcTransport) -> TransportInfo {
    TransportInfo {
        id: transport.id().to_string(),
        ice_parameters: serde_json::to_value(transport.ice_parameters()).unwrap_or_default(),
        ice_candidates: serde_json::to_value(transport.ice_candidates()).unwrap_or_default(),
        dtls_parameters: serde_json::to_value(transport.dtls_parameters()).unwrap_or_default(),
    }
}

fn media_kind_str(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    }
}

/// Voice-only codec set: Opus at 48 kHz stereo.
fn media_codecs() -> Vec<RtpCodecCapability> {
    vec![RtpCodecCapability::Audio {
        mime_type: MimeTypeAudio::Opus,
        preferred_payload_type: Some(111),
        clock_rate: NonZero::new(48000).unwrap(),
        channels: NonZero::new(2).unwrap(),
        parameters: RtpCodecParametersParameters::default(),
        rtcp_feedback: vec![RtcpFeedback::TransportCc],
    }]
}
