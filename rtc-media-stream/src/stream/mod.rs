//! The media stream engine.
//!
//! A [`MediaStream`] ties a connector to the transform chain: outbound packets
//! run through the chain in forward order and leave on the connector, inbound
//! datagrams arrive on the connector's receive threads, run through the chain
//! in reverse and are dispatched to the receive-stream registry. Everything
//! but the receive threads runs on the caller's thread.
//!
//! Locks are taken in a fixed order: stream state, then chain, then the
//! payload type and extension maps. Events and collaborator notifications
//! that may call back into the stream are issued after the locks are released.

pub mod audio;
pub mod events;
pub mod receive_stream;
pub mod video;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use rtcp::goodbye::Goodbye;
use rtp::sequence::Sequencer;
use shared::error::{Error, Result};
use shared::time::SystemInstant;

use crate::collaborators::{
    DeviceSession, EncryptionControl, OUTPUT_FORMAT_PROPERTY, PropertyChange, ReceiveStreamHandle,
    RtpTranslator,
};
use crate::config::MediaStreamConfig;
use crate::connector::input_stream::{InputEvent, RtpConnectorInputStream};
use crate::connector::transport::PacketTransport;
use crate::connector::{ConnectorKind, RtpConnector};
use crate::direction::MediaDirection;
use crate::format::{ExtensionDescriptor, ExtensionMap, FormatRegistry, MediaFormat, MediaType};
use crate::packet::{PacketKind, PacketPool, RawPacket};
use crate::ssrc::{SsrcFactory, SsrcManager};
use crate::stats::{MediaStreamStats, SharedStats};
use crate::transform::abs_send_time::AbsSendTimeStamper;
use crate::transform::caching::{CachingTransformer, PacketCache};
use crate::transform::csrc::{CsrcAudioLevelListeners, CsrcList, CsrcTransformerBuilder};
use crate::transform::discard::{DiscardControl, DiscardTransformer};
use crate::transform::dtmf::DtmfControl;
use crate::transform::ohb::OriginalHeaderBlockTransformer;
use crate::transform::padding_termination::PaddingTermination;
use crate::transform::payload_type::{PayloadTypeOverrides, PayloadTypeTransformer};
use crate::transform::remb::{BitrateEstimate, RemoteBitrateEstimator};
use crate::transform::retransmission_requester::{
    RetransmissionRequester, RetransmissionRequesterBuilder,
};
use crate::transform::rtcp_termination::{RtcpTermination, RtcpTerminationBuilder};
use crate::transform::rtx::RtxSsrcMap;
use crate::transform::ssrc_audio_level::{AudioLevelListeners, LocalAudioLevel};
use crate::transform::statistics::StatisticsTransformer;
use crate::transform::tcc::{TccEgress, TccIngress, TransportCcEngine};
use crate::transform::track_receiver::{TrackReceiver, TrackTable};
use crate::transform::{PayloadTypeMap, StageSlot, TransformChain, TransformStage};

pub use events::{MediaStreamEvent, MediaStreamEventFn, ReceiveStreamEvent};
pub use receive_stream::{ReceiveStream, ReceiveStreamRegistry};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

const HALVES: [MediaDirection; 2] = [MediaDirection::SendOnly, MediaDirection::RecvOnly];

fn includes(direction: MediaDirection, half: MediaDirection) -> bool {
    half.and_not(direction) == MediaDirection::Inactive
}

/// Shared state of the stages, kept by the stream so that it outlives chain
/// rebuilds and can be driven from the stream's API.
#[derive(Debug, Clone)]
pub struct StageHandles {
    pub cache: PacketCache,
    pub rtx_ssrcs: RtxSsrcMap,
    pub discard: DiscardControl,
    pub dtmf: DtmfControl,
    pub csrcs: CsrcList,
    pub csrc_listeners: CsrcAudioLevelListeners,
    pub audio_levels: AudioLevelListeners,
    pub local_level: LocalAudioLevel,
    pub drop_silence: Arc<AtomicBool>,
    pub pt_overrides: PayloadTypeOverrides,
    pub tcc: TransportCcEngine,
    pub bitrate_estimate: BitrateEstimate,
    pub tracks: TrackTable,
}

impl StageHandles {
    fn new(config: &MediaStreamConfig) -> Self {
        Self {
            cache: PacketCache::new(config.caching),
            rtx_ssrcs: RtxSsrcMap::default(),
            discard: DiscardControl::default(),
            dtmf: DtmfControl::default(),
            csrcs: CsrcList::default(),
            csrc_listeners: CsrcAudioLevelListeners::default(),
            audio_levels: AudioLevelListeners::default(),
            local_level: LocalAudioLevel::default(),
            drop_silence: Arc::new(AtomicBool::new(false)),
            pt_overrides: PayloadTypeOverrides::default(),
            tcc: TransportCcEngine::default(),
            bitrate_estimate: BitrateEstimate::default(),
            tracks: TrackTable::default(),
        }
    }
}

fn install(chain: &mut TransformChain, slot: StageSlot, stage: Option<Box<dyn TransformStage>>) {
    if let Some(stage) = stage {
        chain.set(slot, stage);
    }
}

pub const DEFAULT_PRIORITY: u8 = 5;

/// What differs between audio and video streams: which optional stages the
/// chain carries and how urgently they are scheduled.
pub trait MediaKind: Send + Sync {
    fn media_type(&self) -> MediaType;

    fn create_dtmf_stage(&self, _handles: &StageHandles) -> Option<Box<dyn TransformStage>> {
        None
    }

    fn create_ssrc_audio_level_stage(
        &self,
        _handles: &StageHandles,
    ) -> Option<Box<dyn TransformStage>> {
        None
    }

    fn create_discard_stage(
        &self,
        handles: &StageHandles,
        stats: &SharedStats,
    ) -> Option<Box<dyn TransformStage>> {
        Some(Box::new(
            DiscardTransformer::new(handles.discard.clone()).with_stats(Arc::clone(stats)),
        ))
    }

    fn create_fec_stage(&self, _stats: &SharedStats) -> Option<Box<dyn TransformStage>> {
        None
    }

    fn create_red_stage(&self) -> Option<Box<dyn TransformStage>> {
        None
    }

    fn create_rtx_stage(&self, _handles: &StageHandles) -> Option<Box<dyn TransformStage>> {
        None
    }

    fn uses_caching(&self) -> bool {
        false
    }

    fn uses_retransmission_requester(&self) -> bool {
        false
    }

    /// Scheduling hint for the receive threads, on a 1 (lowest) to 10 scale.
    fn priority(&self) -> u8 {
        DEFAULT_PRIORITY
    }
}

struct StreamState {
    direction: MediaDirection,
    started: Option<MediaDirection>,
    connector: Option<Arc<RtpConnector>>,
    device: Option<Arc<dyn DeviceSession>>,
    encryption: Option<Arc<dyn EncryptionControl>>,
    translator: Option<Arc<dyn RtpTranslator>>,
    /// Held here between chain rebuilds.
    external: Option<Box<dyn TransformStage>>,
    ssrc_factory: SsrcFactory,
    ssrcs: SsrcManager,
    sequencer: Sequencer,
    format: Option<(u8, MediaFormat)>,
    remote_payload_type: Option<u8>,
}

struct StreamInner {
    id: u64,
    config: MediaStreamConfig,
    kind: Box<dyn MediaKind>,
    registry: Arc<dyn FormatRegistry>,
    anchor: SystemInstant,
    pool: PacketPool,
    closed: AtomicBool,
    state: Mutex<StreamState>,
    chain: Mutex<TransformChain>,
    payload_types: RwLock<PayloadTypeMap>,
    extensions: RwLock<ExtensionMap>,
    receive_streams: ReceiveStreamRegistry,
    stats: SharedStats,
    handles: StageHandles,
    listeners: RwLock<Vec<MediaStreamEventFn>>,
    key_frame_requests: Arc<Mutex<Vec<u32>>>,
    next_stats_update: Mutex<Instant>,
}

/// One negotiated RTP session: a connector, its transform chain and the
/// state around them. Clones share the same stream.
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("media_type", &self.inner.kind.media_type())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MediaStream {
    /// Creates a stream and generates its local SSRC.
    pub fn new(
        config: MediaStreamConfig,
        kind: Box<dyn MediaKind>,
        registry: Arc<dyn FormatRegistry>,
    ) -> Result<Self> {
        let pool = PacketPool::new(config.pool_capacity)?;
        let anchor = SystemInstant::now();
        let media_type = kind.media_type();
        if media_type != config.media_type {
            warn!(
                "configured media type {} overridden by {}",
                config.media_type, media_type
            );
        }
        let stats = Arc::new(Mutex::new(MediaStreamStats::with_anchor(media_type, anchor)));

        let mut ssrc_factory = SsrcFactory::new(config.initial_local_ssrc);
        let mut ssrcs = SsrcManager::new();
        ssrcs.set_local_source_id(ssrc_factory.generate(None))?;

        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            "stream {} created, {} local ssrc {:?}",
            id,
            media_type,
            ssrcs.local_source_id()
        );

        let handles = StageHandles::new(&config);
        let next_stats_update = Instant::now() + config.stats_update_interval();
        Ok(Self {
            inner: Arc::new(StreamInner {
                id,
                kind,
                registry,
                anchor,
                pool,
                closed: AtomicBool::new(false),
                state: Mutex::new(StreamState {
                    direction: MediaDirection::Inactive,
                    started: None,
                    connector: None,
                    device: None,
                    encryption: None,
                    translator: None,
                    external: None,
                    ssrc_factory,
                    ssrcs,
                    sequencer: Sequencer::new_random(),
                    format: None,
                    remote_payload_type: None,
                }),
                chain: Mutex::new(TransformChain::new()),
                payload_types: RwLock::new(PayloadTypeMap::new()),
                extensions: RwLock::new(ExtensionMap::new()),
                receive_streams: ReceiveStreamRegistry::new(),
                stats,
                handles,
                listeners: RwLock::new(vec![]),
                key_frame_requests: Arc::new(Mutex::new(vec![])),
                next_stats_update: Mutex::new(next_stats_update),
                config,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn media_type(&self) -> MediaType {
        self.inner.kind.media_type()
    }

    pub fn priority(&self) -> u8 {
        self.inner.kind.priority()
    }

    pub fn config(&self) -> &MediaStreamConfig {
        &self.inner.config
    }

    pub fn handles(&self) -> &StageHandles {
        &self.inner.handles
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::ErrStreamClosed)
        } else {
            Ok(())
        }
    }

    pub fn on_event(&self, listener: MediaStreamEventFn) {
        self.inner.listeners.write().push(listener);
    }

    fn emit(&self, event: MediaStreamEvent) {
        debug!("stream {}: {}", self.inner.id, event);
        for listener in self.inner.listeners.read().iter() {
            listener(&event);
        }
    }

    // Collaborators

    /// Builds a connector over the two transports, sharing the stream's
    /// packet pool, and attaches it.
    pub fn connect(
        &self,
        data: Arc<dyn PacketTransport>,
        control: Arc<dyn PacketTransport>,
    ) -> Result<()> {
        let connector = RtpConnector::new(data, control, self.inner.pool.clone(), &self.inner.config)?;
        self.set_connector(connector)
    }

    /// Attaches `connector`, replacing and closing any previous one. The
    /// chain is rebuilt on the first connector and whenever the transport
    /// kind changes.
    pub fn set_connector(&self, connector: RtpConnector) -> Result<()> {
        self.ensure_open()?;
        let connector = Arc::new(connector);
        let kind = connector.kind();

        let (old, encryption) = {
            let mut state = self.inner.state.lock();
            let rebuild = state.connector.as_ref().is_none_or(|c| c.kind() != kind);
            let old = state.connector.replace(Arc::clone(&connector));
            if rebuild {
                self.rebuild_chain(&mut state, Instant::now());
            }
            (old, state.encryption.clone())
        };

        if let Some(old) = old {
            debug!("stream {}: replacing {} connector", self.inner.id, old.kind());
            old.close();
        }
        if let Some(encryption) = encryption {
            encryption.set_connector(kind);
        }
        self.attach_consumers(&connector)?;
        debug!(
            "stream {}: {} connector attached, priority {}",
            self.inner.id,
            kind,
            self.priority()
        );
        Ok(())
    }

    pub fn connector_kind(&self) -> Option<ConnectorKind> {
        self.inner.state.lock().connector.as_ref().map(|c| c.kind())
    }

    fn attach_consumers(&self, connector: &RtpConnector) -> Result<()> {
        for kind in [PacketKind::Rtp, PacketKind::Rtcp] {
            let weak: Weak<StreamInner> = Arc::downgrade(&self.inner);
            connector.input_stream(kind).set_consumer(Arc::new(
                move |input: &RtpConnectorInputStream, event: InputEvent| {
                    if let Some(inner) = weak.upgrade() {
                        MediaStream { inner }.on_input(kind, input, event);
                    }
                },
            ))?;
        }
        Ok(())
    }

    fn on_input(&self, kind: PacketKind, input: &RtpConnectorInputStream, event: InputEvent) {
        match event {
            InputEvent::EndOfStream => {
                warn!("stream {}: {} input ended", self.inner.id, kind);
            }
            InputEvent::DataAvailable => loop {
                match input.read_packet() {
                    Ok(Some((pkt, _from))) => {
                        // rtcp-mux puts control packets on the data channel
                        let Some(kind) = PacketKind::classify(pkt.as_slice()) else {
                            debug!(
                                "stream {}: unclassifiable {} byte datagram on {} input dropped",
                                self.inner.id,
                                pkt.len(),
                                kind
                            );
                            continue;
                        };
                        let res = match kind {
                            PacketKind::Rtp => self.receive_rtp(pkt),
                            PacketKind::Rtcp => self.receive_rtcp(pkt),
                        };
                        if let Err(err) = res {
                            debug!("stream {}: inbound {} dropped: {}", self.inner.id, kind, err);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!("stream {}: {} read failed: {}", self.inner.id, kind, err);
                        break;
                    }
                }
            },
        }
    }

    pub fn set_device_session(&self, device: Box<dyn DeviceSession>) -> Result<()> {
        self.ensure_open()?;
        let device: Arc<dyn DeviceSession> = Arc::from(device);
        let id = self.inner.id;
        device.on_property_change(Box::new(move |change: &PropertyChange| {
            if change.name == OUTPUT_FORMAT_PROPERTY {
                debug!("stream {id}: output format {:?} -> {:?}", change.old, change.new);
            } else {
                trace!("stream {id}: device property {} changed", change.name);
            }
        }));

        let old = self.inner.state.lock().device.replace(Arc::clone(&device));
        if let Some(old) = old {
            for stream in self.inner.receive_streams.all() {
                old.remove_receive_stream(&*stream);
            }
            old.close();
        }
        for stream in self.inner.receive_streams.all() {
            device.add_receive_stream(&*stream);
        }
        Ok(())
    }

    /// Installs the encryption collaborator's stage. A registration failure
    /// is returned unchanged and leaves the stream unencrypted.
    pub fn set_encryption(&self, encryption: Box<dyn EncryptionControl>) -> Result<()> {
        self.ensure_open()?;
        let encryption: Arc<dyn EncryptionControl> = Arc::from(encryption);
        encryption.register_user(self.inner.id)?;

        let old = {
            let mut state = self.inner.state.lock();
            let local = state.ssrcs.local_source_id();
            if let Some(ssrc) = local {
                encryption.set_local_ssrc(ssrc);
            }
            if let Some(connector) = &state.connector {
                encryption.set_connector(connector.kind());
                let mut stage = encryption.create_stage();
                self.prepare_stage(stage.as_mut(), local);
                if let Some(mut old) = self.inner.chain.lock().set(StageSlot::Encryption, stage) {
                    old.close();
                }
            }
            state.encryption.replace(encryption)
        };
        if let Some(old) = old {
            old.cleanup();
        }
        Ok(())
    }

    /// Registers the stream with a translator, which then resolves the
    /// owners of remote SSRCs.
    pub fn set_translator(&self, translator: Arc<dyn RtpTranslator>) -> Result<()> {
        self.ensure_open()?;
        translator.add_stream(self.inner.id, Arc::clone(&self.inner.stats));

        let old = {
            let mut state = self.inner.state.lock();
            for ssrc in state.ssrcs.remote_source_ids() {
                translator.add_receive_ssrc(self.inner.id, ssrc);
            }
            if let Some(stage) = self
                .inner
                .chain
                .lock()
                .stage_mut::<StatisticsTransformer>(StageSlot::Statistics)
            {
                stage.set_translator(Some(Arc::clone(&translator)));
            }
            state.translator.replace(translator)
        };
        if let Some(old) = old {
            old.remove_stream(self.inner.id);
        }
        Ok(())
    }

    /// Installs a caller supplied stage in the external slot. It survives
    /// chain rebuilds.
    pub fn set_external_transformer(&self, stage: Option<Box<dyn TransformStage>>) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock();
        let local = state.ssrcs.local_source_id();
        let mut stage = stage;
        if let Some(stage) = stage.as_mut() {
            self.prepare_stage(stage.as_mut(), local);
        }
        let old = if state.connector.is_some() {
            let mut chain = self.inner.chain.lock();
            match stage {
                Some(stage) => chain.set(StageSlot::External, stage),
                None => chain.take(StageSlot::External),
            }
        } else {
            std::mem::replace(&mut state.external, stage)
        };
        if let Some(mut old) = old {
            old.close();
        }
        Ok(())
    }

    // Chain

    fn prepare_stage(&self, stage: &mut dyn TransformStage, local: Option<u32>) {
        stage.bind_payload_types(&self.inner.payload_types.read());
        stage.bind_extensions(&self.inner.extensions.read());
        if let Some(ssrc) = local {
            stage.set_local_ssrc(ssrc);
        }
    }

    fn rebuild_chain(&self, state: &mut StreamState, now: Instant) {
        let mut chain = self.inner.chain.lock();
        let external = chain.take(StageSlot::External).or_else(|| state.external.take());
        *chain = self.build_chain(state, external, now);
        debug!("stream {}: chain rebuilt {:?}", self.inner.id, chain.names());
    }

    fn build_chain(
        &self,
        state: &StreamState,
        external: Option<Box<dyn TransformStage>>,
        now: Instant,
    ) -> TransformChain {
        let inner = &self.inner;
        let kind = &inner.kind;
        let handles = &inner.handles;
        let stats = &inner.stats;
        let mut chain = TransformChain::new();

        chain.set(
            StageSlot::Csrc,
            Box::new(
                CsrcTransformerBuilder::new()
                    .with_media_type(kind.media_type())
                    .with_list(handles.csrcs.clone())
                    .with_listeners(handles.csrc_listeners.clone())
                    .build(),
            ),
        );
        install(&mut chain, StageSlot::Dtmf, kind.create_dtmf_stage(handles));
        install(&mut chain, StageSlot::External, external);

        let key_frame_requests = Arc::clone(&inner.key_frame_requests);
        chain.set(
            StageSlot::RtcpTermination,
            Box::new(
                RtcpTerminationBuilder::new(kind.media_type())
                    .with_interval(inner.config.rtcp_report_interval())
                    .with_anchor(inner.anchor)
                    .with_bitrate_estimate(handles.bitrate_estimate.clone())
                    .with_format_registry(Arc::clone(&inner.registry))
                    .with_key_frame_handler(Box::new(move |ssrc| {
                        key_frame_requests.lock().push(ssrc);
                    }))
                    .build(now),
            ),
        );
        chain.set(
            StageSlot::PayloadTypeOverride,
            Box::new(PayloadTypeTransformer::new(handles.pt_overrides.clone())),
        );
        install(&mut chain, StageSlot::Fec, kind.create_fec_stage(stats));
        install(&mut chain, StageSlot::Red, kind.create_red_stage());

        let mut statistics = StatisticsTransformer::new(Arc::clone(stats));
        if let Some(translator) = &state.translator {
            statistics = statistics.with_translator(Arc::clone(translator));
        }
        chain.set(StageSlot::Statistics, Box::new(statistics));

        if kind.uses_retransmission_requester() {
            chain.set(
                StageSlot::RetransmissionRequester,
                Box::new(
                    RetransmissionRequesterBuilder::new()
                        .with_config(inner.config.retransmission)
                        .build(now),
                ),
            );
        }
        if kind.uses_caching() {
            chain.set(
                StageSlot::Caching,
                Box::new(CachingTransformer::new(handles.cache.clone())),
            );
        }
        install(
            &mut chain,
            StageSlot::Discard,
            kind.create_discard_stage(handles, stats),
        );
        chain.set(
            StageSlot::TrackReceiver,
            Box::new(TrackReceiver::new(inner.anchor).with_table(handles.tracks.clone())),
        );
        chain.set(StageSlot::PaddingTermination, Box::new(PaddingTermination::new()));
        install(&mut chain, StageSlot::Rtx, kind.create_rtx_stage(handles));
        chain.set(
            StageSlot::RemoteBitrateEstimator,
            Box::new(
                RemoteBitrateEstimator::default().with_estimate(handles.bitrate_estimate.clone()),
            ),
        );
        chain.set(
            StageSlot::AbsSendTime,
            Box::new(AbsSendTimeStamper::new(inner.anchor)),
        );
        chain.set(StageSlot::TccEgress, Box::new(TccEgress::new(handles.tcc.clone())));
        chain.set(
            StageSlot::OriginalHeaderBlock,
            Box::new(OriginalHeaderBlockTransformer::new()),
        );
        install(
            &mut chain,
            StageSlot::Encryption,
            state.encryption.as_ref().map(|e| e.create_stage()),
        );
        chain.set(StageSlot::TccIngress, Box::new(TccIngress::new(handles.tcc.clone())));
        install(
            &mut chain,
            StageSlot::SsrcAudioLevel,
            kind.create_ssrc_audio_level_stage(handles),
        );

        chain.bind_payload_types(&inner.payload_types.read());
        chain.bind_extensions(&inner.extensions.read());
        if let Some(ssrc) = state.ssrcs.local_source_id() {
            chain.set_local_ssrc(ssrc);
        }
        chain
    }

    /// Runs `f` on the stage in `slot` when it is present and of type `T`.
    pub fn with_stage<T, R>(&self, slot: StageSlot, f: impl FnOnce(&mut T) -> R) -> Option<R>
    where
        T: TransformStage + 'static,
    {
        self.inner.chain.lock().stage_mut::<T>(slot).map(f)
    }

    /// Names of the stages currently in the chain, in outbound order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.inner.chain.lock().names()
    }

    // Direction

    pub fn direction(&self) -> MediaDirection {
        self.inner.state.lock().direction
    }

    /// Sets the desired direction. On a started stream, halves no longer
    /// allowed are stopped and newly allowed halves are started; `Inactive`
    /// stops everything.
    pub fn set_direction(&self, direction: MediaDirection) -> Result<()> {
        self.ensure_open()?;
        let started = {
            let mut state = self.inner.state.lock();
            state.direction = direction;
            state.started
        };

        if direction == MediaDirection::Inactive {
            self.stop_halves(MediaDirection::SendRecv);
        } else if let Some(started) = started {
            let to_stop = started.and_not(direction);
            if to_stop != MediaDirection::Inactive {
                self.stop_halves(to_stop);
            }
            let to_start = direction.and_not(started);
            if to_start != MediaDirection::Inactive {
                self.start_halves(to_start);
            }
        }
        Ok(())
    }

    /// The halves actually running, `None` when idle.
    pub fn started_direction(&self) -> Option<MediaDirection> {
        self.inner.state.lock().started
    }

    pub fn is_started(&self) -> bool {
        self.started_direction().is_some()
    }

    /// Starts the halves of the desired direction.
    pub fn start(&self) -> Result<()> {
        let direction = self.direction();
        self.start_direction(direction)
    }

    pub fn stop(&self) -> Result<()> {
        self.stop_direction(MediaDirection::SendRecv)
    }

    pub fn start_direction(&self, direction: MediaDirection) -> Result<()> {
        self.ensure_open()?;
        self.start_halves(direction);
        Ok(())
    }

    pub fn stop_direction(&self, direction: MediaDirection) -> Result<()> {
        self.ensure_open()?;
        self.stop_halves(direction);
        Ok(())
    }

    /// A device failing to start one half is logged and leaves that half
    /// stopped; the other half is still started.
    fn start_halves(&self, direction: MediaDirection) {
        let (current, device) = {
            let state = self.inner.state.lock();
            (state.started.unwrap_or_default(), state.device.clone())
        };

        let wanted = direction.and_not(current);
        let mut started = MediaDirection::Inactive;
        for half in HALVES {
            if !includes(wanted, half) {
                continue;
            }
            match device.as_ref().map_or(Ok(()), |d| d.start(half)) {
                Ok(()) => started = started.or(half),
                Err(err) => warn!("stream {}: starting {} failed: {}", self.inner.id, half, err),
            }
        }
        if started == MediaDirection::Inactive {
            return;
        }

        let (old, new) = {
            let mut state = self.inner.state.lock();
            let old = state.started;
            let new = old.unwrap_or_default().or(started);
            state.started = Some(new);
            if new.allows_sending() {
                state.ssrcs.lock_local();
            }
            (old, Some(new))
        };
        debug!("stream {}: started {}", self.inner.id, started);
        if old != new {
            self.emit(MediaStreamEvent::DirectionChanged { old, new });
        }
    }

    fn stop_halves(&self, direction: MediaDirection) {
        let (current, device) = {
            let state = self.inner.state.lock();
            (state.started.unwrap_or_default(), state.device.clone())
        };
        // halves both running and requested
        let stopping = current.and_not(current.and_not(direction));
        if stopping == MediaDirection::Inactive {
            return;
        }
        if let Some(device) = &device {
            for half in HALVES {
                if includes(stopping, half) {
                    device.stop(half);
                }
            }
        }

        let (old, new) = {
            let mut state = self.inner.state.lock();
            let old = state.started;
            let remaining = old.unwrap_or_default().and_not(stopping);
            state.started = (remaining != MediaDirection::Inactive).then_some(remaining);
            if !remaining.allows_sending() {
                state.ssrcs.unlock_local();
            }
            (old, state.started)
        };
        debug!("stream {}: stopped {}", self.inner.id, stopping);
        if old != new {
            self.emit(MediaStreamEvent::DirectionChanged { old, new });
        }
    }

    // Formats

    /// Maps `payload_type` to `format` and re-registers the payload types of
    /// every stage.
    pub fn add_dynamic_rtp_payload_type(&self, payload_type: u8, format: MediaFormat) -> Result<()> {
        self.ensure_open()?;
        debug!("stream {}: payload type {} = {}", self.inner.id, payload_type, format);
        self.inner.payload_types.write().insert(payload_type, format);
        self.rebind_payload_types();
        Ok(())
    }

    pub fn remove_dynamic_rtp_payload_type(&self, payload_type: u8) -> Result<Option<MediaFormat>> {
        self.ensure_open()?;
        let removed = self.inner.payload_types.write().remove(&payload_type);
        if removed.is_some() {
            self.rebind_payload_types();
        }
        Ok(removed)
    }

    pub fn clear_dynamic_rtp_payload_types(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner.payload_types.write().clear();
        self.rebind_payload_types();
        Ok(())
    }

    pub fn dynamic_rtp_payload_types(&self) -> PayloadTypeMap {
        self.inner.payload_types.read().clone()
    }

    fn rebind_payload_types(&self) {
        let mut chain = self.inner.chain.lock();
        let payload_types = self.inner.payload_types.read();
        chain.bind_payload_types(&payload_types);

        let media_clock = payload_types
            .values()
            .find(|f| !(f.is_rtx() || f.is_red() || f.is_fec() || f.is_telephone_event()))
            .map(|f| f.clock_rate);
        if let Some(clock_rate) = media_clock {
            self.inner.stats.lock().set_clock_rate(clock_rate);
        }
    }

    /// Payload type of `format`, from the dynamic mappings first and then the
    /// format registry.
    pub fn payload_type_for(&self, format: &MediaFormat) -> Option<u8> {
        let dynamic = self
            .inner
            .payload_types
            .read()
            .iter()
            .find(|(_, f)| {
                f.encoding.eq_ignore_ascii_case(&format.encoding) && f.clock_rate == format.clock_rate
            })
            .map(|(pt, _)| *pt);
        dynamic.or_else(|| {
            self.inner
                .registry
                .payload_type(&format.encoding, format.clock_rate)
        })
    }

    pub fn format_for(&self, payload_type: u8) -> Option<MediaFormat> {
        let dynamic = self.inner.payload_types.read().get(&payload_type).cloned();
        dynamic.or_else(|| self.inner.registry.format(payload_type))
    }

    /// Selects the format of outbound media.
    pub fn set_format(&self, format: MediaFormat) -> Result<()> {
        self.ensure_open()?;
        let payload_type = self
            .payload_type_for(&format)
            .ok_or_else(|| Error::ErrNegotiation(format!("no payload type for {format}")))?;

        let device = {
            let mut state = self.inner.state.lock();
            state.format = Some((payload_type, format.clone()));
            state.device.clone()
        };
        self.inner.stats.lock().set_clock_rate(format.clock_rate);
        if let Some(device) = device {
            device.set_format(&format);
        }
        debug!("stream {}: format {} on {}", self.inner.id, format, payload_type);
        Ok(())
    }

    pub fn format(&self) -> Option<MediaFormat> {
        self.inner.state.lock().format.as_ref().map(|(_, f)| f.clone())
    }

    // Header extensions

    /// Binds `id` to `descriptor`; an `Inactive` descriptor removes the
    /// binding. Every stage re-resolves its extension ids.
    pub fn add_rtp_extension(&self, id: u8, descriptor: ExtensionDescriptor) -> Result<()> {
        self.ensure_open()?;
        {
            let mut extensions = self.inner.extensions.write();
            if descriptor.direction == MediaDirection::Inactive {
                extensions.remove(id);
            } else {
                extensions.insert(id, descriptor);
            }
        }
        self.rebind_extensions();
        Ok(())
    }

    pub fn clear_rtp_extensions(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner.extensions.write().clear();
        self.rebind_extensions();
        Ok(())
    }

    pub fn active_rtp_extensions(&self) -> ExtensionMap {
        self.inner.extensions.read().clone()
    }

    fn rebind_extensions(&self) {
        let mut chain = self.inner.chain.lock();
        chain.bind_extensions(&self.inner.extensions.read());
    }

    // SSRCs

    pub fn local_source_id(&self) -> Option<u32> {
        self.inner.state.lock().ssrcs.local_source_id()
    }

    /// Replaces the local SSRC. Fails with `ErrLocalSsrcLocked` while the
    /// sending half is started.
    pub fn set_local_source_id(&self, ssrc: u32) -> Result<()> {
        self.ensure_open()?;
        let old = {
            let mut state = self.inner.state.lock();
            self.replace_local_ssrc(&mut state, ssrc)?
        };
        if old != Some(ssrc) {
            self.emit(MediaStreamEvent::LocalSsrcChanged { old, new: ssrc });
        }
        Ok(())
    }

    /// Draws a fresh local SSRC from the generator.
    pub fn regenerate_local_source_id(&self) -> Result<u32> {
        self.ensure_open()?;
        let (old, ssrc) = {
            let mut state = self.inner.state.lock();
            if state.ssrcs.is_local_locked() {
                return Err(Error::ErrLocalSsrcLocked);
            }
            let ssrc = state.ssrc_factory.generate(None);
            (self.replace_local_ssrc(&mut state, ssrc)?, ssrc)
        };
        if old != Some(ssrc) {
            self.emit(MediaStreamEvent::LocalSsrcChanged { old, new: ssrc });
        }
        Ok(ssrc)
    }

    fn replace_local_ssrc(&self, state: &mut StreamState, ssrc: u32) -> Result<Option<u32>> {
        let old = state.ssrcs.set_local_source_id(ssrc)?;
        if old != Some(ssrc) {
            self.inner.chain.lock().set_local_ssrc(ssrc);
            if let Some(encryption) = &state.encryption {
                encryption.set_local_ssrc(ssrc);
            }
        }
        Ok(old)
    }

    /// The most recently seen remote SSRC.
    pub fn remote_source_id(&self) -> Option<u32> {
        self.inner.state.lock().ssrcs.remote_source_id()
    }

    pub fn remote_source_ids(&self) -> Vec<u32> {
        self.inner.state.lock().ssrcs.remote_source_ids()
    }

    /// Records `ssrc` as the current remote SSRC.
    pub fn add_remote_source_id(&self, ssrc: u32) -> Result<()> {
        self.ensure_open()?;
        let (added, translator) = {
            let mut state = self.inner.state.lock();
            (state.ssrcs.add_remote_source_id(ssrc), state.translator.clone())
        };
        if added {
            if let Some(translator) = translator {
                translator.add_receive_ssrc(self.inner.id, ssrc);
            }
            self.emit(MediaStreamEvent::RemoteSsrcAdded(ssrc));
        }
        Ok(())
    }

    // Outbound

    /// Sends an RTP packet through the chain. Without a started sending half
    /// the packet is dropped.
    pub fn send_rtp(&self, pkt: RawPacket) -> Result<()> {
        self.ensure_open()?;
        let connector = {
            let state = self.inner.state.lock();
            let connector = state.connector.clone().ok_or(Error::ErrConnectorNotSet)?;
            if !state.started.is_some_and(|d| d.allows_sending()) {
                trace!("stream {}: not sending, rtp dropped", self.inner.id);
                return Ok(());
            }
            connector
        };

        let pkts = self.inner.chain.lock().transform_rtp(vec![pkt])?;
        self.write(&connector, PacketKind::Rtp, pkts)?;
        self.flush_injected(&connector)
    }

    /// Packetizes one media frame with the selected format, the local SSRC
    /// and the next sequence number, and sends it.
    pub fn send_media(&self, timestamp: u32, marker: bool, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let header = {
            let mut state = self.inner.state.lock();
            let payload_type = state
                .format
                .as_ref()
                .map(|(pt, _)| *pt)
                .ok_or_else(|| Error::ErrNegotiation("no format selected".to_owned()))?;
            rtp::header::Header {
                version: 2,
                marker,
                payload_type,
                sequence_number: state.sequencer.next_sequence_number(),
                timestamp,
                ssrc: state.ssrcs.local_source_id().unwrap_or_default(),
                ..Default::default()
            }
        };
        let pkt = rtp::Packet {
            header,
            payload: Bytes::copy_from_slice(payload),
            padding_size: 0,
        };
        self.send_rtp(RawPacket::from_rtp(&pkt, Instant::now())?)
    }

    /// Sends RTCP through the chain. Control traffic does not depend on the
    /// sending half.
    pub fn send_rtcp(&self, pkt: RawPacket) -> Result<()> {
        self.ensure_open()?;
        let connector = self
            .inner
            .state
            .lock()
            .connector
            .clone()
            .ok_or(Error::ErrConnectorNotSet)?;

        let pkts = self.inner.chain.lock().transform_rtcp(vec![pkt])?;
        self.write(&connector, PacketKind::Rtcp, pkts)?;
        self.flush_injected(&connector)
    }

    fn write(&self, connector: &RtpConnector, kind: PacketKind, pkts: Vec<RawPacket>) -> Result<()> {
        let output = connector.output_stream(kind);
        for pkt in pkts {
            trace!("stream {}: {} out, {} bytes", self.inner.id, kind, pkt.len());
            output.write(pkt.as_slice())?;
        }
        Ok(())
    }

    /// Sends what the stages generated on their own, each packet continuing
    /// through the stages after the one that produced it.
    fn flush_injected(&self, connector: &RtpConnector) -> Result<()> {
        let outbound = {
            let mut chain = self.inner.chain.lock();
            let mut outbound = vec![];
            for (slot, injected) in chain.drain_injected() {
                let pkts = match injected.kind {
                    PacketKind::Rtp => chain.transform_rtp_after(slot, vec![injected.packet])?,
                    PacketKind::Rtcp => chain.transform_rtcp_after(slot, vec![injected.packet])?,
                };
                outbound.push((injected.kind, pkts));
            }
            outbound
        };
        for (kind, pkts) in outbound {
            self.write(connector, kind, pkts)?;
        }
        Ok(())
    }

    fn flush_pending(&self) -> Result<()> {
        let connector = self.inner.state.lock().connector.clone();
        match connector {
            Some(connector) => self.flush_injected(&connector),
            None => {
                let dropped = self.inner.chain.lock().drain_injected().len();
                if dropped > 0 {
                    debug!("stream {}: no connector, {} generated packets dropped", self.inner.id, dropped);
                }
                Ok(())
            }
        }
    }

    // Inbound

    /// Runs an inbound RTP packet through the reverse chain and dispatches
    /// what survives to its receive stream.
    /// Malformed packets are logged and dropped before any SSRC state is
    /// touched.
    pub fn receive_rtp(&self, pkt: RawPacket) -> Result<()> {
        self.ensure_open()?;
        if !pkt.is_valid_rtp() {
            debug!(
                "stream {}: malformed rtp of {} bytes dropped",
                self.inner.id,
                pkt.len()
            );
            return Ok(());
        }
        let pkts = self.inner.chain.lock().reverse_transform_rtp(vec![pkt])?;
        for pkt in pkts {
            if !pkt.is_valid_rtp() {
                trace!("stream {}: malformed rtp after reverse transform", self.inner.id);
                continue;
            }
            self.dispatch_rtp(pkt)?;
        }
        self.flush_pending()
    }

    fn dispatch_rtp(&self, pkt: RawPacket) -> Result<()> {
        let ssrc = pkt.ssrc();
        let payload_type = pkt.payload_type();
        self.add_remote_source_id(ssrc)?;
        if !self.inner.receive_streams.contains(ssrc) {
            self.add_receive_stream(ssrc, None)?;
        }
        let Some(stream) = self.inner.receive_streams.get(ssrc) else {
            return Ok(());
        };
        stream.touch(pkt.now);

        let (device, receiving, format_changed) = {
            let mut state = self.inner.state.lock();
            let receiving = state.started.is_some_and(|d| d.allows_receiving());
            let changed = state.remote_payload_type != Some(payload_type);
            state.remote_payload_type = Some(payload_type);
            (state.device.clone(), receiving, changed)
        };
        let Some(device) = device else {
            return Ok(());
        };
        if format_changed
            && let Some(format) = self.format_for(payload_type)
            && !(format.is_rtx() || format.is_red() || format.is_fec() || format.is_telephone_event())
        {
            debug!("stream {}: remote format {}", self.inner.id, format);
            device.set_format(&format);
        }
        if receiving && !self.inner.config.translator_mode {
            device.deliver(&*stream, &pkt);
        }
        Ok(())
    }

    /// Runs an inbound RTCP compound through the reverse chain. BYE removes
    /// the receive streams it names, key-frame requests are reported.
    pub fn receive_rtcp(&self, pkt: RawPacket) -> Result<()> {
        self.ensure_open()?;
        let pkts = self.inner.chain.lock().reverse_transform_rtcp(vec![pkt])?;

        let mut byes = vec![];
        for pkt in &pkts {
            match pkt.to_rtcp() {
                Ok(packets) => {
                    for packet in &packets {
                        if let Some(bye) = packet.as_any().downcast_ref::<Goodbye>() {
                            byes.extend_from_slice(&bye.sources);
                        }
                    }
                }
                Err(err) => debug!("stream {}: unparsable rtcp: {}", self.inner.id, err),
            }
        }
        for ssrc in byes {
            self.handle_receive_event(ReceiveStreamEvent::Bye(ssrc))?;
        }

        self.report_key_frame_requests();
        self.flush_pending()
    }

    fn report_key_frame_requests(&self) {
        let requests = std::mem::take(&mut *self.inner.key_frame_requests.lock());
        if requests.is_empty() {
            return;
        }
        let translator = self.inner.state.lock().translator.clone();
        for ssrc in requests {
            if let Some(translator) = &translator {
                translator.request_key_frame(ssrc);
            }
            self.emit(MediaStreamEvent::KeyFrameRequested(ssrc));
        }
    }

    // Receive streams

    pub fn handle_receive_event(&self, event: ReceiveStreamEvent) -> Result<()> {
        self.ensure_open()?;
        trace!("stream {}: {:?}", self.inner.id, event);
        match event {
            ReceiveStreamEvent::NewReceiveStream { ssrc, data_source } => {
                self.add_remote_source_id(ssrc)?;
                self.add_receive_stream(ssrc, data_source)?;
            }
            ReceiveStreamEvent::Timeout(ssrc) | ReceiveStreamEvent::Bye(ssrc) => {
                match self.remove_receive_stream_for_ssrc(ssrc) {
                    Ok(()) | Err(Error::ErrNoSuchReceiveStream) => {}
                    Err(err) => return Err(err),
                }
                let mut chain = self.inner.chain.lock();
                if let Some(stage) = chain.stage_mut::<RtcpTermination>(StageSlot::RtcpTermination) {
                    stage.remove_ssrc(ssrc);
                }
                if let Some(stage) = chain
                    .stage_mut::<RetransmissionRequester>(StageSlot::RetransmissionRequester)
                {
                    stage.remove_ssrc(ssrc);
                }
                drop(chain);
                self.inner.stats.lock().tracks_mut().remove(ssrc);
            }
        }
        Ok(())
    }

    /// Registers a receive stream for `ssrc` and hands it to the device
    /// session. Returns false when one already exists.
    pub fn add_receive_stream(&self, ssrc: u32, data_source: Option<String>) -> Result<bool> {
        self.ensure_open()?;
        let device = self.inner.state.lock().device.clone();
        let added = self.inner.receive_streams.add(
            ReceiveStream::new(ssrc, data_source, Instant::now()),
            |stream| {
                if let Some(device) = &device {
                    device.add_receive_stream(stream);
                }
            },
        );
        if added {
            self.emit(MediaStreamEvent::ReceiveStreamAdded(ssrc));
        }
        Ok(added)
    }

    pub fn remove_receive_stream(&self, stream: &dyn ReceiveStreamHandle) -> Result<()> {
        self.remove_receive_stream_for_ssrc(stream.ssrc())
    }

    pub fn remove_receive_stream_for_ssrc(&self, ssrc: u32) -> Result<()> {
        self.ensure_open()?;
        let device = self.inner.state.lock().device.clone();
        self.inner
            .receive_streams
            .remove(ssrc, |stream| {
                if let Some(device) = &device {
                    device.remove_receive_stream(stream);
                }
            })
            .ok_or(Error::ErrNoSuchReceiveStream)?;
        self.emit(MediaStreamEvent::ReceiveStreamRemoved(ssrc));
        Ok(())
    }

    pub fn receive_streams(&self) -> Vec<Arc<ReceiveStream>> {
        self.inner.receive_streams.all()
    }

    pub fn receive_stream(&self, ssrc: u32) -> Option<Arc<ReceiveStream>> {
        self.inner.receive_streams.get(ssrc)
    }

    // Timers

    /// Earliest instant at which [`MediaStream::handle_timeout`] has work.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.is_closed() {
            return None;
        }
        let stats = *self.inner.next_stats_update.lock();
        let chain = self.inner.chain.lock().poll_timeout();
        Some(chain.map_or(stats, |c| c.min(stats)))
    }

    /// Drives the stages' timers and the periodic statistics update, then
    /// sends what the stages generated.
    pub fn handle_timeout(&self, now: Instant) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.inner.chain.lock().handle_timeout(now)?;
        {
            let mut next = self.inner.next_stats_update.lock();
            if now >= *next {
                self.inner.stats.lock().update_stats(now);
                *next = now + self.inner.config.stats_update_interval();
            }
        }
        self.report_key_frame_requests();
        self.flush_pending()
    }

    // Statistics

    pub fn media_stream_stats(&self) -> SharedStats {
        Arc::clone(&self.inner.stats)
    }

    pub fn update_stats(&self) {
        self.inner.stats.lock().update_stats(Instant::now());
    }

    // Mute

    /// A muted stream drops its outbound media in the discard stage.
    pub fn set_mute(&self, muted: bool) {
        self.inner.handles.discard.set_mute(muted);
    }

    pub fn is_mute(&self) -> bool {
        self.inner.handles.discard.is_muted()
    }

    // Close

    /// Stops the stream and releases every collaborator. Terminal: later
    /// mutating calls fail with `ErrStreamClosed`.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.stop_halves(MediaDirection::SendRecv);
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("stream {}: closing", self.inner.id);

        let (connector, device, encryption, translator, external) = {
            let mut state = self.inner.state.lock();
            (
                state.connector.take(),
                state.device.take(),
                state.encryption.take(),
                state.translator.take(),
                state.external.take(),
            )
        };

        self.inner.chain.lock().close();
        if let Some(mut external) = external {
            external.close();
        }
        self.inner.handles.cache.close();
        self.inner.key_frame_requests.lock().clear();
        if let Some(encryption) = encryption {
            encryption.cleanup();
        }
        if let Some(connector) = connector {
            connector.close();
        }
        if let Some(translator) = translator {
            translator.remove_stream(self.inner.id);
        }

        let mut removed = vec![];
        self.inner.receive_streams.clear(|stream| {
            if let Some(device) = &device {
                device.remove_receive_stream(stream);
            }
            removed.push(stream.ssrc());
        });
        for ssrc in removed {
            self.emit(MediaStreamEvent::ReceiveStreamRemoved(ssrc));
        }
        if let Some(device) = device {
            device.close();
        }

        self.emit(MediaStreamEvent::Closed);
        self.inner.listeners.write().clear();
    }
}
