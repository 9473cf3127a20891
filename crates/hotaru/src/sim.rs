//! Synthetic collaborators for development and testing without hardware.
//!
//! Mirrors the shape of the real bus, camera, and kernel buffer device:
//!
//! - [`SimBus`]: scripted packet delivery with failure injection
//! - [`SimCamera`]: table-driven geometry and per-step failure injection
//! - [`SimDmaDevice`]: an in-memory ring with kernel queue/wait semantics

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::{CameraConfigurator, CaptureConfig, FrameRate, TransferSpeed, VideoFormat, VideoMode};
use crate::dma::{DmaDevice, RingGrant};
use crate::error::{BusError, ConfigError, DmaError};
use crate::frame::{ChannelId, RegionOfInterest, MAX_CHANNELS, QUADLET_BYTES};
use crate::transport::{BusTransport, IsoPacket, PacketHandler, HEADER_BYTES};

// ── Bus ──────────────────────────────────────────────────────────────

/// Everything a [`SimBus`] was asked to do, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    Register(ChannelId),
    Unregister(ChannelId),
    Start(ChannelId),
    Stop(ChannelId),
}

struct ScriptedPacket {
    channel: ChannelId,
    data: Vec<u8>,
}

/// Scripted in-memory bus transport.
///
/// Packets pushed onto the script are dispatched one per `iterate` call to
/// whichever handler is registered and receiving. An exhausted script makes
/// `iterate` fail rather than block, which keeps tests deterministic.
pub struct SimBus {
    handlers: Vec<Option<PacketHandler>>,
    receiving: Vec<bool>,
    script: VecDeque<ScriptedPacket>,
    events: Vec<BusEvent>,
    fail_register_on: Option<ChannelId>,
    fail_start_on: Option<ChannelId>,
}

impl SimBus {
    pub fn new() -> Self {
        Self {
            handlers: (0..MAX_CHANNELS).map(|_| None).collect(),
            receiving: vec![false; MAX_CHANNELS],
            script: VecDeque::new(),
            events: Vec::new(),
            fail_register_on: None,
            fail_start_on: None,
        }
    }

    /// Fail every `register_handler` call for `channel`.
    pub fn fail_register_on(&mut self, channel: ChannelId) {
        self.fail_register_on = Some(channel);
    }

    /// Fail every `start_reception` call for `channel`.
    pub fn fail_start_on(&mut self, channel: ChannelId) {
        self.fail_start_on = Some(channel);
    }

    /// Append one raw packet (header quadlet + payload) to the script.
    pub fn push_packet(&mut self, channel: ChannelId, frame_start: bool, payload: &[u8]) {
        let header: u32 = if frame_start { 1 } else { 0 };
        let mut data = Vec::with_capacity(HEADER_BYTES + payload.len());
        data.extend_from_slice(&header.to_le_bytes());
        data.extend_from_slice(payload);
        self.script.push_back(ScriptedPacket { channel, data });
    }

    /// Split `frame` into packets of up to `packet_bytes` payload each and
    /// append them to the script, marking the first as frame start.
    pub fn push_frame(&mut self, channel: ChannelId, frame: &[u8], packet_bytes: usize) {
        for (i, chunk) in frame.chunks(packet_bytes.max(1)).enumerate() {
            self.push_packet(channel, i == 0, chunk);
        }
    }

    /// Calls observed so far, in order.
    pub fn events(&self) -> &[BusEvent] {
        &self.events
    }

    /// True when no handler is registered and no channel is receiving.
    pub fn is_quiet(&self) -> bool {
        self.handlers.iter().all(Option::is_none) && self.receiving.iter().all(|r| !r)
    }

    /// Scripted packets not yet delivered.
    pub fn pending(&self) -> usize {
        self.script.len()
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusTransport for SimBus {
    fn register_handler(
        &mut self,
        channel: ChannelId,
        handler: PacketHandler,
    ) -> Result<(), BusError> {
        if self.fail_register_on == Some(channel) {
            return Err(BusError::Io("injected register failure".into()));
        }
        let entry = &mut self.handlers[channel.index()];
        if entry.is_some() {
            return Err(BusError::HandlerInUse(channel));
        }
        *entry = Some(handler);
        self.events.push(BusEvent::Register(channel));
        Ok(())
    }

    fn unregister_handler(&mut self, channel: ChannelId) -> Result<(), BusError> {
        if self.handlers[channel.index()].take().is_none() {
            return Err(BusError::NoHandler(channel));
        }
        self.events.push(BusEvent::Unregister(channel));
        Ok(())
    }

    fn start_reception(&mut self, channel: ChannelId) -> Result<(), BusError> {
        if self.fail_start_on == Some(channel) {
            return Err(BusError::Io("injected start failure".into()));
        }
        self.receiving[channel.index()] = true;
        self.events.push(BusEvent::Start(channel));
        Ok(())
    }

    fn stop_reception(&mut self, channel: ChannelId) -> Result<(), BusError> {
        self.receiving[channel.index()] = false;
        self.events.push(BusEvent::Stop(channel));
        Ok(())
    }

    fn iterate(&mut self) -> Result<(), BusError> {
        let Some(packet) = self.script.pop_front() else {
            return Err(BusError::Io("no pending bus events".into()));
        };
        if self.receiving[packet.channel.index()] {
            if let Some(handler) = self.handlers[packet.channel.index()].as_mut() {
                handler(&IsoPacket::new(packet.channel, &packet.data));
            }
        }
        Ok(())
    }
}

// ── Camera ───────────────────────────────────────────────────────────

/// Configuration step a [`SimCamera`] can be told to fail at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimStep {
    Initialize,
    Format,
    Mode,
    Rate,
    ChannelSpeed,
    Region,
    Quiesce,
}

/// Table-driven camera configuration stand-in.
///
/// Geometry follows an 8-bit-per-pixel model: fixed dimensions per
/// format/mode pair, and the programmed capture region for the scalable
/// format.
pub struct SimCamera {
    packet_quadlets: u32,
    fail_at: Option<SimStep>,
    region: Option<RegionOfInterest>,
    steps: Vec<SimStep>,
    quiesce_count: u32,
}

impl SimCamera {
    pub fn new() -> Self {
        Self {
            packet_quadlets: 128,
            fail_at: None,
            region: None,
            steps: Vec::new(),
            quiesce_count: 0,
        }
    }

    /// A camera whose `step` fails.
    pub fn failing(step: SimStep) -> Self {
        Self {
            fail_at: Some(step),
            ..Self::new()
        }
    }

    /// Override the per-packet payload size (quadlets).
    pub fn with_packet_quadlets(mut self, quadlets: u32) -> Self {
        self.packet_quadlets = quadlets;
        self
    }

    /// Configuration steps executed so far, in order.
    pub fn steps(&self) -> &[SimStep] {
        &self.steps
    }

    /// How many times the device was quiesced.
    pub fn quiesce_count(&self) -> u32 {
        self.quiesce_count
    }

    fn step(&mut self, step: SimStep) -> Result<(), ConfigError> {
        self.steps.push(step);
        if self.fail_at == Some(step) {
            return Err(ConfigError::Register(format!("injected failure at {step:?}")));
        }
        Ok(())
    }

    fn dimensions(&self, config: &CaptureConfig) -> Result<(u32, u32), ConfigError> {
        match config.format {
            VideoFormat::Vga => Ok(match config.mode.0 {
                0 => (160, 120),
                1 => (320, 240),
                _ => (640, 480),
            }),
            VideoFormat::Super1 => Ok((800, 600)),
            VideoFormat::Super2 => Ok((1280, 960)),
            VideoFormat::Still => Err(ConfigError::Unsupported("still-image capture")),
            VideoFormat::Scalable => match self.region.or(config.region) {
                Some(region) => Ok((region.width, region.height)),
                None => Err(ConfigError::Unsupported("scalable capture without a region")),
            },
        }
    }
}

impl Default for SimCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraConfigurator for SimCamera {
    fn initialize(&mut self) -> Result<(), ConfigError> {
        self.step(SimStep::Initialize)
    }

    fn set_format(&mut self, _format: VideoFormat) -> Result<(), ConfigError> {
        self.step(SimStep::Format)
    }

    fn set_mode(&mut self, _format: VideoFormat, _mode: VideoMode) -> Result<(), ConfigError> {
        self.step(SimStep::Mode)
    }

    fn set_frame_rate(&mut self, _rate: FrameRate) -> Result<(), ConfigError> {
        self.step(SimStep::Rate)
    }

    fn set_channel_and_speed(
        &mut self,
        _channel: ChannelId,
        _speed: TransferSpeed,
    ) -> Result<(), ConfigError> {
        self.step(SimStep::ChannelSpeed)
    }

    fn set_region(
        &mut self,
        _mode: VideoMode,
        region: RegionOfInterest,
    ) -> Result<(), ConfigError> {
        self.step(SimStep::Region)?;
        self.region = Some(region);
        Ok(())
    }

    fn packet_quadlets(&self, _config: &CaptureConfig) -> Result<u32, ConfigError> {
        Ok(self.packet_quadlets)
    }

    fn frame_quadlets(&self, config: &CaptureConfig) -> Result<u32, ConfigError> {
        let (width, height) = self.dimensions(config)?;
        Ok((width * height).div_ceil(QUADLET_BYTES as u32))
    }

    fn frame_dimensions(&self, config: &CaptureConfig) -> Result<(u32, u32), ConfigError> {
        self.dimensions(config)
    }

    fn quiesce(&mut self) -> Result<(), ConfigError> {
        self.quiesce_count += 1;
        if self.fail_at == Some(SimStep::Quiesce) {
            return Err(ConfigError::Register("injected quiesce failure".into()));
        }
        Ok(())
    }
}

// ── Kernel buffer device ─────────────────────────────────────────────

/// Everything a [`SimDmaDevice`] was asked to do, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaEvent {
    Listen,
    Map,
    Queue(u32),
    Wait(u32),
    Unlisten,
    Unmap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimSlotStatus {
    /// Owned by user space; the producer must not touch it.
    Owned,
    /// Queued as fillable.
    Queued,
    /// Filled by the producer, waiting to be claimed or re-queued.
    Filled,
}

#[derive(Debug)]
struct SimSlot {
    data: Vec<u8>,
    status: SimSlotStatus,
}

#[derive(Debug, Default)]
struct ProbeState {
    events: Vec<DmaEvent>,
    listening: bool,
    mapped: bool,
}

/// Observer handle onto a [`SimDmaDevice`], usable after the device itself
/// has been consumed by a session.
#[derive(Debug, Clone, Default)]
pub struct SimDmaProbe {
    shared: Arc<Mutex<ProbeState>>,
}

impl SimDmaProbe {
    fn with<T>(&self, f: impl FnOnce(&mut ProbeState) -> T) -> T {
        let mut state = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Calls observed so far, in order.
    pub fn events(&self) -> Vec<DmaEvent> {
        self.with(|state| state.events.clone())
    }

    /// True when the device is neither listening nor mapped.
    pub fn is_released(&self) -> bool {
        self.with(|state| !state.listening && !state.mapped)
    }
}

/// In-memory stand-in for the kernel DMA buffer device.
///
/// Frames pushed with [`SimDmaDevice::push_frame`] are written into queued
/// slots in queue order, the way the kernel fills a listen ring; a frame
/// with no queued slot waits. A `wait` that finds nothing filled reports a
/// timeout instead of blocking.
#[derive(Debug)]
pub struct SimDmaDevice {
    grant_slots: Option<u32>,
    grant_slot_bytes: Option<usize>,
    fail_listen: bool,
    fail_map: bool,
    fail_queue_at: Option<u32>,
    slots: Vec<SimSlot>,
    fill_order: VecDeque<u32>,
    pending: VecDeque<Vec<u8>>,
    probe: SimDmaProbe,
}

impl SimDmaDevice {
    pub fn new() -> Self {
        Self {
            grant_slots: None,
            grant_slot_bytes: None,
            fail_listen: false,
            fail_map: false,
            fail_queue_at: None,
            slots: Vec::new(),
            fill_order: VecDeque::new(),
            pending: VecDeque::new(),
            probe: SimDmaProbe::default(),
        }
    }

    /// Grant a different slot count than requested.
    pub fn grant_slots(mut self, slots: u32) -> Self {
        self.grant_slots = Some(slots);
        self
    }

    /// Grant a different slot stride than requested.
    pub fn grant_slot_bytes(mut self, bytes: usize) -> Self {
        self.grant_slot_bytes = Some(bytes);
        self
    }

    /// Fail the listen request.
    pub fn fail_listen(mut self) -> Self {
        self.fail_listen = true;
        self
    }

    /// Fail the mapping step.
    pub fn fail_map(mut self) -> Self {
        self.fail_map = true;
        self
    }

    /// Fail queuing slot `index`.
    pub fn fail_queue_at(mut self, index: u32) -> Self {
        self.fail_queue_at = Some(index);
        self
    }

    /// An observer that outlives the device.
    pub fn probe(&self) -> SimDmaProbe {
        self.probe.clone()
    }

    /// Deposit one produced frame; it lands in the oldest queued slot.
    pub fn push_frame(&mut self, frame: &[u8]) {
        self.pending.push_back(frame.to_vec());
        self.pump();
    }

    /// Slots currently queued as fillable.
    pub fn queued_count(&self) -> usize {
        self.fill_order.len()
    }

    fn pump(&mut self) {
        loop {
            if self.pending.is_empty() || self.fill_order.is_empty() {
                break;
            }
            let (Some(frame), Some(index)) = (self.pending.pop_front(), self.fill_order.pop_front())
            else {
                break;
            };
            let slot = &mut self.slots[index as usize];
            slot.data.fill(0);
            let take = frame.len().min(slot.data.len());
            slot.data[..take].copy_from_slice(&frame[..take]);
            slot.status = SimSlotStatus::Filled;
        }
    }
}

impl Default for SimDmaDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaDevice for SimDmaDevice {
    fn listen(
        &mut self,
        _channel: ChannelId,
        slots: u32,
        slot_bytes: usize,
    ) -> Result<RingGrant, DmaError> {
        if self.fail_listen {
            return Err(DmaError::Listen("injected listen failure".into()));
        }
        let granted_slots = self.grant_slots.unwrap_or(slots);
        let granted_bytes = self.grant_slot_bytes.unwrap_or(slot_bytes);
        self.slots = (0..granted_slots)
            .map(|_| SimSlot {
                data: vec![0; granted_bytes],
                status: SimSlotStatus::Owned,
            })
            .collect();
        self.fill_order.clear();
        self.probe.with(|state| {
            state.listening = true;
            state.events.push(DmaEvent::Listen);
        });
        Ok(RingGrant {
            slots: granted_slots,
            slot_bytes: granted_bytes,
        })
    }

    fn map(&mut self, _channel: ChannelId) -> Result<(), DmaError> {
        if self.fail_map {
            return Err(DmaError::Map("injected map failure".into()));
        }
        self.probe.with(|state| {
            state.mapped = true;
            state.events.push(DmaEvent::Map);
        });
        Ok(())
    }

    fn queue(&mut self, _channel: ChannelId, index: u32) -> Result<(), DmaError> {
        if self.fail_queue_at == Some(index) {
            return Err(DmaError::Queue(index));
        }
        if (index as usize) >= self.slots.len() {
            return Err(DmaError::Queue(index));
        }
        self.slots[index as usize].status = SimSlotStatus::Queued;
        self.fill_order.push_back(index);
        self.probe.with(|state| state.events.push(DmaEvent::Queue(index)));
        self.pump();
        Ok(())
    }

    fn wait(
        &mut self,
        _channel: ChannelId,
        index: u32,
        timeout: Option<Duration>,
    ) -> Result<u32, DmaError> {
        self.probe.with(|state| state.events.push(DmaEvent::Wait(index)));
        self.pump();
        let total = self.slots.len() as u32;
        if total == 0 {
            return Err(DmaError::Wait("listen was never issued".into()));
        }
        let mut filled = 0;
        while filled < total {
            let slot = &self.slots[((index + filled) % total) as usize];
            if slot.status != SimSlotStatus::Filled {
                break;
            }
            filled += 1;
        }
        if filled == 0 {
            return Err(match timeout {
                Some(duration) => DmaError::TimedOut(duration),
                None => DmaError::Wait("no producer data pending".into()),
            });
        }
        Ok(filled)
    }

    fn slot(&self, _channel: ChannelId, index: u32) -> &[u8] {
        self.slots
            .get(index as usize)
            .map(|slot| slot.data.as_slice())
            .unwrap_or(&[])
    }

    fn unlisten(&mut self, _channel: ChannelId) {
        self.probe.with(|state| {
            state.listening = false;
            state.events.push(DmaEvent::Unlisten);
        });
    }

    fn unmap(&mut self, _channel: ChannelId) {
        self.probe.with(|state| {
            state.mapped = false;
            state.events.push(DmaEvent::Unmap);
        });
    }
}
