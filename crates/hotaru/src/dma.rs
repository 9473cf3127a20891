//! DMA-path capture: kernel ring-buffer sessions and slot loans.
//!
//! The kernel owns a memory-mapped ring of whole-frame slots per channel.
//! [`DmaCapture`] queues every slot as fillable, waits for the next filled
//! one, drops stale slots under backpressure so the caller always sees the
//! newest frame, and loans the winning slot out as a read-only view. The
//! loan mutably borrows the session, so a second capture cannot start until
//! the slot has been released.

use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{configure_camera, quiesce_camera, CameraConfigurator, CaptureConfig};
use crate::error::{CaptureError, DmaError, SetupError};
use crate::frame::{ChannelId, FrameGeometry};

/// Ring geometry actually granted by the kernel.
///
/// The kernel may round the slot size (and occasionally the slot count) up
/// from what was requested; the granted values are the ones that hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGrant {
    /// Number of slots in the ring.
    pub slots: u32,
    /// Stride of each slot in bytes.
    pub slot_bytes: usize,
}

/// Interface the capture engine needs from the kernel DMA-buffer device.
///
/// Real implementations wrap the kernel buffer device; the `sim` module
/// provides an in-memory stand-in.
pub trait DmaDevice {
    /// Ask the kernel to receive `channel` into a ring of `slots` buffers
    /// of `slot_bytes` each. The grant is authoritative.
    fn listen(
        &mut self,
        channel: ChannelId,
        slots: u32,
        slot_bytes: usize,
    ) -> Result<RingGrant, DmaError>;

    /// Map the granted ring into process memory.
    fn map(&mut self, channel: ChannelId) -> Result<(), DmaError>;

    /// Hand slot `index` back to the kernel as fillable.
    fn queue(&mut self, channel: ChannelId, index: u32) -> Result<(), DmaError>;

    /// Block until slot `index` is filled, bounded by `timeout` when given.
    ///
    /// Returns how many consecutive slots beginning at `index` are filled
    /// (at least 1); more than 1 means the caller fell behind the producer.
    fn wait(
        &mut self,
        channel: ChannelId,
        index: u32,
        timeout: Option<Duration>,
    ) -> Result<u32, DmaError>;

    /// Read access to the mapped bytes of slot `index`.
    fn slot(&self, channel: ChannelId, index: u32) -> &[u8];

    /// Stop receiving `channel`. Best effort.
    fn unlisten(&mut self, channel: ChannelId);

    /// Unmap the ring region. Best effort.
    fn unmap(&mut self, channel: ChannelId);
}

/// Lifecycle of one ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Owned by the kernel, waiting to be filled.
    QueuedEmpty,
    /// Filled by the kernel, not yet claimed or dropped.
    FilledPending,
    /// Loaned to the caller as a read-only view.
    HandedToCaller,
}

/// Delivery counters for a ring session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    /// Slots handed to the caller.
    pub frames_delivered: u64,
    /// Filled slots dropped by the newest-wins policy.
    pub frames_skipped: u64,
}

/// One camera capturing through a kernel-managed ring (DMA path).
#[derive(Debug)]
pub struct DmaCapture<D: DmaDevice> {
    device: D,
    channel: ChannelId,
    geometry: FrameGeometry,
    slot_count: u32,
    slot_bytes: usize,
    states: Vec<SlotState>,
    last_buffer: Option<u32>,
    stats: RingStats,
    active: bool,
}

impl<D: DmaDevice> DmaCapture<D> {
    /// Configure `camera`, then allocate, map, and queue a ring of
    /// `slot_count` frame slots on `device`.
    ///
    /// Failure at any step releases everything acquired before it.
    pub fn setup<C>(
        camera: &mut C,
        mut device: D,
        config: CaptureConfig,
        slot_count: u32,
    ) -> Result<Self, SetupError>
    where
        C: CameraConfigurator + ?Sized,
    {
        let geometry = configure_camera(camera, &config)?;
        if slot_count == 0 {
            return Err(SetupError::BadGeometry("a ring needs at least one slot".into()));
        }

        let requested = geometry.frame_bytes();
        let grant = device
            .listen(config.channel, slot_count, requested)
            .map_err(SetupError::RingListen)?;
        // The kernel may round the slot size up; whatever it granted is the
        // stride from here on.
        if grant.slots == 0 || grant.slot_bytes < requested {
            device.unlisten(config.channel);
            return Err(SetupError::BadGeometry(format!(
                "kernel granted {} slots of {} bytes for {} byte frames",
                grant.slots, grant.slot_bytes, requested
            )));
        }

        if let Err(source) = device.map(config.channel) {
            device.unlisten(config.channel);
            return Err(SetupError::RingMap(source));
        }

        for index in 0..grant.slots {
            if let Err(source) = device.queue(config.channel, index) {
                device.unlisten(config.channel);
                device.unmap(config.channel);
                return Err(SetupError::RingQueue { index, source });
            }
        }

        info!(
            channel = %config.channel,
            slots = grant.slots,
            slot_bytes = grant.slot_bytes,
            "ring session ready"
        );
        Ok(Self {
            device,
            channel: config.channel,
            geometry,
            slot_count: grant.slots,
            slot_bytes: grant.slot_bytes,
            states: vec![SlotState::QueuedEmpty; grant.slots as usize],
            last_buffer: None,
            stats: RingStats::default(),
            active: true,
        })
    }

    /// Block until the next frame is available and loan its slot out.
    ///
    /// When the producer has outrun the caller, every older filled slot is
    /// re-queued (its frame dropped) so the view always holds the newest
    /// frame.
    pub fn capture(&mut self) -> Result<HeldSlot<'_, D>, CaptureError> {
        self.capture_inner(None)
    }

    /// Like [`DmaCapture::capture`], but gives up with
    /// [`DmaError::TimedOut`] when no frame arrives within `timeout`.
    pub fn capture_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<HeldSlot<'_, D>, CaptureError> {
        self.capture_inner(Some(timeout))
    }

    fn capture_inner(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<HeldSlot<'_, D>, CaptureError> {
        if !self.active {
            return Err(CaptureError::Ring(DmaError::Closed));
        }

        let slots = self.slot_count;
        let next = self.last_buffer.map_or(0, |last| (last + 1) % slots);
        let filled = self
            .device
            .wait(self.channel, next, timeout)
            .map_err(CaptureError::Ring)?;
        if filled == 0 {
            return Err(CaptureError::Ring(DmaError::Wait(
                "device reported an empty wait".into(),
            )));
        }
        let filled = filled.min(slots);

        for i in 0..filled {
            self.states[((next + i) % slots) as usize] = SlotState::FilledPending;
        }

        // Drop everything older than the newest filled slot.
        let newest = (next + filled - 1) % slots;
        let mut index = next;
        while index != newest {
            if let Err(err) = self.requeue(index) {
                warn!(slot = index, %err, "failed to re-queue a skipped slot");
            }
            self.stats.frames_skipped += 1;
            index = (index + 1) % slots;
        }

        self.states[newest as usize] = SlotState::HandedToCaller;
        self.last_buffer = Some(newest);
        self.stats.frames_delivered += 1;
        debug!(
            channel = %self.channel,
            slot = newest,
            skipped = filled - 1,
            "frame slot ready"
        );
        Ok(HeldSlot {
            ring: self,
            index: newest,
        })
    }

    fn requeue(&mut self, index: u32) -> Result<(), DmaError> {
        self.device.queue(self.channel, index)?;
        self.states[index as usize] = SlotState::QueuedEmpty;
        Ok(())
    }

    /// Stop listening and unmap the ring. Safe to call more than once.
    pub fn close(&mut self) {
        if self.active {
            self.device.unlisten(self.channel);
            self.device.unmap(self.channel);
            self.active = false;
            debug!(channel = %self.channel, "ring session closed");
        }
    }

    /// Quiesce the camera, then close the ring.
    ///
    /// Quiesce failures are logged and otherwise ignored so teardown always
    /// completes.
    pub fn release<C>(mut self, camera: &mut C)
    where
        C: CameraConfigurator + ?Sized,
    {
        quiesce_camera(camera);
        self.close();
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Frame geometry derived at setup, immutable for the session.
    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    /// Number of slots in the granted ring.
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// Granted stride of each slot in bytes.
    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    pub fn stats(&self) -> RingStats {
        self.stats
    }

    /// The underlying buffer device.
    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

impl<D: DmaDevice> Drop for DmaCapture<D> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read-only loan of the newest filled ring slot.
///
/// While the loan is alive the session is mutably borrowed, so the next
/// capture cannot start until the slot has been given back. Dropping the
/// loan re-queues the slot; [`HeldSlot::release`] does the same but reports
/// a queue failure instead of logging it.
#[derive(Debug)]
pub struct HeldSlot<'a, D: DmaDevice> {
    ring: &'a mut DmaCapture<D>,
    index: u32,
}

impl<D: DmaDevice> HeldSlot<'_, D> {
    /// Ring index of the loaned slot.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The frame bytes in the loaned slot.
    pub fn data(&self) -> &[u8] {
        let data = self.ring.device.slot(self.ring.channel, self.index);
        let len = self.ring.geometry.frame_bytes().min(data.len());
        &data[..len]
    }

    /// Return the slot to the kernel so it can be filled again.
    pub fn release(self) -> Result<(), CaptureError> {
        let mut held = ManuallyDrop::new(self);
        let index = held.index;
        held.ring.requeue(index).map_err(CaptureError::Ring)
    }
}

impl<D: DmaDevice> Deref for HeldSlot<'_, D> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

impl<D: DmaDevice> Drop for HeldSlot<'_, D> {
    fn drop(&mut self) {
        let index = self.index;
        if let Err(err) = self.ring.requeue(index) {
            warn!(slot = index, %err, "failed to re-queue a dropped slot");
        }
    }
}
