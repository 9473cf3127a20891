//! Per-channel packet reassembly.
//!
//! The channel table is the shared state between the demultiplexing packet
//! handler and the capture sessions it serves: one slot per isochronous
//! channel, each tracking the in-progress frame of whichever session owns
//! that channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace, warn};

use crate::error::CaptureError;
use crate::frame::{ChannelId, MAX_CHANNELS};
use crate::transport::{IsoPacket, PacketHandler};

/// Capture progress of one channel slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Waiting for a frame-start packet.
    Idle,
    /// Mid-frame; payload is being accumulated.
    InProgress,
    /// A complete frame is waiting to be consumed.
    Complete,
}

struct Slot {
    buffer: Vec<u8>,
    write_offset: usize,
    expected_bytes: usize,
    progress: Progress,
    /// Packets seen while idle without a frame-start marker.
    stray_packets: u64,
    watchdog_limit: u64,
    desynced: bool,
}

impl Slot {
    fn new(expected_bytes: usize, watchdog_limit: u64) -> Self {
        Self {
            buffer: vec![0; expected_bytes],
            write_offset: 0,
            expected_bytes,
            progress: Progress::Idle,
            stray_packets: 0,
            watchdog_limit,
            desynced: false,
        }
    }

    /// Feed one packet; returns true when it completed a frame.
    fn accept(&mut self, packet: &IsoPacket<'_>) -> bool {
        if self.desynced {
            return false;
        }

        if packet.is_frame_start() && self.progress == Progress::Idle {
            self.write_offset = 0;
            self.progress = Progress::InProgress;
            self.copy_in(packet.payload());
        } else if self.progress == Progress::InProgress {
            self.copy_in(packet.payload());
        } else {
            // Either no start marker has arrived yet, or a finished frame is
            // still waiting to be consumed; the buffer must stay untouched.
            // A channel that keeps receiving payload while idle has lost
            // synchronization with its camera.
            if self.progress == Progress::Idle {
                self.stray_packets += 1;
                if self.stray_packets > self.watchdog_limit {
                    self.desynced = true;
                }
            }
            return false;
        }

        self.stray_packets = 0;
        if self.write_offset >= self.expected_bytes {
            self.progress = Progress::Complete;
            self.write_offset = 0;
            return true;
        }
        false
    }

    fn copy_in(&mut self, payload: &[u8]) {
        let remaining = self.expected_bytes - self.write_offset;
        let take = payload.len().min(remaining);
        self.buffer[self.write_offset..self.write_offset + take]
            .copy_from_slice(&payload[..take]);
        self.write_offset += take;
    }
}

struct Inner {
    slots: Vec<Option<Slot>>,
    awaiting: usize,
}

/// Process-wide reassembly state, one slot per isochronous channel.
///
/// Cloning is cheap and shares the underlying table; the packet callback
/// returned by [`ChannelTable::handler`] holds one such clone, which is how
/// the demultiplexing handler and the capture sessions see the same slots.
#[derive(Clone)]
pub struct ChannelTable {
    inner: Arc<Mutex<Inner>>,
}

impl ChannelTable {
    pub fn new() -> Self {
        let slots = (0..MAX_CHANNELS).map(|_| None).collect();
        Self {
            inner: Arc::new(Mutex::new(Inner { slots, awaiting: 0 })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `channel` for a capture, allocating its frame buffer.
    ///
    /// Fails when another active capture already owns the channel.
    pub(crate) fn bind(
        &self,
        channel: ChannelId,
        expected_bytes: usize,
        watchdog_limit: u64,
    ) -> Result<(), CaptureError> {
        let mut inner = self.lock();
        let entry = &mut inner.slots[channel.index()];
        if entry.is_some() {
            return Err(CaptureError::ChannelInUse(channel));
        }
        *entry = Some(Slot::new(expected_bytes, watchdog_limit));
        Ok(())
    }

    /// Release `channel`, returning its buffer and final progress.
    pub(crate) fn unbind(&self, channel: ChannelId) -> Option<(Vec<u8>, Progress)> {
        let mut inner = self.lock();
        inner.slots[channel.index()]
            .take()
            .map(|slot| (slot.buffer, slot.progress))
    }

    /// Set the number of channels still expected to produce a frame.
    pub(crate) fn set_awaiting(&self, sessions: usize) {
        self.lock().awaiting = sessions;
    }

    /// Channels still expected to produce a frame.
    pub(crate) fn awaiting(&self) -> usize {
        self.lock().awaiting
    }

    /// First channel that has lost frame synchronization, if any.
    pub(crate) fn desynced_channel(&self) -> Option<ChannelId> {
        let inner = self.lock();
        inner.slots.iter().enumerate().find_map(|(i, slot)| match slot {
            Some(slot) if slot.desynced => ChannelId::new(i as u8),
            _ => None,
        })
    }

    /// Capture progress of `channel`, if it is bound.
    pub fn progress(&self, channel: ChannelId) -> Option<Progress> {
        self.lock().slots[channel.index()].as_ref().map(|slot| slot.progress)
    }

    #[cfg(test)]
    fn write_offset(&self, channel: ChannelId) -> Option<usize> {
        self.lock().slots[channel.index()]
            .as_ref()
            .map(|slot| slot.write_offset)
    }

    /// Feed one inbound packet to its channel's slot.
    ///
    /// Packets for unbound channels are dropped; a packet never touches any
    /// slot other than its own channel's.
    pub fn ingest(&self, packet: &IsoPacket<'_>) {
        let mut inner = self.lock();
        let channel = packet.channel();
        let completed = match inner.slots[channel.index()].as_mut() {
            Some(slot) => {
                let was_desynced = slot.desynced;
                let completed = slot.accept(packet);
                if slot.desynced && !was_desynced {
                    warn!(%channel, "channel lost frame synchronization");
                }
                completed
            }
            None => {
                trace!(%channel, "packet for unbound channel dropped");
                false
            }
        };
        if completed {
            inner.awaiting = inner.awaiting.saturating_sub(1);
            debug!(%channel, awaiting = inner.awaiting, "frame complete");
        }
    }

    /// A boxed packet callback bound to this table, suitable for
    /// registration with a bus transport.
    pub fn handler(&self) -> PacketHandler {
        let table = self.clone();
        Box::new(move |packet| table.ingest(packet))
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chan(n: u8) -> ChannelId {
        ChannelId::new(n).unwrap()
    }

    fn raw(start: bool, payload: &[u8]) -> Vec<u8> {
        let header: u32 = if start { 1 } else { 0 };
        let mut data = header.to_le_bytes().to_vec();
        data.extend_from_slice(payload);
        data
    }

    fn feed(table: &ChannelTable, channel: ChannelId, start: bool, payload: &[u8]) {
        let data = raw(start, payload);
        table.ingest(&IsoPacket::new(channel, &data));
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
    }

    #[test]
    fn payload_before_frame_start_is_ignored() {
        let table = ChannelTable::new();
        table.bind(chan(0), 1024, 100).unwrap();

        feed(&table, chan(0), false, &[0xFF; 512]);
        assert_eq!(table.progress(chan(0)), Some(Progress::Idle));
        assert_eq!(table.write_offset(chan(0)), Some(0));
    }

    #[test]
    fn reassembles_a_frame_across_forty_packets() {
        let table = ChannelTable::new();
        let frame = pattern(20_000, 0);
        table.bind(chan(3), 20_000, 100).unwrap();
        table.set_awaiting(1);

        let mut chunks = frame.chunks(512);
        feed(&table, chan(3), true, chunks.next().unwrap());
        for _ in 0..38 {
            feed(&table, chan(3), false, chunks.next().unwrap());
        }
        assert_eq!(table.progress(chan(3)), Some(Progress::InProgress));
        assert_eq!(table.write_offset(chan(3)), Some(19_968));

        // Final packet carries the 32-byte remainder.
        feed(&table, chan(3), false, chunks.next().unwrap());
        assert_eq!(table.progress(chan(3)), Some(Progress::Complete));
        assert_eq!(table.awaiting(), 0);

        let (buffer, progress) = table.unbind(chan(3)).unwrap();
        assert_eq!(progress, Progress::Complete);
        assert_eq!(buffer, frame);
    }

    #[test]
    fn oversized_final_packet_is_clamped() {
        let table = ChannelTable::new();
        table.bind(chan(1), 768, 100).unwrap();

        feed(&table, chan(1), true, &pattern(512, 1));
        // A full-size packet where only 256 bytes fit.
        feed(&table, chan(1), false, &pattern(512, 9));
        assert_eq!(table.progress(chan(1)), Some(Progress::Complete));

        let (buffer, _) = table.unbind(chan(1)).unwrap();
        assert_eq!(&buffer[..512], pattern(512, 1).as_slice());
        assert_eq!(&buffer[512..], &pattern(512, 9)[..256]);
    }

    #[test]
    fn single_packet_frame_completes() {
        let table = ChannelTable::new();
        table.bind(chan(2), 512, 100).unwrap();
        table.set_awaiting(1);

        feed(&table, chan(2), true, &pattern(512, 7));
        assert_eq!(table.progress(chan(2)), Some(Progress::Complete));
        assert_eq!(table.awaiting(), 0);
    }

    #[test]
    fn complete_frame_is_not_overwritten() {
        let table = ChannelTable::new();
        table.bind(chan(5), 512, 100).unwrap();
        let frame = pattern(512, 3);

        feed(&table, chan(5), true, &frame);
        assert_eq!(table.progress(chan(5)), Some(Progress::Complete));

        // Another frame begins before anyone consumed the finished one.
        feed(&table, chan(5), true, &[0xEE; 512]);
        feed(&table, chan(5), false, &[0xEE; 512]);

        let (buffer, progress) = table.unbind(chan(5)).unwrap();
        assert_eq!(progress, Progress::Complete);
        assert_eq!(buffer, frame);
    }

    #[test]
    fn start_marker_mid_frame_does_not_restart() {
        let table = ChannelTable::new();
        table.bind(chan(4), 1024, 100).unwrap();

        feed(&table, chan(4), true, &pattern(512, 0));
        // A spurious start marker mid-frame is consumed as payload.
        feed(&table, chan(4), true, &pattern(512, 50));
        assert_eq!(table.progress(chan(4)), Some(Progress::Complete));

        let (buffer, _) = table.unbind(chan(4)).unwrap();
        assert_eq!(&buffer[512..], pattern(512, 50).as_slice());
    }

    #[test]
    fn channels_do_not_interfere() {
        let table = ChannelTable::new();
        let frame_a = pattern(1024, 10);
        let frame_b = pattern(1024, 200);
        table.bind(chan(7), 1024, 100).unwrap();
        table.bind(chan(8), 1024, 100).unwrap();
        table.set_awaiting(2);

        // Interleave the two channels packet by packet.
        for i in 0..2 {
            let start = i == 0;
            feed(&table, chan(7), start, &frame_a[i * 512..(i + 1) * 512]);
            feed(&table, chan(8), start, &frame_b[i * 512..(i + 1) * 512]);
        }

        assert_eq!(table.awaiting(), 0);
        let (buffer_a, _) = table.unbind(chan(7)).unwrap();
        let (buffer_b, _) = table.unbind(chan(8)).unwrap();
        assert_eq!(buffer_a, frame_a);
        assert_eq!(buffer_b, frame_b);
    }

    #[test]
    fn bind_rejects_a_channel_in_use() {
        let table = ChannelTable::new();
        table.bind(chan(9), 512, 100).unwrap();
        assert_eq!(
            table.bind(chan(9), 512, 100),
            Err(CaptureError::ChannelInUse(chan(9)))
        );
    }

    #[test]
    fn watchdog_flags_a_channel_without_frame_starts() {
        let table = ChannelTable::new();
        table.bind(chan(6), 1024, 4).unwrap();

        for _ in 0..4 {
            feed(&table, chan(6), false, &[0; 512]);
        }
        assert_eq!(table.desynced_channel(), None);

        feed(&table, chan(6), false, &[0; 512]);
        assert_eq!(table.desynced_channel(), Some(chan(6)));

        // A desynchronized slot stops accepting packets entirely.
        feed(&table, chan(6), true, &[1; 512]);
        assert_eq!(table.progress(chan(6)), Some(Progress::Idle));
    }

    #[test]
    fn awaiting_counter_tracks_completions() {
        let table = ChannelTable::new();
        table.bind(chan(10), 512, 100).unwrap();
        table.bind(chan(11), 512, 100).unwrap();
        table.set_awaiting(2);

        feed(&table, chan(10), true, &[1; 512]);
        assert_eq!(table.awaiting(), 1);
        feed(&table, chan(11), true, &[2; 512]);
        assert_eq!(table.awaiting(), 0);
    }

    #[test]
    fn unbound_channel_packets_are_dropped() {
        let table = ChannelTable::new();
        table.bind(chan(12), 512, 100).unwrap();
        feed(&table, chan(13), true, &[9; 512]);
        assert_eq!(table.progress(chan(13)), None);
        assert_eq!(table.progress(chan(12)), Some(Progress::Idle));
    }
}
