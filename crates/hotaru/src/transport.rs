//! Bus-transport collaborator interface and the inbound packet view.

use crate::error::BusError;
use crate::frame::{ChannelId, QUADLET_BYTES};

/// Bytes of bus-protocol header at the front of every isochronous packet.
pub const HEADER_BYTES: usize = QUADLET_BYTES;

/// Marker bit set in the header word of the first packet of a frame.
const FRAME_START_BIT: u32 = 0x1;

/// One inbound isochronous packet as delivered to a channel handler.
///
/// The raw data starts with one header quadlet; everything after it is
/// frame payload.
#[derive(Debug, Clone, Copy)]
pub struct IsoPacket<'a> {
    channel: ChannelId,
    data: &'a [u8],
}

impl<'a> IsoPacket<'a> {
    pub fn new(channel: ChannelId, data: &'a [u8]) -> Self {
        Self { channel, data }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// The bus-protocol header word, or 0 for a runt packet.
    pub fn header(&self) -> u32 {
        match self.data.get(..HEADER_BYTES) {
            Some(bytes) => u32::from_le_bytes(bytes.try_into().unwrap_or([0; HEADER_BYTES])),
            None => 0,
        }
    }

    /// Whether this packet begins a new frame.
    pub fn is_frame_start(&self) -> bool {
        self.header() & FRAME_START_BIT != 0
    }

    /// Payload bytes after the header quadlet.
    pub fn payload(&self) -> &'a [u8] {
        self.data.get(HEADER_BYTES..).unwrap_or(&[])
    }
}

/// Callback invoked once per inbound packet on a registered channel.
pub type PacketHandler = Box<dyn FnMut(&IsoPacket<'_>) + Send>;

/// Interface the capture engine needs from the serial-bus transport.
///
/// Real implementations wrap the bus subsystem; the `sim` module provides a
/// scripted software stand-in.
pub trait BusTransport {
    /// Register `handler` to receive packets for `channel`.
    fn register_handler(&mut self, channel: ChannelId, handler: PacketHandler)
        -> Result<(), BusError>;

    /// Remove the handler registered for `channel`.
    fn unregister_handler(&mut self, channel: ChannelId) -> Result<(), BusError>;

    /// Ask the bus to start delivering isochronous traffic for `channel`.
    fn start_reception(&mut self, channel: ChannelId) -> Result<(), BusError>;

    /// Stop isochronous delivery for `channel`.
    fn stop_reception(&mut self, channel: ChannelId) -> Result<(), BusError>;

    /// Drive one step of bus event processing, dispatching pending packets
    /// to their channel handlers on the calling thread.
    fn iterate(&mut self) -> Result<(), BusError>;
}
