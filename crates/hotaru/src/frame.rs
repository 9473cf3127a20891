//! Channel, geometry, and frame types shared by both capture paths.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Number of isochronous channels the bus can carry.
pub const MAX_CHANNELS: usize = 64;

/// Bytes in one quadlet, the transport's payload granularity.
pub const QUADLET_BYTES: usize = 4;

/// Identifies one isochronous channel on the bus.
///
/// Channels demultiplex camera traffic: every capture session owns exactly
/// one channel for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(u8);

impl ChannelId {
    /// Create a channel id, rejecting values outside the isochronous range.
    pub fn new(raw: u8) -> Option<Self> {
        if (raw as usize) < MAX_CHANNELS {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// The raw channel number.
    pub fn as_u8(self) -> u8 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frame and packet geometry derived from the camera configuration.
///
/// Immutable for the life of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Payload quadlets carried by each isochronous packet.
    pub packet_quadlets: u32,
    /// Total payload quadlets in one frame.
    pub frame_quadlets: u32,
}

impl FrameGeometry {
    /// Total payload bytes in one frame.
    pub fn frame_bytes(&self) -> usize {
        self.frame_quadlets as usize * QUADLET_BYTES
    }

    /// Payload bytes carried by each full packet.
    pub fn packet_bytes(&self) -> usize {
        self.packet_quadlets as usize * QUADLET_BYTES
    }

    /// Packets needed to deliver one frame; the final one may be short.
    pub fn packets_per_frame(&self) -> u32 {
        self.frame_quadlets.div_ceil(self.packet_quadlets)
    }
}

/// Capture window for scalable image formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// One complete frame delivered by the software capture path.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Channel the frame arrived on.
    pub channel: ChannelId,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Reassembled frame payload.
    pub data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_id_bounds() {
        assert!(ChannelId::new(0).is_some());
        assert!(ChannelId::new(63).is_some());
        assert!(ChannelId::new(64).is_none());
        assert!(ChannelId::new(255).is_none());
    }

    #[test]
    fn channel_id_displays_raw_number() {
        let channel = ChannelId::new(11).unwrap();
        assert_eq!(format!("{channel}"), "11");
    }

    #[test]
    fn packets_per_frame_rounds_up() {
        let geometry = FrameGeometry {
            width: 200,
            height: 100,
            packet_quadlets: 128,
            frame_quadlets: 5000,
        };
        assert_eq!(geometry.frame_bytes(), 20_000);
        assert_eq!(geometry.packet_bytes(), 512);
        assert_eq!(geometry.packets_per_frame(), 40);
    }

    #[test]
    fn exact_multiple_needs_no_extra_packet() {
        let geometry = FrameGeometry {
            width: 64,
            height: 32,
            packet_quadlets: 128,
            frame_quadlets: 512,
        };
        assert_eq!(geometry.packets_per_frame(), 4);
    }
}
