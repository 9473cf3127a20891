//! Error types for configuration, transport, capture, and the DMA ring.
//!
//! Setup failures name the step that failed so a caller can tell a camera
//! that rejected a video mode apart from a kernel that refused a buffer
//! mapping.

use std::time::Duration;

use thiserror::Error;

use crate::frame::ChannelId;

/// Failures reported by a camera-configuration collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// No camera is present at the configured node.
    #[error("no camera is present at the configured node")]
    NoDevice,
    /// The camera does not support the requested setting.
    #[error("the camera does not support {0}")]
    Unsupported(&'static str),
    /// A device register access failed.
    #[error("device register access failed: {0}")]
    Register(String),
}

/// Failures reported by the bus-transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// A packet handler is already registered on the channel.
    #[error("a handler is already registered on channel {0}")]
    HandlerInUse(ChannelId),
    /// No packet handler is registered on the channel.
    #[error("no handler is registered on channel {0}")]
    NoHandler(ChannelId),
    /// The bus subsystem reported a failure.
    #[error("bus operation failed: {0}")]
    Io(String),
}

/// Failures reported by the kernel DMA-buffer collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmaError {
    /// The buffer device could not be opened.
    #[error("the buffer device could not be opened")]
    DeviceOpen,
    /// The kernel rejected the listen request for the channel.
    #[error("the kernel rejected the listen request: {0}")]
    Listen(String),
    /// Mapping the ring into process memory failed.
    #[error("mapping the ring into process memory failed: {0}")]
    Map(String),
    /// The kernel rejected queuing a slot.
    #[error("the kernel rejected queuing slot {0}")]
    Queue(u32),
    /// No filled slot arrived within the wait bound.
    #[error("no filled slot arrived within {0:?}")]
    TimedOut(Duration),
    /// Waiting for a filled slot failed outright.
    #[error("waiting for a filled slot failed: {0}")]
    Wait(String),
    /// The ring session has already been closed.
    #[error("the ring session is closed")]
    Closed,
}

/// Session setup failures, tagged with the step that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetupError {
    #[error("camera initialization failed")]
    DeviceInit(#[source] ConfigError),
    #[error("setting the video format failed")]
    Format(#[source] ConfigError),
    #[error("setting the video mode failed")]
    Mode(#[source] ConfigError),
    #[error("setting the frame rate failed")]
    FrameRate(#[source] ConfigError),
    #[error("setting the channel and speed failed")]
    ChannelSpeed(#[source] ConfigError),
    #[error("setting the capture region failed")]
    Region(#[source] ConfigError),
    #[error("querying frame geometry failed")]
    Geometry(#[source] ConfigError),
    #[error("derived geometry is unusable: {0}")]
    BadGeometry(String),
    #[error("the kernel listen request failed")]
    RingListen(#[source] DmaError),
    #[error("mapping the DMA ring failed")]
    RingMap(#[source] DmaError),
    #[error("queuing ring slot {index} failed")]
    RingQueue {
        index: u32,
        #[source]
        source: DmaError,
    },
}

/// Failures during a capture call on either path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The channel is already owned by another active capture.
    #[error("channel {0} is already owned by an active capture")]
    ChannelInUse(ChannelId),
    /// Registering a handler or starting reception failed.
    #[error("transport failure on channel {channel}")]
    Transport {
        channel: ChannelId,
        #[source]
        source: BusError,
    },
    /// Driving bus event processing failed.
    #[error("bus event processing failed")]
    Iterate(#[source] BusError),
    /// The channel kept receiving packets without ever seeing a frame start.
    #[error("channel {0} lost frame synchronization")]
    Desynchronized(ChannelId),
    /// The capture was cancelled by its stop signal.
    #[error("capture was cancelled")]
    Cancelled,
    /// The DMA ring reported a failure.
    #[error("DMA ring failure")]
    Ring(#[from] DmaError),
}
