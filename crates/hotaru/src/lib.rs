//! Hotaru — isochronous frame capture for bus-attached cameras
//!
//! Reassembles bus-level isochronous packets into complete video frames and
//! hands them to the caller through either of two paths:
//!
//! - **Software path**: a per-channel reassembly handler copies each
//!   packet's payload into a frame buffer; [`capture_frames`] drives bus
//!   event processing until every configured camera has produced a frame,
//!   and [`spawn_capture_stream`] runs that loop on a background worker.
//! - **DMA path**: the kernel fills a memory-mapped ring of whole-frame
//!   slots; [`DmaCapture`] waits for the newest filled slot and loans it to
//!   the caller without per-packet copying.
//!
//! Device configuration, the bus transport, and the kernel buffer device
//! are collaborator traits ([`CameraConfigurator`], [`BusTransport`],
//! [`DmaDevice`]) supplied by the caller; the `sim` module (default `sim`
//! feature) ships synthetic implementations for development without
//! hardware.

mod assembly;
pub mod capture;
mod config;
pub mod dma;
mod error;
mod frame;
mod transport;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use assembly::{ChannelTable, Progress};
pub use capture::{
    capture_frame, capture_frames, setup_capture, spawn_capture_stream, CaptureOptions,
    CaptureSession, CaptureStream,
};
pub use config::{
    CameraConfigurator, CaptureConfig, FrameRate, TransferSpeed, VideoFormat, VideoMode,
};
pub use dma::{DmaCapture, DmaDevice, HeldSlot, RingGrant, RingStats};
pub use error::{BusError, CaptureError, ConfigError, DmaError, SetupError};
pub use frame::{
    CapturedFrame, ChannelId, FrameGeometry, RegionOfInterest, MAX_CHANNELS, QUADLET_BYTES,
};
pub use transport::{BusTransport, IsoPacket, PacketHandler, HEADER_BYTES};
