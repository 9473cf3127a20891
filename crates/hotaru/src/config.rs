//! Camera configuration: formats, rates, and the configurator collaborator.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, SetupError};
use crate::frame::{ChannelId, FrameGeometry, RegionOfInterest};

/// Isochronous transfer speed negotiated for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferSpeed {
    S100,
    S200,
    S400,
}

/// Nominal frame cadence the camera transmits at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameRate {
    Fps1_875,
    Fps3_75,
    Fps7_5,
    Fps15,
    Fps30,
    Fps60,
}

/// Top-level image format family.
///
/// `Scalable` formats take their dimensions from a caller-supplied capture
/// region instead of the fixed mode tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoFormat {
    Vga,
    Super1,
    Super2,
    Still,
    Scalable,
}

/// Mode within a format family; its meaning depends on the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoMode(pub u8);

/// Everything needed to configure one camera for capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub channel: ChannelId,
    pub format: VideoFormat,
    pub mode: VideoMode,
    pub rate: FrameRate,
    pub speed: TransferSpeed,
    /// Capture window; required by (and only valid for) scalable formats.
    pub region: Option<RegionOfInterest>,
}

impl CaptureConfig {
    pub fn new(
        channel: ChannelId,
        format: VideoFormat,
        mode: VideoMode,
        rate: FrameRate,
        speed: TransferSpeed,
    ) -> Self {
        Self {
            channel,
            format,
            mode,
            rate,
            speed,
            region: None,
        }
    }

    /// Set the capture window (builder style).
    pub fn with_region(mut self, region: RegionOfInterest) -> Self {
        self.region = Some(region);
        self
    }
}

/// Per-device register-level configuration, supplied by the caller.
///
/// Each step may fail independently; setup aborts at the first failure and
/// reports which step it was.
pub trait CameraConfigurator {
    fn initialize(&mut self) -> Result<(), ConfigError>;

    fn set_format(&mut self, format: VideoFormat) -> Result<(), ConfigError>;

    fn set_mode(&mut self, format: VideoFormat, mode: VideoMode) -> Result<(), ConfigError>;

    fn set_frame_rate(&mut self, rate: FrameRate) -> Result<(), ConfigError>;

    fn set_channel_and_speed(
        &mut self,
        channel: ChannelId,
        speed: TransferSpeed,
    ) -> Result<(), ConfigError>;

    /// Program the capture window for a scalable format.
    fn set_region(&mut self, mode: VideoMode, region: RegionOfInterest)
        -> Result<(), ConfigError>;

    /// Payload quadlets each isochronous packet will carry.
    fn packet_quadlets(&self, config: &CaptureConfig) -> Result<u32, ConfigError>;

    /// Total payload quadlets in one frame.
    fn frame_quadlets(&self, config: &CaptureConfig) -> Result<u32, ConfigError>;

    /// Frame width and height in pixels.
    fn frame_dimensions(&self, config: &CaptureConfig) -> Result<(u32, u32), ConfigError>;

    /// Stop the device transmitting and clear any one-shot trigger state.
    fn quiesce(&mut self) -> Result<(), ConfigError>;
}

/// Run the configuration steps in order and derive the session geometry.
pub(crate) fn configure_camera<C>(
    camera: &mut C,
    config: &CaptureConfig,
) -> Result<FrameGeometry, SetupError>
where
    C: CameraConfigurator + ?Sized,
{
    camera.initialize().map_err(SetupError::DeviceInit)?;
    camera.set_format(config.format).map_err(SetupError::Format)?;
    camera
        .set_mode(config.format, config.mode)
        .map_err(SetupError::Mode)?;
    camera.set_frame_rate(config.rate).map_err(SetupError::FrameRate)?;
    camera
        .set_channel_and_speed(config.channel, config.speed)
        .map_err(SetupError::ChannelSpeed)?;
    if let Some(region) = config.region {
        if config.format != VideoFormat::Scalable {
            return Err(SetupError::BadGeometry(
                "a capture region requires a scalable format".into(),
            ));
        }
        camera
            .set_region(config.mode, region)
            .map_err(SetupError::Region)?;
    }

    let packet_quadlets = camera.packet_quadlets(config).map_err(SetupError::Geometry)?;
    let frame_quadlets = camera.frame_quadlets(config).map_err(SetupError::Geometry)?;
    let (width, height) = camera.frame_dimensions(config).map_err(SetupError::Geometry)?;
    if width == 0 || height == 0 || packet_quadlets == 0 || frame_quadlets == 0 {
        return Err(SetupError::BadGeometry(format!(
            "{width}x{height} frame, {packet_quadlets} quadlets/packet, \
             {frame_quadlets} quadlets/frame"
        )));
    }

    Ok(FrameGeometry {
        width,
        height,
        packet_quadlets,
        frame_quadlets,
    })
}

/// Issue the device quiesce command, logging (not propagating) failure.
pub(crate) fn quiesce_camera<C>(camera: &mut C)
where
    C: CameraConfigurator + ?Sized,
{
    if let Err(err) = camera.quiesce() {
        warn!(%err, "camera quiesce failed during teardown");
    }
}
