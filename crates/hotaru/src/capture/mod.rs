//! Software-path capture: session setup and the multi-camera capture loop.
//!
//! Each configured camera becomes a [`CaptureSession`] bound to one
//! isochronous channel. [`capture_frames`] registers a reassembly handler
//! per channel, drives bus event processing until every channel holds a
//! complete frame, and always tears the registrations back down.

mod stream;

pub use stream::{spawn_capture_stream, CaptureStream};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::assembly::{ChannelTable, Progress};
use crate::config::{configure_camera, quiesce_camera, CameraConfigurator, CaptureConfig};
use crate::error::{CaptureError, SetupError};
use crate::frame::{CapturedFrame, ChannelId, FrameGeometry};
use crate::transport::BusTransport;

/// One configured camera bound to a channel (software capture path).
///
/// Created by [`setup_capture`]; destroyed by [`CaptureSession::release`].
#[derive(Debug, Clone)]
pub struct CaptureSession {
    config: CaptureConfig,
    geometry: FrameGeometry,
}

impl CaptureSession {
    /// The isochronous channel this session captures from.
    pub fn channel(&self) -> ChannelId {
        self.config.channel
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Frame geometry derived at setup, immutable for the session.
    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    /// Quiesce the camera and discard the session.
    ///
    /// Quiesce failures are logged and otherwise ignored so teardown always
    /// completes.
    pub fn release<C>(self, camera: &mut C)
    where
        C: CameraConfigurator + ?Sized,
    {
        quiesce_camera(camera);
        debug!(channel = %self.config.channel, "capture session released");
    }
}

/// Configure `camera` and build a software-path capture session.
///
/// Runs the device configuration steps in order and derives the immutable
/// frame geometry; the first failing step aborts setup and is identified in
/// the returned error.
pub fn setup_capture<C>(camera: &mut C, config: CaptureConfig) -> Result<CaptureSession, SetupError>
where
    C: CameraConfigurator + ?Sized,
{
    let geometry = configure_camera(camera, &config)?;
    info!(
        channel = %config.channel,
        width = geometry.width,
        height = geometry.height,
        packets = geometry.packets_per_frame(),
        "capture session ready"
    );
    Ok(CaptureSession { config, geometry })
}

/// Knobs for a capture call.
#[derive(Clone, Default)]
pub struct CaptureOptions {
    /// Cooperative cancellation flag, checked between event-processing
    /// steps.
    pub cancel: Option<Arc<AtomicBool>>,
    /// Stray packets tolerated on a channel before it is declared
    /// desynchronized. Defaults to two frame intervals.
    pub watchdog_packets: Option<u64>,
}

impl CaptureOptions {
    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// Capture exactly one frame from each of `sessions`.
///
/// Binds every session's channel into `table`, registers the reassembly
/// handler and starts reception per channel, then drives bus event
/// processing until every channel holds a complete frame. Any registration
/// or start failure rolls the earlier sessions back in reverse order and
/// fails the whole call; no partial success is returned. Teardown (stop +
/// deregister) runs whatever the outcome.
pub fn capture_frames<B>(
    bus: &mut B,
    table: &ChannelTable,
    sessions: &[CaptureSession],
    options: &CaptureOptions,
) -> Result<Vec<CapturedFrame>, CaptureError>
where
    B: BusTransport + ?Sized,
{
    if sessions.is_empty() {
        return Ok(Vec::new());
    }

    let mut bound = 0usize;
    for session in sessions {
        let limit = options
            .watchdog_packets
            .unwrap_or_else(|| default_watchdog(session.geometry()));
        if let Err(err) = table.bind(session.channel(), session.geometry().frame_bytes(), limit) {
            unbind_all(table, &sessions[..bound]);
            return Err(err);
        }
        bound += 1;
    }
    table.set_awaiting(sessions.len());

    for (started, session) in sessions.iter().enumerate() {
        let channel = session.channel();
        if let Err(source) = bus.register_handler(channel, table.handler()) {
            teardown(bus, &sessions[..started]);
            unbind_all(table, sessions);
            return Err(CaptureError::Transport { channel, source });
        }
        if let Err(source) = bus.start_reception(channel) {
            if let Err(err) = bus.unregister_handler(channel) {
                warn!(%channel, %err, "failed to unregister handler during rollback");
            }
            teardown(bus, &sessions[..started]);
            unbind_all(table, sessions);
            return Err(CaptureError::Transport { channel, source });
        }
    }

    let mut outcome = Ok(());
    loop {
        if options.cancelled() {
            outcome = Err(CaptureError::Cancelled);
            break;
        }
        if let Some(channel) = table.desynced_channel() {
            outcome = Err(CaptureError::Desynchronized(channel));
            break;
        }
        if table.awaiting() == 0 {
            break;
        }
        if let Err(source) = bus.iterate() {
            outcome = Err(CaptureError::Iterate(source));
            break;
        }
    }

    teardown(bus, sessions);

    match outcome {
        Ok(()) => collect_frames(table, sessions),
        Err(err) => {
            unbind_all(table, sessions);
            Err(err)
        }
    }
}

/// Capture a single frame from one camera.
///
/// Equivalent to [`capture_frames`] with a one-session slice.
pub fn capture_frame<B>(
    bus: &mut B,
    table: &ChannelTable,
    session: &CaptureSession,
    options: &CaptureOptions,
) -> Result<CapturedFrame, CaptureError>
where
    B: BusTransport + ?Sized,
{
    let mut frames = capture_frames(bus, table, std::slice::from_ref(session), options)?;
    frames
        .pop()
        .ok_or(CaptureError::Desynchronized(session.channel()))
}

/// Stop reception and deregister handlers, newest first. Failures are
/// logged; teardown never aborts early.
fn teardown<B>(bus: &mut B, sessions: &[CaptureSession])
where
    B: BusTransport + ?Sized,
{
    for session in sessions.iter().rev() {
        let channel = session.channel();
        if let Err(err) = bus.stop_reception(channel) {
            warn!(%channel, %err, "failed to stop reception");
        }
        if let Err(err) = bus.unregister_handler(channel) {
            warn!(%channel, %err, "failed to unregister handler");
        }
    }
}

fn unbind_all(table: &ChannelTable, sessions: &[CaptureSession]) {
    for session in sessions {
        let _ = table.unbind(session.channel());
    }
}

fn collect_frames(
    table: &ChannelTable,
    sessions: &[CaptureSession],
) -> Result<Vec<CapturedFrame>, CaptureError> {
    let mut frames = Vec::with_capacity(sessions.len());
    let mut failed = None;
    for session in sessions {
        let channel = session.channel();
        match table.unbind(channel) {
            Some((buffer, Progress::Complete)) if failed.is_none() => {
                frames.push(CapturedFrame {
                    channel,
                    width: session.geometry().width,
                    height: session.geometry().height,
                    data: Bytes::from(buffer),
                });
            }
            _ => {
                failed.get_or_insert(channel);
            }
        }
    }
    match failed {
        None => Ok(frames),
        Some(channel) => Err(CaptureError::Desynchronized(channel)),
    }
}

fn default_watchdog(geometry: &FrameGeometry) -> u64 {
    u64::from(geometry.packets_per_frame()) * 2 + 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FrameRate, TransferSpeed, VideoFormat, VideoMode};
    use crate::frame::RegionOfInterest;
    use crate::sim::{BusEvent, SimBus, SimCamera, SimStep};

    fn chan(n: u8) -> ChannelId {
        ChannelId::new(n).unwrap()
    }

    fn scalable(channel: u8, width: u32, height: u32) -> CaptureConfig {
        CaptureConfig::new(
            chan(channel),
            VideoFormat::Scalable,
            VideoMode(0),
            FrameRate::Fps15,
            TransferSpeed::S400,
        )
        .with_region(RegionOfInterest {
            left: 0,
            top: 0,
            width,
            height,
        })
    }

    fn session(channel: u8, width: u32, height: u32) -> CaptureSession {
        let mut camera = SimCamera::new();
        setup_capture(&mut camera, scalable(channel, width, height)).unwrap()
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
    }

    #[test]
    fn setup_reports_the_first_failing_step() {
        let mut camera = SimCamera::failing(SimStep::Mode);
        let err = setup_capture(&mut camera, scalable(1, 64, 8)).unwrap_err();
        assert!(matches!(err, SetupError::Mode(_)));
        assert_eq!(
            camera.steps(),
            &[SimStep::Initialize, SimStep::Format, SimStep::Mode]
        );
    }

    #[test]
    fn region_requires_a_scalable_format() {
        let mut camera = SimCamera::new();
        let config = CaptureConfig::new(
            chan(1),
            VideoFormat::Vga,
            VideoMode(2),
            FrameRate::Fps15,
            TransferSpeed::S400,
        )
        .with_region(RegionOfInterest {
            left: 0,
            top: 0,
            width: 64,
            height: 8,
        });
        let err = setup_capture(&mut camera, config).unwrap_err();
        assert!(matches!(err, SetupError::BadGeometry(_)));
    }

    #[test]
    fn scalable_region_drives_geometry() {
        let session = session(2, 200, 100);
        assert_eq!(session.geometry().frame_bytes(), 20_000);
        assert_eq!(session.geometry().packets_per_frame(), 40);
    }

    #[test]
    fn captures_one_frame_per_camera() {
        let sessions = [session(4, 64, 16), session(11, 64, 16)];
        let frame_a = pattern(1024, 1);
        let frame_b = pattern(1024, 77);

        let mut bus = SimBus::new();
        for i in 0..2 {
            let start = i == 0;
            bus.push_packet(chan(4), start, &frame_a[i * 512..(i + 1) * 512]);
            bus.push_packet(chan(11), start, &frame_b[i * 512..(i + 1) * 512]);
        }

        let table = ChannelTable::new();
        let frames =
            capture_frames(&mut bus, &table, &sessions, &CaptureOptions::default()).unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].channel, chan(4));
        assert_eq!(frames[0].data, frame_a);
        assert_eq!(frames[1].channel, chan(11));
        assert_eq!(frames[1].data, frame_b);
        assert_eq!(frames[0].width, 64);
        assert_eq!(frames[0].height, 16);

        assert!(bus.is_quiet());
        assert_eq!(table.progress(chan(4)), None);
        assert_eq!(table.progress(chan(11)), None);
    }

    #[test]
    fn registration_failure_rolls_back_in_reverse() {
        let sessions = [
            session(1, 64, 8),
            session(2, 64, 8),
            session(3, 64, 8),
            session(4, 64, 8),
        ];
        let mut bus = SimBus::new();
        bus.fail_register_on(chan(3));

        let table = ChannelTable::new();
        let err =
            capture_frames(&mut bus, &table, &sessions, &CaptureOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::Transport { channel, .. } if channel == chan(3)
        ));

        assert_eq!(
            bus.events(),
            &[
                BusEvent::Register(chan(1)),
                BusEvent::Start(chan(1)),
                BusEvent::Register(chan(2)),
                BusEvent::Start(chan(2)),
                BusEvent::Stop(chan(2)),
                BusEvent::Unregister(chan(2)),
                BusEvent::Stop(chan(1)),
                BusEvent::Unregister(chan(1)),
            ]
        );
        assert!(bus.is_quiet());
        for n in 1..=4 {
            assert_eq!(table.progress(chan(n)), None);
        }
    }

    #[test]
    fn start_failure_unregisters_its_own_handler() {
        let sessions = [session(1, 64, 8), session(2, 64, 8)];
        let mut bus = SimBus::new();
        bus.fail_start_on(chan(2));

        let table = ChannelTable::new();
        let err =
            capture_frames(&mut bus, &table, &sessions, &CaptureOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::Transport { channel, .. } if channel == chan(2)
        ));

        assert_eq!(
            bus.events(),
            &[
                BusEvent::Register(chan(1)),
                BusEvent::Start(chan(1)),
                BusEvent::Register(chan(2)),
                BusEvent::Unregister(chan(2)),
                BusEvent::Stop(chan(1)),
                BusEvent::Unregister(chan(1)),
            ]
        );
        assert!(bus.is_quiet());
    }

    #[test]
    fn duplicate_channels_are_rejected() {
        let sessions = [session(6, 64, 8), session(6, 64, 8)];
        let mut bus = SimBus::new();
        let table = ChannelTable::new();

        let err =
            capture_frames(&mut bus, &table, &sessions, &CaptureOptions::default()).unwrap_err();
        assert_eq!(err, CaptureError::ChannelInUse(chan(6)));
        assert!(bus.events().is_empty());
        assert_eq!(table.progress(chan(6)), None);
    }

    #[test]
    fn cancellation_stops_the_loop() {
        let sessions = [session(5, 64, 8)];
        let mut bus = SimBus::new();
        bus.push_frame(chan(5), &pattern(512, 0), 512);

        let cancel = Arc::new(AtomicBool::new(true));
        let options = CaptureOptions {
            cancel: Some(cancel),
            ..CaptureOptions::default()
        };

        let table = ChannelTable::new();
        let err = capture_frames(&mut bus, &table, &sessions, &options).unwrap_err();
        assert_eq!(err, CaptureError::Cancelled);
        assert!(bus.is_quiet());
        assert_eq!(table.progress(chan(5)), None);
    }

    #[test]
    fn silent_channel_trips_the_watchdog() {
        let sessions = [session(6, 64, 8)];
        let mut bus = SimBus::new();
        for _ in 0..10 {
            bus.push_packet(chan(6), false, &[0; 512]);
        }

        let options = CaptureOptions {
            watchdog_packets: Some(4),
            ..CaptureOptions::default()
        };
        let table = ChannelTable::new();
        let err = capture_frames(&mut bus, &table, &sessions, &options).unwrap_err();
        assert_eq!(err, CaptureError::Desynchronized(chan(6)));
        assert!(bus.is_quiet());
        assert_eq!(table.progress(chan(6)), None);
    }

    #[test]
    fn empty_session_list_is_a_noop() {
        let mut bus = SimBus::new();
        let table = ChannelTable::new();
        let frames =
            capture_frames(&mut bus, &table, &[], &CaptureOptions::default()).unwrap();
        assert!(frames.is_empty());
        assert!(bus.events().is_empty());
    }

    #[test]
    fn a_channel_can_be_captured_again() {
        let session = session(8, 64, 8);
        let table = ChannelTable::new();
        let mut bus = SimBus::new();

        bus.push_frame(chan(8), &pattern(512, 1), 512);
        let first =
            capture_frame(&mut bus, &table, &session, &CaptureOptions::default()).unwrap();
        assert_eq!(first.data, pattern(512, 1));

        bus.push_frame(chan(8), &pattern(512, 2), 512);
        let second =
            capture_frame(&mut bus, &table, &session, &CaptureOptions::default()).unwrap();
        assert_eq!(second.data, pattern(512, 2));
        assert!(bus.is_quiet());
    }

    #[test]
    fn camera_packet_size_is_respected() {
        let mut camera = SimCamera::new().with_packet_quadlets(64);
        let session = setup_capture(&mut camera, scalable(7, 64, 8)).unwrap();
        assert_eq!(session.geometry().packet_bytes(), 256);
        assert_eq!(session.geometry().packets_per_frame(), 2);

        let frame = pattern(512, 5);
        let mut bus = SimBus::new();
        bus.push_frame(chan(7), &frame, 256);

        let table = ChannelTable::new();
        let captured =
            capture_frame(&mut bus, &table, &session, &CaptureOptions::default()).unwrap();
        assert_eq!(captured.data, frame);
    }

    #[test]
    fn release_quiesces_the_camera() {
        let mut camera = SimCamera::new();
        let session = setup_capture(&mut camera, scalable(9, 64, 8)).unwrap();
        session.release(&mut camera);
        assert_eq!(camera.quiesce_count(), 1);
    }

    #[test]
    fn release_survives_a_failing_quiesce() {
        let mut camera = SimCamera::failing(SimStep::Quiesce);
        let session = setup_capture(&mut camera, scalable(10, 64, 8)).unwrap();
        session.release(&mut camera);
        assert_eq!(camera.quiesce_count(), 1);
    }
}
