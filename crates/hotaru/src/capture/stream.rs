//! Background capture worker delivering frames over a channel.
//!
//! Runs the blocking multi-camera capture loop on a blocking-thread task
//! and hands completed frames to async consumers through a bounded queue,
//! decoupling capture cadence from consumer cadence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::assembly::ChannelTable;
use crate::capture::{capture_frames, CaptureOptions, CaptureSession};
use crate::error::CaptureError;
use crate::frame::CapturedFrame;
use crate::transport::BusTransport;

/// Receiving end of a background capture worker.
///
/// Dropping the stream asks the worker to stop at its next cancellation
/// check.
pub struct CaptureStream {
    rx: mpsc::Receiver<CapturedFrame>,
    stop: Arc<AtomicBool>,
}

impl CaptureStream {
    /// Next completed frame, or `None` once the worker has stopped.
    pub async fn recv(&mut self) -> Option<CapturedFrame> {
        self.rx.recv().await
    }

    /// Ask the worker to stop after the capture round in progress.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a worker that captures frames from `sessions` in a loop and
/// delivers them over a queue holding up to `queue_depth` frames.
///
/// The stop flag doubles as the capture cancellation signal, so a capture
/// round stuck waiting on a silent bus is aborted rather than leaked. Must
/// be called from within a Tokio runtime.
pub fn spawn_capture_stream<B>(
    mut bus: B,
    table: ChannelTable,
    sessions: Vec<CaptureSession>,
    queue_depth: usize,
) -> CaptureStream
where
    B: BusTransport + Send + 'static,
{
    let (tx, rx) = mpsc::channel(queue_depth.max(1));
    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = Arc::clone(&stop);

    tokio::task::spawn_blocking(move || {
        let options = CaptureOptions {
            cancel: Some(Arc::clone(&worker_stop)),
            ..CaptureOptions::default()
        };
        info!(cameras = sessions.len(), "capture worker started");
        let mut delivered = 0u64;
        'outer: while !worker_stop.load(Ordering::Relaxed) {
            match capture_frames(&mut bus, &table, &sessions, &options) {
                Ok(frames) => {
                    for frame in frames {
                        if tx.blocking_send(frame).is_err() {
                            info!("frame receiver dropped, stopping capture worker");
                            break 'outer;
                        }
                        delivered += 1;
                    }
                }
                Err(CaptureError::Cancelled) => break,
                Err(err) => {
                    error!(%err, "capture worker stopping on error");
                    break;
                }
            }
        }
        info!(frames = delivered, "capture worker finished");
    });

    CaptureStream { rx, stop }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capture::setup_capture;
    use crate::config::{CaptureConfig, FrameRate, TransferSpeed, VideoFormat, VideoMode};
    use crate::frame::{ChannelId, RegionOfInterest};
    use crate::sim::{SimBus, SimCamera};

    fn session(channel: u8) -> CaptureSession {
        let mut camera = SimCamera::new();
        let config = CaptureConfig::new(
            ChannelId::new(channel).unwrap(),
            VideoFormat::Scalable,
            VideoMode(0),
            FrameRate::Fps30,
            TransferSpeed::S400,
        )
        .with_region(RegionOfInterest {
            left: 0,
            top: 0,
            width: 64,
            height: 8,
        });
        setup_capture(&mut camera, config).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delivers_scripted_frames_in_order() {
        let session = session(7);
        let channel = session.channel();
        let mut bus = SimBus::new();
        for tag in 0..3u8 {
            bus.push_frame(channel, &vec![tag; 512], 512);
        }

        let mut stream = spawn_capture_stream(bus, ChannelTable::new(), vec![session], 4);
        for tag in 0..3u8 {
            let frame = stream.recv().await.expect("frame");
            assert_eq!(frame.channel, channel);
            assert_eq!(frame.data[0], tag);
        }

        // Script exhausted: the worker reports the bus error and stops.
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_ends_the_worker() {
        let session = session(9);
        let channel = session.channel();
        let mut bus = SimBus::new();
        for tag in 0..50u8 {
            bus.push_frame(channel, &vec![tag; 512], 512);
        }

        let mut stream = spawn_capture_stream(bus, ChannelTable::new(), vec![session], 2);
        assert!(stream.recv().await.is_some());
        stream.stop();

        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            while stream.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "worker should stop after the flag is set");
    }
}
