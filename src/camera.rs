//! Camera acquisition: one dedicated worker per enabled camera, auto-
//! reconnect with exponential backoff, drop-on-full publish to the frame
//! bus, FPS pacing via an interruptible wait.
//!
//! Backoff and connect/disconnect semantics follow `min(2^attempts, 60)`;
//! `VideoCapture` is opened over the FFmpeg backend for network sources,
//! with `CAP_PROP_BUFFERSIZE=1` to minimize latency on direct sources.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};
use tracing::{error, info, warn};

use crate::config::CameraConfig;
use crate::frame_bus::{Frame, FrameBusSender};

const MAX_RECONNECT_DELAY_SECS: u64 = 60;

/// Level-change lifecycle notifications, emitted exactly on transition.
#[derive(Debug, Clone)]
pub enum CameraEvent {
    Connected { camera_id: i64, width: i32, height: i32 },
    Disconnected { camera_id: i64 },
}

pub trait CameraEventSink: Send + Sync {
    fn on_event(&self, event: CameraEvent);
}

/// A no-op sink for tests and headless runs where lifecycle notification
/// has no external collaborator to deliver to.
pub struct NullEventSink;

impl CameraEventSink for NullEventSink {
    fn on_event(&self, _event: CameraEvent) {}
}

#[derive(Default)]
pub struct CameraStats {
    pub frames_captured: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    connected: AtomicBool,
}

impl CameraStats {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Resolve a configured source string into an OpenCV-openable descriptor.
/// All-digits → device index; `rtsp://`/`http://` → network stream (opened
/// via the FFmpeg backend); anything else → file path.
enum Source {
    Device(i32),
    Network(String),
    File(String),
}

fn classify_source(source: &str) -> Source {
    if !source.is_empty() && source.chars().all(|c| c.is_ascii_digit()) {
        Source::Device(source.parse().unwrap_or(0))
    } else if source.starts_with("rtsp://") || source.starts_with("http://") {
        Source::Network(source.to_string())
    } else {
        Source::File(source.to_string())
    }
}

/// One camera's acquisition worker. Runs `run` on a dedicated thread;
/// `stop` is the process-wide shutdown flag, shared and monotonic.
pub struct CameraStream {
    cfg: CameraConfig,
    sender: FrameBusSender,
    sink: Arc<dyn CameraEventSink>,
    stop: Arc<AtomicBool>,
    stats: Arc<CameraStats>,
}

impl CameraStream {
    pub fn new(
        cfg: CameraConfig,
        sender: FrameBusSender,
        sink: Arc<dyn CameraEventSink>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self { cfg, sender, sink, stop, stats: Arc::new(CameraStats::default()) }
    }

    pub fn stats(&self) -> Arc<CameraStats> {
        self.stats.clone()
    }

    fn connect(&self) -> Option<VideoCapture> {
        let source = classify_source(&self.cfg.source);
        let is_network = matches!(source, Source::Network(_));

        let opened = match source {
            Source::Device(idx) => VideoCapture::new(idx, videoio::CAP_ANY),
            Source::Network(url) => VideoCapture::from_file(&url, videoio::CAP_FFMPEG),
            Source::File(path) => VideoCapture::from_file(&path, videoio::CAP_ANY),
        };

        let mut cap = match opened {
            Ok(cap) => cap,
            Err(e) => {
                error!("camera {}: open error: {e}", self.cfg.id);
                return None;
            }
        };

        match cap.is_opened() {
            Ok(true) => {}
            _ => {
                warn!("camera {}: failed to open source {:?}", self.cfg.id, self.cfg.source);
                return None;
            }
        }

        // For non-network sources, request resolution/framerate and a
        // minimal driver buffer to reduce latency.
        if !is_network {
            let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, self.cfg.width as f64);
            let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, self.cfg.height as f64);
            let _ = cap.set(videoio::CAP_PROP_FPS, self.cfg.fps as f64);
            let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);
        }

        // Probe read.
        let mut frame = Mat::default();
        match cap.read(&mut frame) {
            Ok(true) if !frame.empty() => Some(cap),
            _ => {
                warn!("camera {}: probe read failed", self.cfg.id);
                None
            }
        }
    }

    fn interruptible_wait(&self, dur: Duration) {
        let step = Duration::from_millis(100);
        let mut remaining = dur;
        while remaining > Duration::ZERO && !self.stop.load(Ordering::Relaxed) {
            let slice = step.min(remaining);
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
    }

    /// Main acquisition loop: connect, capture-and-publish, reconnect on
    /// failure with exponential backoff. Returns once the stop flag is
    /// observed.
    pub fn run(&self) {
        info!("camera {} capture loop starting", self.cfg.id);
        let mut cap: Option<VideoCapture> = None;
        let mut reconnect_attempts: u32 = 0;
        let mut sequence: u64 = 0;

        while !self.stop.load(Ordering::Relaxed) {
            if cap.is_none() {
                match self.connect() {
                    Some(c) => {
                        cap = Some(c);
                        reconnect_attempts = 0;
                        self.stats.connected.store(true, Ordering::Relaxed);
                        let (w, h) = cap
                            .as_ref()
                            .map(|c| {
                                (
                                    c.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as i32,
                                    c.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as i32,
                                )
                            })
                            .unwrap_or((0, 0));
                        self.sink.on_event(CameraEvent::Connected { camera_id: self.cfg.id, width: w, height: h });
                        continue;
                    }
                    None => {
                        let delay = Duration::from_secs(
                            2u64.saturating_pow(reconnect_attempts).min(MAX_RECONNECT_DELAY_SECS),
                        );
                        warn!(
                            "camera {} reconnect in {:?} (attempt {})",
                            self.cfg.id,
                            delay,
                            reconnect_attempts + 1
                        );
                        self.stats.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
                        reconnect_attempts += 1;
                        self.interruptible_wait(delay);
                        continue;
                    }
                }
            }

            let video = cap.as_mut().unwrap();
            let mut frame = Mat::default();
            let read_ok = video.read(&mut frame).unwrap_or(false);

            if !read_ok || frame.empty() {
                warn!("camera {} frame read failed", self.cfg.id);
                let _ = video.release();
                cap = None;
                self.stats.connected.store(false, Ordering::Relaxed);
                self.sink.on_event(CameraEvent::Disconnected { camera_id: self.cfg.id });
                continue;
            }

            let envelope = Frame { camera_id: self.cfg.id, image: frame, capture_time: Utc::now(), sequence };
            sequence += 1;
            self.stats.frames_captured.fetch_add(1, Ordering::Relaxed);

            if !self.sender.publish(envelope) {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }

            if self.cfg.fps > 0 {
                self.interruptible_wait(Duration::from_secs_f64(1.0 / self.cfg.fps as f64));
            }
        }

        if let Some(mut c) = cap.take() {
            let _ = c.release();
        }
        info!("camera {} capture loop stopped", self.cfg.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_source_by_prefix() {
        assert!(matches!(classify_source("0"), Source::Device(0)));
        assert!(matches!(classify_source("2"), Source::Device(2)));
        assert!(matches!(classify_source("rtsp://cam/1"), Source::Network(_)));
        assert!(matches!(classify_source("http://cam/1"), Source::Network(_)));
        assert!(matches!(classify_source("/videos/clip.mp4"), Source::File(_)));
    }

    #[test]
    fn reconnect_backoff_sequence() {
        let delays: Vec<u64> = (0..6).map(|a| 2u64.saturating_pow(a).min(MAX_RECONNECT_DELAY_SECS)).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32]);
        let capped = 2u64.saturating_pow(10).min(MAX_RECONNECT_DELAY_SECS);
        assert_eq!(capped, MAX_RECONNECT_DELAY_SECS);
    }
}
