//! The per-frame processing loop: the single consumer of the frame bus.
//! Dispatches a frame to its camera's tracker, runs throttled OCR with
//! fusion on confirmed tracks, feeds tracks through the entry/exit FSM,
//! and enqueues emitted events to the durable writer.
//!
//! Grounded in `main.py`'s `ANPRPipeline._processing_loop`/`_process_frame`:
//! same stage order (detect → track → OCR → FSM), same periodic-cleanup
//! cadence (every 1000 processed frames).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opencv::core::Mat;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::detector::VehicleDetector;
use crate::frame_bus::FrameBusReceiver;
use crate::fsm::EventEngine;
use crate::ocr::{fuse_readings, OcrEngine};
use crate::stats::StatsRegistry;
use crate::tracker::Tracker;
use crate::types::TrackState;
use crate::writer::{PlateRecord, TrackRecord, WriterHandle};

const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const PERIODIC_CLEANUP_INTERVAL: u64 = 1000;

struct CameraPipeline {
    tracker: Tracker,
    ocr: OcrEngine,
    events: EventEngine,
    frame_height: u32,
}

/// Owns all per-camera state (trackers, OCR engines, FSMs). Single-writer:
/// the processor thread is the only mutator.
pub struct Processor<D: VehicleDetector> {
    detector: D,
    cameras: HashMap<i64, CameraPipeline>,
    rx: FrameBusReceiver,
    writer: WriterHandle,
    stats: Arc<StatsRegistry>,
    stop: Arc<AtomicBool>,
    processed_frames: u64,
}

impl<D: VehicleDetector> Processor<D> {
    pub fn new(
        cfg: &AppConfig,
        detector: D,
        rx: FrameBusReceiver,
        writer: WriterHandle,
        stats: Arc<StatsRegistry>,
        stop: Arc<AtomicBool>,
        ocr_oracle: Arc<dyn crate::ocr::OcrOracle>,
    ) -> Self {
        let mut cameras = HashMap::new();
        for camera in &cfg.cameras {
            if !camera.enabled {
                continue;
            }
            cameras.insert(
                camera.id,
                CameraPipeline {
                    tracker: Tracker::new(camera.id, cfg.tracking.clone()),
                    ocr: OcrEngine::new(cfg.ocr.clone(), ocr_oracle.clone()),
                    events: EventEngine::new(camera.id, cfg.events.clone()),
                    frame_height: camera.height,
                },
            );
        }

        Self { detector, cameras, rx, writer, stats, stop, processed_frames: 0 }
    }

    /// Main loop: block on the frame bus with a short timeout so shutdown
    /// remains responsive, process one frame per wake, run periodic
    /// dedup-cache cleanup every `PERIODIC_CLEANUP_INTERVAL` frames.
    pub fn run(mut self) {
        info!("processor loop started");
        while !self.stop.load(Ordering::Relaxed) {
            let frame = match self.rx.recv_timeout(RECV_TIMEOUT) {
                Some(f) => f,
                None => continue,
            };

            self.process_frame(frame.camera_id, &frame.image);
            self.processed_frames += 1;

            if self.processed_frames % PERIODIC_CLEANUP_INTERVAL == 0 {
                self.periodic_cleanup();
            }
        }
        info!("processor loop stopped");
    }

    fn process_frame(&mut self, camera_id: i64, image: &Mat) {
        let pipeline = match self.cameras.get_mut(&camera_id) {
            Some(p) => p,
            None => return,
        };

        // Always runs the tracker, even with zero detections, so aging and
        // deletion of existing tracks proceeds on empty frames too.
        let detections = self.detector.detect(image);
        let tracks = pipeline.tracker.update(&detections);
        let fusion_min_samples = pipeline.ocr.fusion_min_samples();

        // OCR pass: throttled recognition + fusion, mutating live track state.
        for track in &tracks {
            if track.state != TrackState::Confirmed || track.plate_locked {
                continue;
            }

            let reading = pipeline.ocr.recognize_plate(image, track.bbox, track.track_id);
            let Some((text, confidence)) = reading else { continue };

            if let Some(live) = pipeline.tracker.track_mut(track.track_id) {
                live.add_plate_reading(text, confidence, chrono::Utc::now());

                if live.plate_readings.len() >= fusion_min_samples {
                    let readings: Vec<(String, f32)> =
                        live.plate_readings.iter().map(|r| (r.text.clone(), r.confidence)).collect();
                    if let Some((fused_text, fused_conf, group_size)) = fuse_readings(&readings, fusion_min_samples) {
                        if group_size >= fusion_min_samples {
                            let num_readings = live.plate_readings.len();
                            live.finalize_plate(fused_text.clone(), fused_conf);
                            self.writer.insert_plate(PlateRecord {
                                camera_id,
                                track_id: track.track_id,
                                plate_text: fused_text,
                                confidence: fused_conf,
                                num_readings,
                                locked: true,
                                finalized_at: chrono::Utc::now(),
                            });
                        }
                    }
                }
            }
        }

        // FSM pass: re-read the live (possibly OCR-updated) track, mutate
        // its position state in place, queue any emitted event.
        for track in &tracks {
            let Some(live) = pipeline.tracker.track_mut(track.track_id) else { continue };
            let mut live_track = live.clone();
            let event = pipeline.events.process_track(&mut live_track, pipeline.frame_height);
            if let Some(live) = pipeline.tracker.track_mut(track.track_id) {
                live.vehicle_state = live_track.vehicle_state;
            }

            if let Some(event) = event {
                self.stats.total_entries.fetch_add(
                    matches!(event.event_type, crate::types::EventKind::Entry) as u64,
                    Ordering::Relaxed,
                );
                self.stats.total_exits.fetch_add(
                    matches!(event.event_type, crate::types::EventKind::Exit) as u64,
                    Ordering::Relaxed,
                );
                self.writer.insert_event(event);
                self.writer.insert_track(TrackRecord::from_track(&live_track));
            }
        }
    }

    fn periodic_cleanup(&mut self) {
        debug!("periodic cleanup at {} processed frames", self.processed_frames);
        let (mut calls, mut successful, mut failed) = (0u64, 0u64, 0u64);
        for pipeline in self.cameras.values_mut() {
            pipeline.events.cleanup_old_entries();
            calls += pipeline.ocr.total_calls;
            successful += pipeline.ocr.successful;
            failed += pipeline.ocr.failed;
        }
        self.stats.ocr_calls.store(calls, Ordering::Relaxed);
        self.stats.ocr_successful.store(successful, Ordering::Relaxed);
        self.stats.ocr_failed.store(failed, Ordering::Relaxed);
    }
}
