//! Entry/exit finite-state machine: per-camera position-state transitions
//! producing durable entry/exit events with plate-based deduplication.
//!
//! Grounded in `events/engine.py`'s `EventEngine`. The dedup cache applies
//! identically to entries and exits, which can suppress a legitimate exit
//! shortly after an entry — preserved from the original as a noted open
//! question, not resolved away.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::config::EventConfig;
use crate::types::{bbox_center_y, DurableEvent, EventKind, EventMetadata, Track, VehicleState};

pub struct EventEngine {
    camera_id: i64,
    cfg: EventConfig,
    recent_plates: HashMap<String, DateTime<Utc>>,
    pub total_entries: u64,
    pub total_exits: u64,
}

impl EventEngine {
    pub fn new(camera_id: i64, cfg: EventConfig) -> Self {
        Self { camera_id, cfg, recent_plates: HashMap::new(), total_entries: 0, total_exits: 0 }
    }

    /// Process one track for one frame. Mutates `track.vehicle_state` in
    /// place; returns an event if one was emitted this step.
    pub fn process_track(&mut self, track: &mut Track, frame_height: u32) -> Option<DurableEvent> {
        let ny = if frame_height > 0 {
            bbox_center_y(track.bbox) / frame_height as f32
        } else {
            0.0
        };

        let current = track.vehicle_state;
        let mut new_state = current;
        let mut event = None;

        match current {
            VehicleState::Outside => {
                if ny > self.cfg.entry_y_threshold {
                    new_state = VehicleState::Approaching;
                }
            }
            VehicleState::Approaching => {
                let dwell = (Utc::now() - track.first_seen).num_milliseconds() as f64 / 1000.0;
                if dwell >= self.cfg.min_dwell_time {
                    let plate_ready = track.plate_locked;
                    if self.cfg.require_plate_for_entry && !plate_ready {
                        // awaiting plate; state does not advance
                    } else if !self.is_duplicate(track) {
                        event = Some(self.create_entry_event(track));
                        new_state = VehicleState::Inside;
                        self.total_entries += 1;
                    }
                }
            }
            VehicleState::Inside => {
                if ny > self.cfg.exit_y_threshold {
                    new_state = VehicleState::Exiting;
                }
            }
            VehicleState::Exiting => {
                if track.time_since_update > 5 {
                    let plate_ready = track.plate_locked;
                    if self.cfg.require_plate_for_exit && !plate_ready {
                        // awaiting plate; state does not advance
                    } else if !self.is_duplicate(track) {
                        event = Some(self.create_exit_event(track));
                        new_state = VehicleState::Logged;
                        self.total_exits += 1;
                    }
                }
            }
            VehicleState::Logged => {}
        }

        // Position state changes are applied last, regardless of whether
        // an event was emitted this step.
        track.vehicle_state = new_state;

        event
    }

    fn is_duplicate(&self, track: &Track) -> bool {
        let Some(plate) = &track.plate_text else {
            return false;
        };
        match self.recent_plates.get(plate) {
            Some(last) => {
                let elapsed = (Utc::now() - *last).num_milliseconds() as f64 / 1000.0;
                elapsed < self.cfg.dedup_window as f64
            }
            None => false,
        }
    }

    fn create_entry_event(&mut self, track: &Track) -> DurableEvent {
        let now = Utc::now();
        let event = DurableEvent {
            event_type: EventKind::Entry,
            camera_id: self.camera_id,
            track_id: track.track_id,
            vehicle_type: track.vehicle_type.as_str(),
            plate_text: track.plate_text.clone(),
            plate_confidence: track.plate_confidence,
            timestamp: now,
            entry_time: None,
            exit_time: None,
            duration: None,
            confidence: track.confidence,
            metadata: EventMetadata { color: track.color.clone(), bbox: track.bbox },
        };
        if let Some(plate) = &track.plate_text {
            self.recent_plates.insert(plate.clone(), now);
        }
        event
    }

    fn create_exit_event(&mut self, track: &Track) -> DurableEvent {
        let entry_time = track.first_seen;
        let exit_time = Utc::now();
        let duration = (exit_time - entry_time).num_milliseconds() as f64 / 1000.0;

        let event = DurableEvent {
            event_type: EventKind::Exit,
            camera_id: self.camera_id,
            track_id: track.track_id,
            vehicle_type: track.vehicle_type.as_str(),
            plate_text: track.plate_text.clone(),
            plate_confidence: track.plate_confidence,
            timestamp: exit_time,
            entry_time: Some(entry_time),
            exit_time: Some(exit_time),
            duration: Some(duration),
            confidence: track.confidence,
            metadata: EventMetadata { color: track.color.clone(), bbox: track.bbox },
        };
        if let Some(plate) = &track.plate_text {
            self.recent_plates.insert(plate.clone(), exit_time);
        }
        event
    }

    /// Drop dedup cache entries older than `2 × dedup_window`. Called
    /// periodically by the processor, not on every frame.
    pub fn cleanup_old_entries(&mut self) {
        let cutoff_secs = self.cfg.dedup_window * 2;
        let now = Utc::now();
        self.recent_plates.retain(|_, ts| (now - *ts).num_seconds() < cutoff_secs);
    }

    pub fn stats(&self) -> EventEngineStats {
        EventEngineStats {
            camera_id: self.camera_id,
            total_entries: self.total_entries,
            total_exits: self.total_exits,
            cached_plates: self.recent_plates.len(),
        }
    }
}

pub struct EventEngineStats {
    pub camera_id: i64,
    pub total_entries: u64,
    pub total_exits: u64,
    pub cached_plates: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Detection, VehicleType};

    fn make_track(camera_id: i64, track_id: u64, ny: f32, frame_h: u32) -> Track {
        let y = ny * frame_h as f32;
        let det = Detection { bbox: [0.0, y - 5.0, 10.0, y + 5.0], confidence: 0.9, class: VehicleType::Car };
        let mut t = Track::new(track_id, camera_id, &det, Utc::now());
        t.first_seen = Utc::now() - chrono::Duration::seconds(5);
        t
    }

    #[test]
    fn outside_to_approaching_no_event() {
        let mut engine = EventEngine::new(1, EventConfig { require_plate_for_entry: false, ..EventConfig::default() });
        let mut track = make_track(1, 1, 0.7, 100);
        let event = engine.process_track(&mut track, 100);
        assert!(event.is_none());
        assert_eq!(track.vehicle_state, VehicleState::Approaching);
    }

    #[test]
    fn approaching_to_inside_emits_entry_without_plate_requirement() {
        let cfg = EventConfig { require_plate_for_entry: false, min_dwell_time: 0.0, ..EventConfig::default() };
        let mut engine = EventEngine::new(1, cfg);
        let mut track = make_track(1, 1, 0.7, 100);
        track.vehicle_state = VehicleState::Approaching;

        let event = engine.process_track(&mut track, 100).unwrap();
        assert_eq!(event.event_type, EventKind::Entry);
        assert_eq!(track.vehicle_state, VehicleState::Inside);
        assert_eq!(engine.total_entries, 1);
    }

    #[test]
    fn plate_required_blocks_entry_and_state_does_not_advance() {
        let cfg = EventConfig { require_plate_for_entry: true, min_dwell_time: 0.0, ..EventConfig::default() };
        let mut engine = EventEngine::new(1, cfg);
        let mut track = make_track(1, 1, 0.7, 100);
        track.vehicle_state = VehicleState::Approaching;

        let event = engine.process_track(&mut track, 100);
        assert!(event.is_none());
        assert_eq!(track.vehicle_state, VehicleState::Approaching, "state must not advance while suppressed");
    }

    #[test]
    fn duplicate_plate_suppresses_second_entry() {
        let cfg = EventConfig { require_plate_for_entry: false, min_dwell_time: 0.0, dedup_window: 60, ..EventConfig::default() };
        let mut engine = EventEngine::new(1, cfg);

        let mut first = make_track(1, 1, 0.7, 100);
        first.vehicle_state = VehicleState::Approaching;
        first.finalize_plate("ABC1234".into(), 0.9);
        let ev1 = engine.process_track(&mut first, 100);
        assert!(ev1.is_some());

        let mut second = make_track(1, 2, 0.7, 100);
        second.vehicle_state = VehicleState::Approaching;
        second.finalize_plate("ABC1234".into(), 0.9);
        let ev2 = engine.process_track(&mut second, 100);
        assert!(ev2.is_none(), "duplicate plate within dedup window must be suppressed");
        assert_eq!(second.vehicle_state, VehicleState::Approaching);

        assert_eq!(engine.total_entries, 1);
    }

    #[test]
    fn exit_duration_matches_first_seen_to_now() {
        let cfg = EventConfig { require_plate_for_exit: false, ..EventConfig::default() };
        let mut engine = EventEngine::new(1, cfg);
        let mut track = make_track(1, 1, 0.95, 100);
        track.vehicle_state = VehicleState::Exiting;
        track.time_since_update = 6;

        let event = engine.process_track(&mut track, 100).unwrap();
        assert_eq!(event.event_type, EventKind::Exit);
        assert_eq!(event.entry_time, Some(track.first_seen));
        assert!(event.duration.unwrap() >= 0.0);
        assert_eq!(track.vehicle_state, VehicleState::Logged);
    }
}
