//! Per-camera multi-object tracker: ByteTrack-style single-tier IoU
//! association over a constant-velocity Kalman filter per track. Matching
//! is greedy: build IoU pairs above threshold, sort descending, consume
//! rows/columns as they're claimed.

use chrono::Utc;
use std::collections::HashMap;
use tracing::error;

use crate::config::TrackingConfig;
use crate::kalman::KalmanFilter;
use crate::types::{Detection, Track, TrackState};

pub fn iou(a: [f32; 4], b: [f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - inter;

    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

struct TrackEntry {
    track: Track,
    kf: KalmanFilter,
}

pub struct Tracker {
    camera_id: i64,
    cfg: TrackingConfig,
    tracks: HashMap<u64, TrackEntry>,
    next_track_id: u64,
}

impl Tracker {
    pub fn new(camera_id: i64, cfg: TrackingConfig) -> Self {
        Self { camera_id, cfg, tracks: HashMap::new(), next_track_id: 1 }
    }

    /// Run one association step. Returns the Confirmed and Lost tracks
    /// (Tentative is withheld, Deleted is gone).
    pub fn update(&mut self, detections: &[Detection]) -> Vec<Track> {
        let now = Utc::now();

        // 1. predict every live track
        let mut predicted: HashMap<u64, [f32; 4]> = HashMap::new();
        for (id, entry) in self.tracks.iter_mut() {
            entry.kf.predict();
            let bbox = entry.kf.bbox();
            entry.track.bbox = bbox;
            entry.track.age += 1;
            entry.track.time_since_update += 1;
            predicted.insert(*id, bbox);
        }

        // 2/3. build candidate pairs above threshold, sort descending by IoU,
        // greedily consume rows/cols. Ties broken by enumeration order
        // (lower track-row index, then lower detection-column index) because
        // the sort is stable and pairs are pushed in that order.
        let mut track_ids: Vec<u64> = self.tracks.keys().copied().collect();
        track_ids.sort_unstable();

        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, tid) in track_ids.iter().enumerate() {
            let tbbox = predicted[tid];
            for (di, det) in detections.iter().enumerate() {
                let score = iou(tbbox, det.bbox);
                if score > self.cfg.iou_threshold {
                    pairs.push((ti, di, score));
                }
            }
        }
        pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut track_used = vec![false; track_ids.len()];
        let mut det_used = vec![false; detections.len()];
        let mut matches: Vec<(usize, usize)> = Vec::new();

        for (ti, di, _score) in &pairs {
            if track_used[*ti] || det_used[*di] {
                continue;
            }
            track_used[*ti] = true;
            det_used[*di] = true;
            matches.push((*ti, *di));
        }

        // 4. apply matches
        for (ti, di) in &matches {
            let tid = track_ids[*ti];
            let det = &detections[*di];
            let entry = self.tracks.get_mut(&tid).unwrap();

            if !entry.kf.update(det.bbox) {
                error!(
                    "camera {}: track {tid} Kalman update hit a non-invertible innovation \
                     covariance; abandoning track",
                    self.camera_id
                );
                entry.track.state = TrackState::Deleted;
                continue;
            }
            let corrected = entry.kf.bbox();
            let velocity = entry.kf.velocity();
            entry.track.apply_match(corrected, det.confidence, det.class, velocity, now);

            if entry.track.state == TrackState::Tentative && entry.track.hits >= self.cfg.min_hits {
                entry.track.state = TrackState::Confirmed;
            } else if entry.track.state == TrackState::Lost {
                entry.track.state = TrackState::Confirmed;
            }
        }

        // 5. new tracks for unmatched detections
        for (di, det) in detections.iter().enumerate() {
            if det_used[di] {
                continue;
            }
            let track_id = self.next_track_id;
            self.next_track_id += 1;
            let track = Track::new(track_id, self.camera_id, det, now);
            let kf = KalmanFilter::new(det.bbox);
            self.tracks.insert(track_id, TrackEntry { track, kf });
        }

        // 6. demote/delete unmatched existing tracks
        for (ti, tid) in track_ids.iter().enumerate() {
            if track_used[ti] {
                continue;
            }
            let entry = self.tracks.get_mut(tid).unwrap();
            if entry.track.state == TrackState::Confirmed {
                entry.track.state = TrackState::Lost;
            }
            if entry.track.time_since_update > self.cfg.max_lost_frames {
                entry.track.state = TrackState::Deleted;
            }
        }

        // 7. remove Deleted tracks and their filters
        self.tracks.retain(|_, e| e.track.state != TrackState::Deleted);

        self.tracks
            .values()
            .filter(|e| matches!(e.track.state, TrackState::Confirmed | TrackState::Lost))
            .map(|e| e.track.clone())
            .collect()
    }

    /// Mutable access to a single live track, used by the OCR and FSM stages
    /// to record plate readings and advance position state.
    pub fn track_mut(&mut self, track_id: u64) -> Option<&mut Track> {
        self.tracks.get_mut(&track_id).map(|e| &mut e.track)
    }

    pub fn active_count(&self) -> usize {
        self.tracks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VehicleType;

    fn det(bbox: [f32; 4], conf: f32) -> Detection {
        Detection { bbox, confidence: conf, class: VehicleType::Car }
    }

    #[test]
    fn iou_is_symmetric() {
        let a = [0.0, 0.0, 10.0, 10.0];
        let b = [5.0, 5.0, 15.0, 15.0];
        assert_eq!(iou(a, b), iou(b, a));
    }

    #[test]
    fn iou_disjoint_is_zero() {
        let a = [0.0, 0.0, 10.0, 10.0];
        let b = [20.0, 20.0, 30.0, 30.0];
        assert_eq!(iou(a, b), 0.0);
    }

    #[test]
    fn new_detection_creates_tentative_then_confirms() {
        let mut cfg = TrackingConfig::default();
        cfg.min_hits = 3;
        let mut tracker = Tracker::new(1, cfg);

        // frame 1: new track, tentative, not yet surfaced
        let out = tracker.update(&[det([10.0, 10.0, 50.0, 50.0], 0.9)]);
        assert!(out.is_empty());

        // frames 2 and 3: same box, should confirm on 3rd match
        let out = tracker.update(&[det([10.0, 10.0, 50.0, 50.0], 0.9)]);
        assert!(out.is_empty());
        let out = tracker.update(&[det([10.0, 10.0, 50.0, 50.0], 0.9)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].state, TrackState::Confirmed);
    }

    #[test]
    fn unmatched_confirmed_track_is_lost_then_deleted() {
        let mut cfg = TrackingConfig::default();
        cfg.min_hits = 1;
        cfg.max_lost_frames = 2;
        let mut tracker = Tracker::new(1, cfg);

        let out = tracker.update(&[det([10.0, 10.0, 50.0, 50.0], 0.9)]);
        assert_eq!(out[0].state, TrackState::Confirmed);

        let out = tracker.update(&[]);
        assert_eq!(out[0].state, TrackState::Lost);

        let out = tracker.update(&[]);
        assert_eq!(out[0].state, TrackState::Lost);

        let out = tracker.update(&[]);
        assert!(out.is_empty(), "track should be deleted after exceeding max_lost_frames");
    }

    #[test]
    fn no_detection_spawns_more_than_one_new_track() {
        let cfg = TrackingConfig::default();
        let mut tracker = Tracker::new(1, cfg);
        let before = tracker.active_count();
        let dets = vec![det([0.0, 0.0, 10.0, 10.0], 0.9), det([100.0, 100.0, 120.0, 120.0], 0.8)];
        tracker.update(&dets);
        let after = tracker.active_count();
        assert!(dets.len() <= after - before + after);
        assert_eq!(after - before, dets.len());
    }
}
