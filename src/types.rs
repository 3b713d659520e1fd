//! Shared data model: detections, tracks, and the event types the FSM emits.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Axis-aligned box in pixel coordinates, `x2 > x1`, `y2 > y1`.
pub type Bbox = [f32; 4];

pub fn bbox_center_y(b: Bbox) -> f32 {
    (b[1] + b[3]) / 2.0
}

pub fn bbox_width(b: Bbox) -> f32 {
    b[2] - b[0]
}

pub fn bbox_height(b: Bbox) -> f32 {
    b[3] - b[1]
}

/// Vehicle class as produced by the detector adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Car,
    Motorcycle,
    Bus,
    Truck,
    Unknown,
}

impl VehicleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Car => "car",
            VehicleType::Motorcycle => "motorcycle",
            VehicleType::Bus => "bus",
            VehicleType::Truck => "truck",
            VehicleType::Unknown => "unknown",
        }
    }

    /// Map a COCO class id to a vehicle type. Everything else is `Unknown`.
    pub fn from_coco_id(id: i64) -> Self {
        match id {
            2 => VehicleType::Car,
            3 => VehicleType::Motorcycle,
            5 => VehicleType::Bus,
            7 => VehicleType::Truck,
            _ => VehicleType::Unknown,
        }
    }
}

/// A single frame-local detector output. Immutable.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: Bbox,
    pub confidence: f32,
    pub class: VehicleType,
}

impl Detection {
    pub fn center(&self) -> (f32, f32) {
        ((self.bbox[0] + self.bbox[2]) / 2.0, (self.bbox[1] + self.bbox[3]) / 2.0)
    }
}

/// Track lifecycle state, distinct from the vehicle position state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Tentative,
    Confirmed,
    Lost,
    Deleted,
}

/// FSM coordinate used to emit durable entry/exit events. Monotonic, no
/// backward transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VehicleState {
    Outside,
    Approaching,
    Inside,
    Exiting,
    Logged,
}

#[derive(Debug, Clone)]
pub struct PlateReading {
    pub text: String,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

/// A camera-scoped temporal identity for a vehicle.
#[derive(Debug, Clone)]
pub struct Track {
    pub track_id: u64,
    pub camera_id: i64,
    pub state: TrackState,
    pub vehicle_type: VehicleType,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub bbox: Bbox,
    pub confidence: f32,
    pub color: Option<String>,
    pub velocity: (f32, f32),
    pub hits: u32,
    pub age: u32,
    pub time_since_update: u32,

    pub plate_readings: Vec<PlateReading>,
    pub plate_text: Option<String>,
    pub plate_confidence: Option<f32>,
    pub plate_locked: bool,

    pub vehicle_state: VehicleState,
}

impl Track {
    pub fn new(track_id: u64, camera_id: i64, det: &Detection, now: DateTime<Utc>) -> Self {
        Self {
            track_id,
            camera_id,
            state: TrackState::Tentative,
            vehicle_type: det.class,
            first_seen: now,
            last_seen: now,
            bbox: det.bbox,
            confidence: det.confidence,
            color: None,
            velocity: (0.0, 0.0),
            hits: 1,
            age: 0,
            time_since_update: 0,
            plate_readings: Vec::new(),
            plate_text: None,
            plate_confidence: None,
            plate_locked: false,
            vehicle_state: VehicleState::Outside,
        }
    }

    /// Record a successful association: new corrected geometry, confidence,
    /// and timestamp. Matches `Track.update_bbox` in the original engine.
    pub fn apply_match(&mut self, bbox: Bbox, confidence: f32, class: VehicleType, velocity: (f32, f32), now: DateTime<Utc>) {
        self.bbox = bbox;
        self.confidence = confidence;
        self.vehicle_type = class;
        self.velocity = velocity;
        self.last_seen = now;
        self.hits += 1;
        self.time_since_update = 0;
    }

    pub fn add_plate_reading(&mut self, text: String, confidence: f32, now: DateTime<Utc>) {
        if self.plate_locked {
            return;
        }
        self.plate_readings.push(PlateReading { text, confidence, timestamp: now });
    }

    pub fn finalize_plate(&mut self, text: String, confidence: f32) {
        self.plate_text = Some(text);
        self.plate_confidence = Some(confidence);
        self.plate_locked = true;
    }
}

/// A durable entry/exit record, immutable once queued to the writer.
#[derive(Debug, Clone, Serialize)]
pub struct DurableEvent {
    #[serde(rename = "type")]
    pub event_type: EventKind,
    pub camera_id: i64,
    pub track_id: u64,
    pub vehicle_type: &'static str,
    pub plate_text: Option<String>,
    pub plate_confidence: Option<f32>,
    pub timestamp: DateTime<Utc>,
    pub entry_time: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub confidence: f32,
    pub metadata: EventMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Entry,
    Exit,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventMetadata {
    pub color: Option<String>,
    pub bbox: Bbox,
}
