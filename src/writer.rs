//! Durable writer: a single background worker owns the database handle.
//! Producers enqueue write operations onto a bounded queue (capacity 1000);
//! on full, the record is dropped and counted, never blocking the producer.
//! Batches flush on whichever comes first of batch size or a time interval,
//! each batch in one transaction, rolled back whole on failure.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::DatabaseConfig;
use crate::types::{DurableEvent, EventKind, Track};

const QUEUE_CAPACITY: usize = 1000;
const BATCH_SIZE: usize = 10;
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize)]
pub struct CameraRecord {
    pub id: i64,
    pub name: String,
    pub source: String,
    pub location: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct TrackRecord {
    pub camera_id: i64,
    pub track_id: u64,
    pub vehicle_type: &'static str,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub confidence: f32,
    pub color: Option<String>,
}

impl TrackRecord {
    pub fn from_track(track: &Track) -> Self {
        Self {
            camera_id: track.camera_id,
            track_id: track.track_id,
            vehicle_type: track.vehicle_type.as_str(),
            first_seen: track.first_seen,
            last_seen: track.last_seen,
            confidence: track.confidence,
            color: track.color.clone(),
        }
    }
}

/// A per-track plate history row, independent of whether an entry/exit
/// event ever fired for that track (e.g. a vehicle that never reaches
/// `min_dwell_time`). Supplemental to the event record — see DESIGN.md.
#[derive(Debug, Clone)]
pub struct PlateRecord {
    pub camera_id: i64,
    pub track_id: u64,
    pub plate_text: String,
    pub confidence: f32,
    pub num_readings: usize,
    pub locked: bool,
    pub finalized_at: DateTime<Utc>,
}

enum WriteOp {
    Event(DurableEvent),
    Track(TrackRecord),
    Camera(CameraRecord),
    Plate(PlateRecord),
}

#[derive(Default)]
pub struct WriterStats {
    pub enqueued: AtomicU64,
    pub dropped: AtomicU64,
    pub committed: AtomicU64,
    pub failed_batches: AtomicU64,
}

/// Non-blocking producer handle. Cheap to clone; shared across camera
/// processors and the FSM.
#[derive(Clone)]
pub struct WriterHandle {
    tx: flume::Sender<WriteOp>,
    stats: Arc<WriterStats>,
}

impl WriterHandle {
    fn enqueue(&self, op: WriteOp) {
        match self.tx.try_send(op) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("writer queue full, dropping record");
            }
        }
    }

    pub fn insert_event(&self, event: DurableEvent) {
        self.enqueue(WriteOp::Event(event));
    }

    pub fn insert_track(&self, track: TrackRecord) {
        self.enqueue(WriteOp::Track(track));
    }

    pub fn upsert_camera(&self, camera: CameraRecord) {
        self.enqueue(WriteOp::Camera(camera));
    }

    pub fn insert_plate(&self, plate: PlateRecord) {
        self.enqueue(WriteOp::Plate(plate));
    }

    pub fn stats(&self) -> WriterCounters {
        WriterCounters {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            committed: self.stats.committed.load(Ordering::Relaxed),
            failed_batches: self.stats.failed_batches.load(Ordering::Relaxed),
            queue_depth: self.tx.len() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WriterCounters {
    pub enqueued: u64,
    pub dropped: u64,
    pub committed: u64,
    pub failed_batches: u64,
    pub queue_depth: u64,
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cameras (
    id          INTEGER PRIMARY KEY,
    name        TEXT NOT NULL,
    source      TEXT NOT NULL,
    location    TEXT,
    status      TEXT NOT NULL DEFAULT 'active',
    created_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS tracks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    camera_id   INTEGER NOT NULL,
    track_id    INTEGER NOT NULL,
    vehicle_type TEXT,
    first_seen  TEXT NOT NULL,
    last_seen   TEXT NOT NULL,
    confidence  REAL,
    color       TEXT,
    metadata    TEXT,
    FOREIGN KEY (camera_id) REFERENCES cameras(id)
);

CREATE TABLE IF NOT EXISTS plates (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    camera_id   INTEGER NOT NULL,
    track_id    INTEGER NOT NULL,
    plate_text  TEXT NOT NULL,
    confidence  REAL NOT NULL,
    num_readings INTEGER NOT NULL,
    locked      INTEGER NOT NULL,
    finalized_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    camera_id   INTEGER NOT NULL,
    track_id    INTEGER NOT NULL,
    event_type  TEXT NOT NULL,
    vehicle_type TEXT,
    plate_text  TEXT,
    plate_confidence REAL,
    timestamp   TEXT NOT NULL,
    entry_time  TEXT,
    exit_time   TEXT,
    duration    REAL,
    confidence  REAL,
    metadata    TEXT,
    FOREIGN KEY (camera_id) REFERENCES cameras(id)
);

CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
CREATE INDEX IF NOT EXISTS idx_events_plate ON events(plate_text);
CREATE INDEX IF NOT EXISTS idx_events_camera ON events(camera_id);
CREATE INDEX IF NOT EXISTS idx_tracks_camera ON tracks(camera_id);
CREATE INDEX IF NOT EXISTS idx_plates_text ON plates(plate_text);
"#;

/// Owns the connection; runs on its own worker thread. Construct with
/// `spawn`, which returns the producer-side `WriterHandle` and joins back
/// via `shutdown`.
pub struct DurableWriter {
    rx: flume::Receiver<WriteOp>,
    conn: Connection,
    stats: Arc<WriterStats>,
    stop: Arc<AtomicBool>,
}

impl DurableWriter {
    /// Open (or create) the database, ensure schema, and return the
    /// worker plus its producer handle. The caller spawns `run` on a
    /// dedicated thread.
    pub fn open(cfg: &DatabaseConfig, stop: Arc<AtomicBool>) -> Result<(Self, WriterHandle)> {
        if cfg.r#type != "sqlite" {
            anyhow::bail!("database type {:?} not implemented; only sqlite is supported", cfg.r#type);
        }

        if let Some(parent) = std::path::Path::new(&cfg.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("creating database directory")?;
            }
        }

        let conn = Connection::open(&cfg.path).with_context(|| format!("opening database at {}", cfg.path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA_SQL).context("creating schema")?;

        let (tx, rx) = flume::bounded(QUEUE_CAPACITY);
        let stats = Arc::new(WriterStats::default());
        let handle = WriterHandle { tx, stats: stats.clone() };

        Ok((Self { rx, conn, stats, stop }, handle))
    }

    /// Main worker loop: drain the queue, committing a batch whenever it
    /// reaches `BATCH_SIZE` or `FLUSH_INTERVAL` has elapsed, whichever
    /// first. Exits once `stop` is observed, performing one final commit
    /// of any partial batch.
    pub fn run(mut self) {
        info!("durable writer worker started");
        let mut batch: Vec<WriteOp> = Vec::with_capacity(BATCH_SIZE);
        let mut last_commit = Instant::now();

        while !self.stop.load(Ordering::Relaxed) {
            match self.rx.recv_timeout(RECV_TIMEOUT) {
                Ok(op) => batch.push(op),
                Err(_) => {}
            }

            let should_commit = batch.len() >= BATCH_SIZE || last_commit.elapsed() >= FLUSH_INTERVAL;
            if !batch.is_empty() && should_commit {
                self.commit_batch(&mut batch);
                last_commit = Instant::now();
            }
        }

        // Drain whatever is left, then one final commit.
        while let Ok(op) = self.rx.try_recv() {
            batch.push(op);
        }
        if !batch.is_empty() {
            self.commit_batch(&mut batch);
        }
        info!("durable writer worker stopped");
    }

    fn commit_batch(&mut self, batch: &mut Vec<WriteOp>) {
        let n = batch.len();
        let result = self.execute_batch(batch);
        match result {
            Ok(()) => {
                self.stats.committed.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                error!("batch commit failed, rolling back {n} records: {e}");
                self.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
            }
        }
        batch.clear();
    }

    fn execute_batch(&mut self, batch: &[WriteOp]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for op in batch {
            match op {
                WriteOp::Event(event) => insert_event(&tx, event)?,
                WriteOp::Track(track) => insert_track(&tx, track)?,
                WriteOp::Camera(camera) => upsert_camera(&tx, camera)?,
                WriteOp::Plate(plate) => insert_plate(&tx, plate)?,
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ── Read path: synchronous, shares the same connection ───────────────

    pub fn recent_events(&self, limit: u32, camera_id: Option<i64>) -> Result<Vec<EventRow>> {
        let (sql, has_camera) = match camera_id {
            Some(_) => (
                "SELECT id, camera_id, track_id, event_type, vehicle_type, plate_text, \
                 plate_confidence, timestamp, entry_time, exit_time, duration, confidence, metadata \
                 FROM events WHERE camera_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
                true,
            ),
            None => (
                "SELECT id, camera_id, track_id, event_type, vehicle_type, plate_text, \
                 plate_confidence, timestamp, entry_time, exit_time, duration, confidence, metadata \
                 FROM events ORDER BY timestamp DESC LIMIT ?1",
                false,
            ),
        };

        let mut stmt = self.conn.prepare(sql)?;
        let rows = if has_camera {
            stmt.query_map(params![camera_id.unwrap(), limit], row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map(params![limit], row_to_event)?.collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok(rows)
    }

    pub fn events_by_plate(&self, plate: &str, limit: u32) -> Result<Vec<EventRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, camera_id, track_id, event_type, vehicle_type, plate_text, \
             plate_confidence, timestamp, entry_time, exit_time, duration, confidence, metadata \
             FROM events WHERE plate_text = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![plate, limit], row_to_event)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn hourly_event_counts(&self) -> Result<Vec<(String, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT strftime('%Y-%m-%d %H:00', timestamp) AS hour, COUNT(*) \
             FROM events WHERE timestamp >= datetime('now', '-24 hours') \
             GROUP BY hour ORDER BY hour",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn db_counts(&self) -> Result<(u64, u64, u64)> {
        let total: i64 = self.conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
        let entries: i64 =
            self.conn.query_row("SELECT COUNT(*) FROM events WHERE event_type = 'entry'", [], |r| r.get(0))?;
        let exits: i64 =
            self.conn.query_row("SELECT COUNT(*) FROM events WHERE event_type = 'exit'", [], |r| r.get(0))?;
        Ok((total as u64, entries as u64, exits as u64))
    }

    /// Per-camera status snapshot: the `cameras` registry row for each
    /// configured camera, newest id first isn't implied — returned in
    /// insertion (id) order.
    pub fn camera_statuses(&self) -> Result<Vec<CameraStatusRow>> {
        let mut stmt = self.conn.prepare("SELECT id, name, source, status, created_at FROM cameras ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CameraStatusRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    source: row.get(2)?,
                    status: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Plate history rows, independent of whether an entry/exit event
    /// fired for the owning track. Supplemental read path, see §3.
    pub fn plates_by_text(&self, plate: &str, limit: u32) -> Result<Vec<PlateRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT camera_id, track_id, plate_text, confidence, num_readings, locked, finalized_at \
             FROM plates WHERE plate_text = ?1 ORDER BY finalized_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![plate, limit], |row| {
                Ok(PlateRow {
                    camera_id: row.get(0)?,
                    track_id: row.get(1)?,
                    plate_text: row.get(2)?,
                    confidence: row.get(3)?,
                    num_readings: row.get(4)?,
                    locked: row.get::<_, i64>(5)? != 0,
                    finalized_at: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraStatusRow {
    pub id: i64,
    pub name: String,
    pub source: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlateRow {
    pub camera_id: i64,
    pub track_id: i64,
    pub plate_text: String,
    pub confidence: f32,
    pub num_readings: i64,
    pub locked: bool,
    pub finalized_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRow {
    pub id: i64,
    pub camera_id: i64,
    pub track_id: i64,
    pub event_type: String,
    pub vehicle_type: Option<String>,
    pub plate_text: Option<String>,
    pub plate_confidence: Option<f32>,
    pub timestamp: String,
    pub entry_time: Option<String>,
    pub exit_time: Option<String>,
    pub duration: Option<f64>,
    pub confidence: Option<f32>,
    pub metadata: Option<String>,
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<EventRow> {
    Ok(EventRow {
        id: row.get(0)?,
        camera_id: row.get(1)?,
        track_id: row.get(2)?,
        event_type: row.get(3)?,
        vehicle_type: row.get(4)?,
        plate_text: row.get(5)?,
        plate_confidence: row.get(6)?,
        timestamp: row.get(7)?,
        entry_time: row.get(8)?,
        exit_time: row.get(9)?,
        duration: row.get(10)?,
        confidence: row.get(11)?,
        metadata: row.get(12)?,
    })
}

fn insert_event(tx: &rusqlite::Transaction, event: &DurableEvent) -> rusqlite::Result<()> {
    let metadata_json = serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".into());
    let event_type = match event.event_type {
        EventKind::Entry => "entry",
        EventKind::Exit => "exit",
    };
    tx.execute(
        "INSERT INTO events (camera_id, track_id, event_type, vehicle_type, plate_text, \
         plate_confidence, timestamp, entry_time, exit_time, duration, confidence, metadata) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            event.camera_id,
            event.track_id as i64,
            event_type,
            event.vehicle_type,
            event.plate_text,
            event.plate_confidence,
            event.timestamp.to_rfc3339(),
            event.entry_time.map(|t| t.to_rfc3339()),
            event.exit_time.map(|t| t.to_rfc3339()),
            event.duration,
            event.confidence,
            metadata_json,
        ],
    )?;
    Ok(())
}

fn insert_track(tx: &rusqlite::Transaction, track: &TrackRecord) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO tracks (camera_id, track_id, vehicle_type, first_seen, last_seen, confidence, color, metadata) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            track.camera_id,
            track.track_id as i64,
            track.vehicle_type,
            track.first_seen.to_rfc3339(),
            track.last_seen.to_rfc3339(),
            track.confidence,
            track.color,
            "{}",
        ],
    )?;
    Ok(())
}

fn insert_plate(tx: &rusqlite::Transaction, plate: &PlateRecord) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO plates (camera_id, track_id, plate_text, confidence, num_readings, locked, finalized_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            plate.camera_id,
            plate.track_id as i64,
            plate.plate_text,
            plate.confidence,
            plate.num_readings as i64,
            plate.locked as i64,
            plate.finalized_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn upsert_camera(tx: &rusqlite::Transaction, camera: &CameraRecord) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO cameras (id, name, source, location, status) VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, source = excluded.source, \
         location = excluded.location, status = excluded.status",
        params![camera.id, camera.name, camera.source, camera.location, camera.status],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventMetadata, VehicleType};
    use std::thread;

    fn test_cfg(dir: &tempfile::TempDir) -> DatabaseConfig {
        DatabaseConfig {
            r#type: "sqlite".into(),
            path: dir.path().join("test.db").to_string_lossy().into_owned(),
            host: String::new(),
            port: 0,
            username: String::new(),
            password: String::new(),
            database: String::new(),
            pool_size: 1,
        }
    }

    fn sample_event() -> DurableEvent {
        DurableEvent {
            event_type: EventKind::Entry,
            camera_id: 1,
            track_id: 42,
            vehicle_type: VehicleType::Car.as_str(),
            plate_text: Some("ABC1234".into()),
            plate_confidence: Some(0.9),
            timestamp: Utc::now(),
            entry_time: None,
            exit_time: None,
            duration: None,
            confidence: 0.95,
            metadata: EventMetadata { color: None, bbox: [0.0, 0.0, 10.0, 10.0] },
        }
    }

    #[test]
    fn enqueue_drains_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let (writer, handle) = DurableWriter::open(&test_cfg(&dir), stop.clone()).unwrap();

        let event = sample_event();
        handle.insert_event(event.clone());

        let worker = thread::spawn(move || writer.run());
        thread::sleep(Duration::from_millis(700));
        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap();

        let (writer, _handle) = DurableWriter::open(&test_cfg(&dir), Arc::new(AtomicBool::new(false))).unwrap();
        let rows = writer.recent_events(10, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].track_id, 42);
        assert_eq!(rows[0].plate_text.as_deref(), Some("ABC1234"));
        assert_eq!(rows[0].event_type, "entry");
    }

    #[test]
    fn plate_and_camera_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let (writer, handle) = DurableWriter::open(&test_cfg(&dir), stop.clone()).unwrap();

        handle.upsert_camera(CameraRecord {
            id: 7,
            name: "Gate".into(),
            source: "0".into(),
            location: None,
            status: "active".into(),
        });
        handle.insert_plate(PlateRecord {
            camera_id: 7,
            track_id: 3,
            plate_text: "XYZ9999".into(),
            confidence: 0.88,
            num_readings: 5,
            locked: true,
            finalized_at: Utc::now(),
        });

        let worker = thread::spawn(move || writer.run());
        thread::sleep(Duration::from_millis(700));
        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap();

        let (writer, _handle) = DurableWriter::open(&test_cfg(&dir), Arc::new(AtomicBool::new(false))).unwrap();
        let cameras = writer.camera_statuses().unwrap();
        assert_eq!(cameras.len(), 1);
        assert_eq!(cameras[0].name, "Gate");

        let plates = writer.plates_by_text("XYZ9999", 10).unwrap();
        assert_eq!(plates.len(), 1);
        assert_eq!(plates[0].track_id, 3);
        assert!(plates[0].locked);
    }

    #[test]
    fn queue_full_drops_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let stop = Arc::new(AtomicBool::new(true)); // worker never drains
        let (_writer, handle) = DurableWriter::open(&test_cfg(&dir), stop).unwrap();

        for _ in 0..(QUEUE_CAPACITY + 5) {
            handle.insert_event(sample_event());
        }
        let stats = handle.stats();
        assert_eq!(stats.dropped, 5);
        assert_eq!(stats.enqueued, QUEUE_CAPACITY as u64);
    }
}
