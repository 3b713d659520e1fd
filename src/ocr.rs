//! OCR adapter: throttled admission, ROI preprocessing, and temporal fusion
//! of plate readings. The recognition oracle itself is out of scope; this
//! module owns the gating, preprocessing, cleaning, and fusion around it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use opencv::core::{Mat, Rect, Size};
use opencv::prelude::*;
use opencv::imgproc;
use tracing::{debug, warn};

use crate::config::OcrConfig;
use crate::types::Bbox;

/// Contract: given a preprocessed image, return per-line (text, confidence)
/// pairs. Called under the concurrency gate; may be slow.
pub trait OcrOracle: Send + Sync {
    fn recognize(&self, image: &Mat) -> Vec<(String, f32)>;
}

/// An oracle that never reads anything; used when OCR is disabled.
pub struct NullOracle;

impl OcrOracle for NullOracle {
    fn recognize(&self, _image: &Mat) -> Vec<(String, f32)> {
        Vec::new()
    }
}

/// Nominal FPS assumed by the throttle divisor, independent of the camera's
/// actual configured rate. Preserved from the original implementation as a
/// named, hard-coded constant rather than derived from config (see open
/// questions in the design notes).
const ASSUMED_THROTTLE_FPS: f64 = 20.0;

pub struct OcrEngine {
    cfg: OcrConfig,
    oracle: Arc<dyn OcrOracle>,
    last_ocr_time: HashMap<u64, DateTime<Utc>>,
    active_count: Arc<AtomicUsize>,
    pub total_calls: u64,
    pub successful: u64,
    pub failed: u64,
}

impl OcrEngine {
    pub fn new(cfg: OcrConfig, oracle: Arc<dyn OcrOracle>) -> Self {
        Self {
            cfg,
            oracle,
            last_ocr_time: HashMap::new(),
            active_count: Arc::new(AtomicUsize::new(0)),
            total_calls: 0,
            successful: 0,
            failed: 0,
        }
    }

    /// Admission check per §4.5: enabled, under the concurrency cap, and
    /// past the per-track throttle interval.
    pub fn can_process(&self, track_id: u64) -> bool {
        if !self.cfg.enabled {
            return false;
        }
        if self.active_count.load(Ordering::Relaxed) >= self.cfg.max_concurrent {
            return false;
        }
        if let Some(last) = self.last_ocr_time.get(&track_id) {
            let elapsed = (Utc::now() - *last).num_milliseconds() as f64 / 1000.0;
            let min_interval = self.cfg.throttle_frames as f64 / ASSUMED_THROTTLE_FPS;
            if elapsed < min_interval {
                return false;
            }
        }
        true
    }

    /// Run recognition on a vehicle ROI, if admitted. Returns a cleaned
    /// reading or none. `last_ocr_time` is stamped on admission, not on
    /// completion, and the active counter is held for the call's duration.
    pub fn recognize_plate(&mut self, frame: &Mat, bbox: Bbox, track_id: u64) -> Option<(String, f32)> {
        if !self.can_process(track_id) {
            return None;
        }

        self.active_count.fetch_add(1, Ordering::Relaxed);
        self.last_ocr_time.insert(track_id, Utc::now());
        self.total_calls += 1;

        let result = self.run_recognition(frame, bbox, track_id);

        self.active_count.fetch_sub(1, Ordering::Relaxed);

        match result {
            Some(r) => {
                self.successful += 1;
                Some(r)
            }
            None => {
                self.failed += 1;
                None
            }
        }
    }

    fn run_recognition(&self, frame: &Mat, bbox: Bbox, track_id: u64) -> Option<(String, f32)> {
        let roi = extract_roi(frame, bbox, 0.1)?;
        let processed = preprocess_plate(&roi).unwrap_or(roi);

        let lines = self.oracle.recognize(&processed);
        if lines.is_empty() {
            return None;
        }

        let full_text: String = lines.iter().map(|(t, _)| t.as_str()).collect::<Vec<_>>().join(" ");
        let avg_conf: f32 = lines.iter().map(|(_, c)| *c).sum::<f32>() / lines.len() as f32;

        let cleaned = clean_plate_text(&full_text);
        if cleaned.len() < 3 {
            return None;
        }

        debug!("OCR result for track {track_id}: {cleaned} ({avg_conf:.2})");
        Some((cleaned, avg_conf))
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    pub fn fusion_min_samples(&self) -> usize {
        self.cfg.fusion_min_samples
    }
}

fn extract_roi(frame: &Mat, bbox: Bbox, expand: f32) -> Option<Mat> {
    let w = bbox[2] - bbox[0];
    let h = bbox[3] - bbox[1];

    let x1 = ((bbox[0] - w * expand).max(0.0)) as i32;
    let y1 = ((bbox[1] - h * expand).max(0.0)) as i32;
    let x2 = ((bbox[2] + w * expand).min(frame.cols() as f32)) as i32;
    let y2 = ((bbox[3] + h * expand).min(frame.rows() as f32)) as i32;

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let rect = Rect::new(x1, y1, x2 - x1, y2 - y1);
    match Mat::roi(frame, rect) {
        Ok(roi) if !roi.empty() => Some(roi),
        _ => None,
    }
}

fn preprocess_plate(roi: &Mat) -> opencv::Result<Mat> {
    let mut gray = Mat::default();
    if roi.channels() == 3 {
        imgproc::cvt_color(roi, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;
    } else {
        gray = roi.clone();
    }

    let mut upscaled = Mat::default();
    if gray.cols() < 200 {
        let scale = 200.0 / gray.cols() as f64;
        let new_w = (gray.cols() as f64 * scale) as i32;
        let new_h = (gray.rows() as f64 * scale) as i32;
        imgproc::resize(&gray, &mut upscaled, Size::new(new_w, new_h), 0.0, 0.0, imgproc::INTER_CUBIC)?;
    } else {
        upscaled = gray;
    }

    let mut enhanced = Mat::default();
    let mut clahe = imgproc::create_clahe(2.0, Size::new(8, 8))?;
    clahe.apply(&upscaled, &mut enhanced)?;

    let mut denoised = Mat::default();
    opencv::photo::fast_nl_means_denoising(&enhanced, &mut denoised, 10.0, 7, 21)?;

    let mut binary = Mat::default();
    imgproc::threshold(&denoised, &mut binary, 0.0, 255.0, imgproc::THRESH_BINARY + imgproc::THRESH_OTSU)?;

    let mut out = Mat::default();
    imgproc::cvt_color(&binary, &mut out, imgproc::COLOR_GRAY2BGR, 0)?;
    Ok(out)
}

fn clean_plate_text(text: &str) -> String {
    text.to_uppercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Fuse multiple readings by temporal consistency. See §4.5.
pub fn fuse_readings(readings: &[(String, f32)], fusion_min_samples: usize) -> Option<(String, f32, usize)> {
    if readings.is_empty() {
        return None;
    }

    if readings.len() < fusion_min_samples {
        return highest_confidence(readings).map(|(t, c)| (t, c, 1));
    }

    let mut groups: Vec<Vec<&(String, f32)>> = Vec::new();
    for reading in readings {
        let mut placed = false;
        for group in groups.iter_mut() {
            if levenshtein(&reading.0, &group[0].0) <= 2 {
                group.push(reading);
                placed = true;
                break;
            }
        }
        if !placed {
            groups.push(vec![reading]);
        }
    }

    // `max_by_key` returns the *last* maximal element on a tie; groups are
    // built in first-appearance order, so reverse first to keep the
    // earliest-formed group on a size tie, matching the original engine's
    // `max(groups, key=len)`.
    let largest = groups.iter().rev().max_by_key(|g| g.len())?;

    if largest.len() < fusion_min_samples {
        return highest_confidence(readings).map(|(t, c)| (t, c, 1));
    }

    // Most frequent string in the group, ties broken by first appearance.
    let mut counts: Vec<(&str, usize, usize)> = Vec::new(); // (text, count, first_index)
    for (idx, (text, _)) in largest.iter().enumerate() {
        if let Some(entry) = counts.iter_mut().find(|(t, _, _)| *t == text.as_str()) {
            entry.1 += 1;
        } else {
            counts.push((text.as_str(), 1, idx));
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    let most_common = counts[0].0.to_string();

    let matching: Vec<f32> = largest.iter().filter(|(t, _)| t == &most_common).map(|(_, c)| *c).collect();
    let avg_conf = matching.iter().sum::<f32>() / matching.len() as f32;

    Some((most_common, avg_conf, largest.len()))
}

fn highest_confidence(readings: &[(String, f32)]) -> Option<(String, f32)> {
    readings
        .iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(t, c)| (t.clone(), *c))
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut cur = vec![0usize; b.len() + 1];
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            cur[j + 1] = (prev[j + 1] + 1).min(cur[j] + 1).min(prev[j] + cost);
        }
        prev = cur;
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fusion_tie_between_equal_size_groups_keeps_first_seen() {
        // "AAA" and "BBB" are Levenshtein distance 3 apart, well above the
        // grouping threshold of 2, so they never merge. Both groups end up
        // size 2; the first-formed group ("AAA") must win the tie.
        let readings = vec![
            ("AAA".to_string(), 0.9),
            ("BBB".to_string(), 0.8),
            ("AAA".to_string(), 0.7),
            ("BBB".to_string(), 0.6),
        ];
        let (text, conf, count) = fuse_readings(&readings, 2).unwrap();
        assert_eq!(text, "AAA");
        assert_eq!(conf, 0.8, "mean of the two AAA readings' confidences");
        assert_eq!(count, 2);
    }

    #[test]
    fn fusion_picks_largest_similar_group() {
        let readings = vec![
            ("ABC1234".to_string(), 0.9),
            ("ABC1234".to_string(), 0.85),
            ("ABC1234".to_string(), 0.8),
            ("ABC1Z34".to_string(), 0.7),
            ("XYZ0000".to_string(), 0.6),
        ];
        let (text, _conf, count) = fuse_readings(&readings, 3).unwrap();
        assert_eq!(text, "ABC1234");
        assert_eq!(count, 4);
    }

    #[test]
    fn below_min_samples_returns_highest_confidence_only() {
        let readings = vec![("AAA1111".to_string(), 0.5), ("BBB2222".to_string(), 0.95)];
        let (text, conf, count) = fuse_readings(&readings, 3).unwrap();
        assert_eq!(text, "BBB2222");
        assert_eq!(conf, 0.95);
        assert_eq!(count, 1);
    }

    #[test]
    fn fusion_is_deterministic_given_same_sequence() {
        let readings = vec![
            ("AAA1111".to_string(), 0.5),
            ("BBB2222".to_string(), 0.6),
            ("AAA1111".to_string(), 0.7),
        ];
        let first = fuse_readings(&readings, 3);
        let second = fuse_readings(&readings, 3);
        assert_eq!(first.map(|(t, _, _)| t), second.map(|(t, _, _)| t));
    }

    #[test]
    fn clean_plate_text_strips_and_uppercases() {
        assert_eq!(clean_plate_text("ab-12.34 "), "AB1234");
        assert_eq!(clean_plate_text("a1"), "A1");
    }

    #[test]
    fn levenshtein_symmetry_and_identity() {
        assert_eq!(levenshtein("ABC", "ABC"), 0);
        assert_eq!(levenshtein("ABC", "ABD"), 1);
        assert_eq!(levenshtein("KITTEN", "SITTING"), levenshtein("SITTING", "KITTEN"));
    }
}

#[cfg(feature = "ocr-adapter")]
pub mod onnx {
    use super::*;
    use anyhow::{anyhow, Result};
    use ndarray::Array4;
    use opencv::{core, imgproc as cv_imgproc};
    use ort::session::Session;
    use std::sync::Mutex;

    /// Reference CRNN-style adapter over ONNX Runtime: a single-line text
    /// recognizer decoded greedily over a CTC output. The model's own
    /// accuracy is out of scope; this wrapper is only responsible for the
    /// tensor plumbing and character-set decoding, the OCR analogue of
    /// `detector::onnx::OrtVehicleDetector`.
    ///
    /// `OcrOracle::recognize` takes `&self` (the oracle is shared behind an
    /// `Arc` across cameras), while `ort`'s `Session::run` needs `&mut self`;
    /// the session is wrapped in a `Mutex` rather than the detector's plain
    /// field so the borrow can be taken inside the shared method.
    pub struct OrtOcrOracle {
        session: Mutex<Session>,
        input_height: u32,
        /// Index 0 is the CTC blank symbol; indices 1.. map to `charset`.
        charset: Vec<char>,
    }

    impl OrtOcrOracle {
        pub fn new(model_path: &str, input_height: u32, charset: &str) -> Result<Self> {
            let session = Session::builder()?.commit_from_file(model_path)?;
            Ok(Self { session: Mutex::new(session), input_height, charset: charset.chars().collect() })
        }

        /// Resize to a fixed height, preserving aspect ratio, and normalize
        /// to a single-channel `(1, 1, H, W)` tensor in `[0, 1]`.
        fn preprocess(&self, image: &Mat) -> Result<Array4<f32>> {
            let mut gray = core::Mat::default();
            if image.channels() == 3 {
                cv_imgproc::cvt_color(image, &mut gray, cv_imgproc::COLOR_BGR2GRAY, 0)?;
            } else {
                gray = image.clone();
            }

            let scale = self.input_height as f64 / gray.rows().max(1) as f64;
            let target_w = ((gray.cols() as f64 * scale).round() as i32).max(1);

            let mut resized = core::Mat::default();
            cv_imgproc::resize(
                &gray,
                &mut resized,
                core::Size::new(target_w, self.input_height as i32),
                0.0,
                0.0,
                cv_imgproc::INTER_LINEAR,
            )?;

            let mut tensor = Array4::<f32>::zeros((1, 1, self.input_height as usize, target_w as usize));
            for y in 0..self.input_height as i32 {
                for x in 0..target_w {
                    let px: u8 = *resized.at_2d(y, x)?;
                    tensor[[0, 0, y as usize, x as usize]] = px as f32 / 255.0;
                }
            }
            Ok(tensor)
        }

        /// Greedy CTC decode: argmax per timestep, collapse repeats, drop
        /// the blank symbol. Confidence is the mean of the kept timesteps'
        /// max probabilities.
        fn decode(&self, logits: &ndarray::ArrayViewD<f32>) -> (String, f32) {
            let shape = logits.shape();
            let timesteps = shape[0];
            let num_classes = shape[1];

            let mut text = String::new();
            let mut confidences = Vec::new();
            let mut prev_class = 0usize;

            for t in 0..timesteps {
                let mut best_class = 0usize;
                let mut best_score = f32::MIN;
                for c in 0..num_classes {
                    let score = logits[[t, c]];
                    if score > best_score {
                        best_score = score;
                        best_class = c;
                    }
                }

                if best_class != 0 && best_class != prev_class {
                    if let Some(&ch) = self.charset.get(best_class - 1) {
                        text.push(ch);
                        confidences.push(best_score);
                    }
                }
                prev_class = best_class;
            }

            let confidence = if confidences.is_empty() {
                0.0
            } else {
                confidences.iter().sum::<f32>() / confidences.len() as f32
            };
            (text, confidence)
        }

        fn run(&self, image: &Mat) -> Result<Vec<(String, f32)>> {
            let input = self.preprocess(image)?;
            let mut session = self.session.lock().map_err(|_| anyhow!("onnx OCR session lock poisoned"))?;
            let outputs = session.run(ort::inputs!["input" => input.view()]?)?;
            let logits = outputs[0].try_extract_tensor::<f32>().map_err(|e| anyhow!("extract tensor: {e}"))?;

            let (text, confidence) = self.decode(&logits);
            if text.is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![(text, confidence)])
        }
    }

    impl OcrOracle for OrtOcrOracle {
        fn recognize(&self, image: &Mat) -> Vec<(String, f32)> {
            match self.run(image) {
                Ok(readings) => readings,
                Err(e) => {
                    warn!("onnx OCR adapter error: {e}");
                    Vec::new()
                }
            }
        }
    }
}
