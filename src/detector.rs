//! Detector adapter: wraps the (out-of-scope) detection oracle and normalizes
//! its class ids to vehicle types, filtering by confidence and configured
//! class set. Stateless between calls; errors are logged and return an
//! empty list rather than killing the pipeline.

use opencv::core::Mat;
use tracing::warn;

use crate::config::DetectionConfig;
use crate::tracker::iou;
use crate::types::{Detection, VehicleType};

/// Contract the processor calls on every frame. A real implementation wraps
/// an inference engine; errors must never propagate past this boundary.
pub trait VehicleDetector: Send {
    fn detect(&mut self, image: &Mat) -> Vec<Detection>;
}

/// Applies the confidence/class filter and post-NMS on top of whatever raw
/// detections an oracle returns, so adapters that return everything (no
/// filtering, overlapping boxes) still honor configuration.
pub struct FilteringDetector<D: VehicleDetector> {
    inner: D,
    cfg: DetectionConfig,
}

impl<D: VehicleDetector> FilteringDetector<D> {
    pub fn new(inner: D, cfg: DetectionConfig) -> Self {
        Self { inner, cfg }
    }
}

impl<D: VehicleDetector> VehicleDetector for FilteringDetector<D> {
    fn detect(&mut self, image: &Mat) -> Vec<Detection> {
        let raw = self.inner.detect(image);
        let filtered: Vec<Detection> = raw
            .into_iter()
            .filter(|d| d.confidence >= self.cfg.confidence)
            .filter(|d| !matches!(d.class, VehicleType::Unknown))
            .collect();
        non_max_suppress(filtered, self.cfg.iou_threshold)
    }
}

/// Greedy NMS: sort by confidence descending, keep a box, suppress any
/// remaining box whose IoU with it exceeds `iou_threshold`.
fn non_max_suppress(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if !kept.iter().any(|k| iou(k.bbox, det.bbox) > iou_threshold) {
            kept.push(det);
        }
    }
    kept
}

/// A detector that never produces detections; useful for headless/demo runs
/// and as a safe fallback when the configured oracle fails to load.
pub struct NullDetector;

impl VehicleDetector for NullDetector {
    fn detect(&mut self, _image: &Mat) -> Vec<Detection> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(bbox: [f32; 4], conf: f32) -> Detection {
        Detection { bbox, confidence: conf, class: VehicleType::Car }
    }

    struct FixedDetector(Vec<Detection>);

    impl VehicleDetector for FixedDetector {
        fn detect(&mut self, _image: &Mat) -> Vec<Detection> {
            self.0.clone()
        }
    }

    #[test]
    fn filters_low_confidence_and_unknown_class() {
        let raw = vec![
            det([0.0, 0.0, 10.0, 10.0], 0.9),
            det([0.0, 0.0, 10.0, 10.0], 0.1),
            Detection { bbox: [20.0, 20.0, 30.0, 30.0], confidence: 0.9, class: VehicleType::Unknown },
        ];
        let cfg = DetectionConfig { confidence: 0.4, ..DetectionConfig::default() };
        let mut d = FilteringDetector::new(FixedDetector(raw), cfg);
        let out = d.detect(&Mat::default());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn nms_suppresses_overlapping_lower_confidence_box() {
        let raw = vec![det([0.0, 0.0, 10.0, 10.0], 0.9), det([1.0, 1.0, 11.0, 11.0], 0.5)];
        let cfg = DetectionConfig { confidence: 0.0, iou_threshold: 0.3, ..DetectionConfig::default() };
        let mut d = FilteringDetector::new(FixedDetector(raw), cfg);
        let out = d.detect(&Mat::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 0.9);
    }

    #[test]
    fn nms_keeps_disjoint_boxes() {
        let raw = vec![det([0.0, 0.0, 10.0, 10.0], 0.9), det([100.0, 100.0, 120.0, 120.0], 0.8)];
        let cfg = DetectionConfig { confidence: 0.0, iou_threshold: 0.3, ..DetectionConfig::default() };
        let mut d = FilteringDetector::new(FixedDetector(raw), cfg);
        let out = d.detect(&Mat::default());
        assert_eq!(out.len(), 2);
    }
}

#[cfg(feature = "onnx-detector")]
pub mod onnx {
    use super::*;
    use anyhow::{anyhow, Result};
    use ndarray::Array4;
    use opencv::prelude::*;
    use opencv::{core, imgproc};
    use ort::session::Session;

    /// Reference YOLOv8-family adapter over ONNX Runtime. The model's own
    /// accuracy is out of scope; this wrapper is only responsible for the
    /// tensor plumbing and COCO-id normalization.
    pub struct OrtVehicleDetector {
        session: Session,
        input_size: u32,
        conf_threshold: f32,
    }

    impl OrtVehicleDetector {
        pub fn new(model_path: &str, input_size: u32, conf_threshold: f32) -> Result<Self> {
            let session = Session::builder()?.commit_from_file(model_path)?;
            Ok(Self { session, input_size, conf_threshold })
        }

        fn letterbox(&self, frame: &Mat) -> Result<(Array4<f32>, f32, f32)> {
            let mut resized = Mat::default();
            imgproc::resize(
                frame,
                &mut resized,
                core::Size::new(self.input_size as i32, self.input_size as i32),
                0.0,
                0.0,
                imgproc::INTER_LINEAR,
            )?;

            let scale_x = frame.cols() as f32 / self.input_size as f32;
            let scale_y = frame.rows() as f32 / self.input_size as f32;

            let mut chw = Array4::<f32>::zeros((1, 3, self.input_size as usize, self.input_size as usize));
            for y in 0..self.input_size as i32 {
                for x in 0..self.input_size as i32 {
                    let px: &core::Vec3b = resized.at_2d(y, x)?;
                    for c in 0..3 {
                        chw[[0, c, y as usize, x as usize]] = px[2 - c] as f32 / 255.0;
                    }
                }
            }
            Ok((chw, scale_x, scale_y))
        }
    }

    impl VehicleDetector for OrtVehicleDetector {
        fn detect(&mut self, image: &Mat) -> Vec<Detection> {
            match self.run(image) {
                Ok(dets) => dets,
                Err(e) => {
                    warn!("onnx detector error: {e}");
                    Vec::new()
                }
            }
        }
    }

    impl OrtVehicleDetector {
        fn run(&mut self, image: &Mat) -> Result<Vec<Detection>> {
            let (input, scale_x, scale_y) = self.letterbox(image)?;
            let outputs = self.session.run(ort::inputs!["images" => input.view()]?)?;
            let preds = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| anyhow!("extract tensor: {e}"))?;

            let mut out = Vec::new();
            let shape = preds.shape();
            let num_preds = *shape.get(2).ok_or_else(|| anyhow!("unexpected output shape"))?;
            for i in 0..num_preds {
                let cx = preds[[0, 0, i]];
                let cy = preds[[0, 1, i]];
                let w = preds[[0, 2, i]];
                let h = preds[[0, 3, i]];

                let mut best_id = 0usize;
                let mut best_score = 0.0f32;
                for c in 4..shape[1] {
                    let score = preds[[0, c, i]];
                    if score > best_score {
                        best_score = score;
                        best_id = c - 4;
                    }
                }
                if best_score < self.conf_threshold {
                    continue;
                }

                let class = VehicleType::from_coco_id(best_id as i64);
                let bbox = [
                    (cx - w / 2.0) * scale_x,
                    (cy - h / 2.0) * scale_y,
                    (cx + w / 2.0) * scale_x,
                    (cy + h / 2.0) * scale_y,
                ];
                out.push(Detection { bbox, confidence: best_score, class });
            }
            Ok(out)
        }
    }
}
