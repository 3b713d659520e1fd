//! Constant-velocity Kalman filter over `(cx, cy, w, h, vcx, vcy, vw, vh)`.
//!
//! Grounded in `tracking/engine.py`'s `KalmanFilter`, expressed with fixed-size
//! `nalgebra` matrices rather than the original's plain numpy arrays so the
//! linear algebra is checked at compile time and directly unit-testable.

use nalgebra::{SMatrix, SVector};

use crate::types::Bbox;

type State = SVector<f64, 8>;
type Cov = SMatrix<f64, 8, 8>;
type Transition = SMatrix<f64, 8, 8>;
type Measurement = SVector<f64, 4>;
type MeasurementMap = SMatrix<f64, 4, 8>;

pub struct KalmanFilter {
    state: State,
    cov: Cov,
    f: Transition,
    h: MeasurementMap,
    q: Cov,
    r: SMatrix<f64, 4, 4>,
}

impl KalmanFilter {
    /// Seed a filter from a detection box: position/size from the box,
    /// velocity zero.
    pub fn new(bbox: Bbox) -> Self {
        let (cx, cy, w, h) = to_cxcywh(bbox);

        let mut f = Transition::identity();
        // position/size += velocity each step
        f[(0, 4)] = 1.0;
        f[(1, 5)] = 1.0;
        f[(2, 6)] = 1.0;
        f[(3, 7)] = 1.0;

        let mut hmat = MeasurementMap::zeros();
        hmat[(0, 0)] = 1.0;
        hmat[(1, 1)] = 1.0;
        hmat[(2, 2)] = 1.0;
        hmat[(3, 3)] = 1.0;

        Self {
            state: State::from_row_slice(&[cx as f64, cy as f64, w as f64, h as f64, 0.0, 0.0, 0.0, 0.0]),
            cov: Cov::identity() * 10.0,
            f,
            h: hmat,
            q: Cov::identity() * 0.1,
            r: SMatrix::<f64, 4, 4>::identity(),
        }
    }

    /// Advance the state one step. `x' = F x`, `P' = F P F^T + Q`.
    pub fn predict(&mut self) {
        self.state = self.f * self.state;
        self.cov = self.f * self.cov * self.f.transpose() + self.q;
    }

    /// Standard Kalman correction given a new measurement box. Returns
    /// `false` on a non-invertible innovation covariance, an invariant
    /// violation the caller must treat per §7: abandon the track, don't
    /// propagate further.
    pub fn update(&mut self, bbox: Bbox) -> bool {
        let (cx, cy, w, h) = to_cxcywh(bbox);
        let z = Measurement::from_row_slice(&[cx as f64, cy as f64, w as f64, h as f64]);

        let y = z - self.h * self.state;
        let s = self.h * self.cov * self.h.transpose() + self.r;
        let s_inv = match s.try_inverse() {
            Some(inv) => inv,
            None => return false,
        };
        let k = self.cov * self.h.transpose() * s_inv;

        self.state += k * y;
        self.cov = (Cov::identity() - k * self.h) * self.cov;
        true
    }

    /// Derived bbox: `(cx-w/2, cy-h/2, cx+w/2, cy+h/2)`.
    pub fn bbox(&self) -> Bbox {
        let cx = self.state[0];
        let cy = self.state[1];
        let w = self.state[2];
        let h = self.state[3];
        [
            (cx - w / 2.0) as f32,
            (cy - h / 2.0) as f32,
            (cx + w / 2.0) as f32,
            (cy + h / 2.0) as f32,
        ]
    }

    pub fn velocity(&self) -> (f32, f32) {
        (self.state[4] as f32, self.state[5] as f32)
    }
}

fn to_cxcywh(bbox: Bbox) -> (f32, f32, f32, f32) {
    let w = bbox[2] - bbox[0];
    let h = bbox[3] - bbox[1];
    let cx = bbox[0] + w / 2.0;
    let cy = bbox[1] + h / 2.0;
    (cx, cy, w, h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predict_update_round_trip_recovers_measurement() {
        let bbox = [100.0, 100.0, 160.0, 180.0];
        let mut kf = KalmanFilter::new(bbox);
        kf.predict();
        assert!(kf.update(bbox));
        let out = kf.bbox();
        for i in 0..4 {
            assert!((out[i] - bbox[i]).abs() < 1.0, "component {i}: {} vs {}", out[i], bbox[i]);
        }
    }

    #[test]
    fn single_pixel_box_does_not_produce_nan() {
        let bbox = [10.0, 10.0, 11.0, 11.0];
        let mut kf = KalmanFilter::new(bbox);
        kf.predict();
        assert!(kf.update(bbox));
        let out = kf.bbox();
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn velocity_starts_at_zero() {
        let kf = KalmanFilter::new([0.0, 0.0, 10.0, 10.0]);
        assert_eq!(kf.velocity(), (0.0, 0.0));
    }
}
