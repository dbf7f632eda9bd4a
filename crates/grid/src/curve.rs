//! Smoothed probability surface over the minute grid. A curve is a
//! non-negative length-10,080 vector summing to 1, unless contextual
//! reweighting zeroed it out entirely, in which case it is marked
//! suppressed and sums to 0.

use crate::minute_grid::SLOTS_PER_WEEK;
use serde::{Deserialize, Serialize};

/// Values below this are clamped to zero after every operation.
const CLAMP_FLOOR: f64 = 1e-12;

/// A contextual weight applied over a wrapping slot window. The curve entry
/// is multiplied by `1 + sum(magnitudes)`; a total of -1 forces the entry
/// to zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlotWeight {
    pub start_slot: u32,
    pub end_slot: u32,
    pub magnitude: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContinuousCurve {
    probs: Vec<f64>,
    suppressed: bool,
}

impl ContinuousCurve {
    /// Uniform curve: every slot carries `1 / 10080`.
    pub fn uniform() -> Self {
        let p = 1.0 / f64::from(SLOTS_PER_WEEK);
        Self {
            probs: vec![p; SLOTS_PER_WEEK as usize],
            suppressed: false,
        }
    }

    /// Build a curve from a raw minute histogram: Laplace prior, circular
    /// Gaussian blur, then normalization.
    pub fn from_histogram(
        counts: &[f64],
        laplace_alpha: f64,
        sigma_minutes: f64,
    ) -> anyhow::Result<Self> {
        if counts.len() != SLOTS_PER_WEEK as usize {
            anyhow::bail!(
                "histogram must have {} slots, got {}",
                SLOTS_PER_WEEK,
                counts.len()
            );
        }
        let prior = laplace_alpha / f64::from(SLOTS_PER_WEEK);
        let raw: Vec<f64> = counts.iter().map(|c| c.max(0.0) + prior).collect();
        let blurred = gaussian_blur_circular(&raw, sigma_minutes);
        let mut curve = Self {
            probs: blurred,
            suppressed: false,
        };
        curve.normalize();
        Ok(curve)
    }

    /// Rehydrate a curve from stored probabilities (e.g. the feature cache).
    pub fn from_probabilities(probs: Vec<f64>) -> anyhow::Result<Self> {
        if probs.len() != SLOTS_PER_WEEK as usize {
            anyhow::bail!(
                "curve must have {} slots, got {}",
                SLOTS_PER_WEEK,
                probs.len()
            );
        }
        let mut curve = Self {
            probs,
            suppressed: false,
        };
        curve.normalize();
        Ok(curve)
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.probs
    }

    pub fn get(&self, slot: u32) -> f64 {
        self.probs[(slot % SLOTS_PER_WEEK) as usize]
    }

    pub fn sum(&self) -> f64 {
        self.probs.iter().sum()
    }

    /// Linear interpolation between the two slots adjacent to `slot_real`,
    /// wrapping at the week boundary.
    pub fn interpolate(&self, slot_real: f64) -> f64 {
        let n = f64::from(SLOTS_PER_WEEK);
        let x = slot_real.rem_euclid(n);
        let lo = x.floor() as u32 % SLOTS_PER_WEEK;
        let hi = (lo + 1) % SLOTS_PER_WEEK;
        let frac = x - x.floor();
        self.probs[lo as usize] * (1.0 - frac) + self.probs[hi as usize] * frac
    }

    /// Argmax over a closed slot window that may wrap the week. Ties break
    /// toward the numerically smaller slot index.
    pub fn peak_in_window(&self, start_slot: u32, end_slot: u32) -> u32 {
        let mut best_slot = start_slot % SLOTS_PER_WEEK;
        let mut best_p = f64::NEG_INFINITY;
        for_each_window_slot(start_slot, end_slot, |slot| {
            let p = self.probs[slot as usize];
            if p > best_p || (p == best_p && slot < best_slot) {
                best_p = p;
                best_slot = slot;
            }
        });
        best_slot
    }

    /// Multiply each entry by `1 + sum of overlapping weights`, clamped so a
    /// total weight of -1 zeroes the entry. Renormalizes afterwards; if the
    /// curve becomes identically zero it is marked suppressed instead.
    pub fn apply_weights(&mut self, weights: &[SlotWeight]) {
        if weights.is_empty() {
            return;
        }
        let mut omega = vec![0.0f64; SLOTS_PER_WEEK as usize];
        for w in weights {
            for_each_window_slot(w.start_slot, w.end_slot, |slot| {
                omega[slot as usize] += w.magnitude;
            });
        }
        for (p, w) in self.probs.iter_mut().zip(omega.iter()) {
            *p *= (1.0 + w).max(0.0);
        }
        self.normalize();
    }

    /// Zero out every entry outside the closed wrapping window, then
    /// renormalize (or mark suppressed if nothing remains).
    pub fn clip_to_window(&mut self, start_slot: u32, end_slot: u32) {
        let mut keep = vec![false; SLOTS_PER_WEEK as usize];
        for_each_window_slot(start_slot, end_slot, |slot| keep[slot as usize] = true);
        for (p, keep) in self.probs.iter_mut().zip(keep.iter()) {
            if !keep {
                *p = 0.0;
            }
        }
        self.normalize();
    }

    /// Entropy-based confidence: `1 - H(p) / ln(10080)`. Uniform scores 0,
    /// a delta distribution scores 1. A suppressed curve scores 0.
    pub fn confidence(&self) -> f64 {
        if self.suppressed {
            return 0.0;
        }
        let mut entropy = 0.0;
        for &p in &self.probs {
            if p > 0.0 {
                entropy -= p * p.ln();
            }
        }
        (1.0 - entropy / f64::from(SLOTS_PER_WEEK).ln()).clamp(0.0, 1.0)
    }

    /// Pack the curve into little-endian `f32` bytes for the feature cache.
    pub fn to_packed_f32(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.probs.len() * 4);
        for &p in &self.probs {
            out.extend_from_slice(&(p as f32).to_le_bytes());
        }
        out
    }

    /// Rehydrate from packed little-endian `f32` bytes.
    pub fn from_packed_f32(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() != SLOTS_PER_WEEK as usize * 4 {
            anyhow::bail!(
                "packed curve must be {} bytes, got {}",
                SLOTS_PER_WEEK as usize * 4,
                bytes.len()
            );
        }
        let probs: Vec<f64> = bytes
            .chunks_exact(4)
            .map(|c| f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect();
        let suppressed = probs.iter().all(|&p| p <= 0.0);
        Ok(Self { probs, suppressed })
    }

    /// Clamp sub-floor values to zero and rescale so the total is 1. An
    /// identically zero curve is marked suppressed and left at zero.
    fn normalize(&mut self) {
        for p in self.probs.iter_mut() {
            if !p.is_finite() || *p < CLAMP_FLOOR {
                *p = 0.0;
            }
        }
        let total: f64 = self.probs.iter().sum();
        if total <= 0.0 {
            self.suppressed = true;
            return;
        }
        for p in self.probs.iter_mut() {
            *p /= total;
        }
        self.suppressed = false;
    }
}

/// Visit every slot of the closed window `[start, end]`, wrapping the week
/// when `end < start`.
fn for_each_window_slot(start: u32, end: u32, mut f: impl FnMut(u32)) {
    let start = start % SLOTS_PER_WEEK;
    let end = end % SLOTS_PER_WEEK;
    let span = if end >= start {
        end - start + 1
    } else {
        SLOTS_PER_WEEK - start + end + 1
    };
    for i in 0..span {
        f((start + i) % SLOTS_PER_WEEK);
    }
}

/// Circular Gaussian convolution over the week so Sunday night smooths into
/// Monday morning. Kernel is truncated at three sigma.
fn gaussian_blur_circular(values: &[f64], sigma: f64) -> Vec<f64> {
    if sigma <= 0.0 {
        return values.to_vec();
    }
    let n = values.len();
    let radius = (3.0 * sigma).ceil() as i64;
    let mut kernel = Vec::with_capacity((2 * radius + 1) as usize);
    for d in -radius..=radius {
        let x = d as f64;
        kernel.push((-x * x / (2.0 * sigma * sigma)).exp());
    }
    let kernel_sum: f64 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= kernel_sum;
    }

    let mut out = vec![0.0f64; n];
    for (slot, o) in out.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (ki, k) in kernel.iter().enumerate() {
            let d = ki as i64 - radius;
            let src = (slot as i64 + d).rem_euclid(n as i64) as usize;
            acc += k * values[src];
        }
        *o = acc;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minute_grid::{datetime_to_slot, SLOTS_PER_WEEK};
    use chrono::TimeZone;

    const N: usize = SLOTS_PER_WEEK as usize;

    fn assert_normalized(curve: &ContinuousCurve) {
        assert!((curve.sum() - 1.0).abs() <= 1e-6, "sum = {}", curve.sum());
    }

    #[test]
    fn test_uniform_curve() {
        let curve = ContinuousCurve::uniform();
        assert_normalized(&curve);
        assert!((curve.get(0) - 1.0 / 10_080.0).abs() < 1e-12);
        assert!(curve.confidence().abs() < 1e-9);
        assert!(!curve.is_suppressed());
    }

    #[test]
    fn test_delta_confidence_near_one() {
        let mut probs = vec![0.0; N];
        probs[540] = 1.0;
        let curve = ContinuousCurve::from_probabilities(probs).unwrap();
        assert!(curve.confidence() > 0.999);
    }

    #[test]
    fn test_histogram_peak_stays_near_sample() {
        let mut counts = vec![0.0; N];
        counts[540] = 1.0; // a single click at Monday 09:00
        let curve = ContinuousCurve::from_histogram(&counts, 1.0, 30.0).unwrap();
        assert_normalized(&curve);

        let peak = curve.peak_in_window(0, SLOTS_PER_WEEK - 1);
        assert!(
            (510..=570).contains(&peak),
            "peak {} outside [k-sigma, k+sigma]",
            peak
        );
        let confidence = curve.confidence();
        assert!(confidence > 0.0 && confidence < 0.5);
    }

    #[test]
    fn test_circular_smoothing_crosses_week_boundary() {
        // A click at Sunday 23:59 must lend density to Monday 00:00.
        let sunday_2359 = datetime_to_slot(
            chrono::Utc.with_ymd_and_hms(2024, 1, 7, 23, 59, 0).unwrap(),
        );
        let mut counts = vec![0.0; N];
        counts[sunday_2359 as usize] = 10.0;
        let curve = ContinuousCurve::from_histogram(&counts, 1.0, 30.0).unwrap();

        let uniform_level = 1.0 / 10_080.0;
        assert!(curve.get(0) > uniform_level * 2.0);
        assert!(curve.get(5) > uniform_level);
    }

    #[test]
    fn test_peak_in_wrapping_window_prefers_lower_slot_on_tie() {
        let curve = ContinuousCurve::uniform();
        // Wrapping window: Sunday evening through Monday morning.
        assert_eq!(curve.peak_in_window(10_000, 100), 0);
        // Non-wrapping uniform window: first slot wins.
        assert_eq!(curve.peak_in_window(540, 660), 540);
    }

    #[test]
    fn test_interpolate_between_slots() {
        let mut probs = vec![0.0; N];
        probs[100] = 0.6;
        probs[101] = 0.4;
        let curve = ContinuousCurve::from_probabilities(probs).unwrap();
        let mid = curve.interpolate(100.5);
        assert!((mid - 0.5).abs() < 1e-9);
        // Wraps: interpolating just past the last slot blends with slot 0.
        let wrapped = curve.interpolate(f64::from(SLOTS_PER_WEEK) - 0.5);
        assert!((wrapped - curve.get(SLOTS_PER_WEEK - 1) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_apply_weights_boosts_window() {
        let mut curve = ContinuousCurve::uniform();
        curve.apply_weights(&[SlotWeight {
            start_slot: 540,
            end_slot: 600,
            magnitude: 1.43,
        }]);
        assert_normalized(&curve);
        assert!(curve.get(570) > curve.get(100));
        assert_eq!(curve.peak_in_window(0, SLOTS_PER_WEEK - 1), 540);
    }

    #[test]
    fn test_weight_of_minus_one_zeroes_entries() {
        let mut curve = ContinuousCurve::uniform();
        curve.apply_weights(&[SlotWeight {
            start_slot: 0,
            end_slot: 100,
            magnitude: -1.0,
        }]);
        assert_normalized(&curve);
        assert_eq!(curve.get(50), 0.0);
        assert!(curve.get(101) > 0.0);
    }

    #[test]
    fn test_full_suppression_marks_curve() {
        let mut curve = ContinuousCurve::uniform();
        curve.apply_weights(&[SlotWeight {
            start_slot: 0,
            end_slot: SLOTS_PER_WEEK - 1,
            magnitude: -1.0,
        }]);
        assert!(curve.is_suppressed());
        assert_eq!(curve.sum(), 0.0);
        assert_eq!(curve.confidence(), 0.0);
    }

    #[test]
    fn test_clip_to_window() {
        let mut curve = ContinuousCurve::uniform();
        curve.clip_to_window(480, 600);
        assert_normalized(&curve);
        assert_eq!(curve.get(479), 0.0);
        assert_eq!(curve.get(601), 0.0);
        assert!(curve.get(540) > 0.0);
    }

    #[test]
    fn test_packed_roundtrip_is_stable() {
        let mut counts = vec![0.0; N];
        counts[540] = 50.0;
        counts[9_000] = 3.0;
        let curve = ContinuousCurve::from_histogram(&counts, 1.0, 30.0).unwrap();

        let once = ContinuousCurve::from_packed_f32(&curve.to_packed_f32()).unwrap();
        let twice = ContinuousCurve::from_packed_f32(&once.to_packed_f32()).unwrap();
        // f32 quantization is idempotent: the second roundtrip is bit-exact.
        assert_eq!(once.probabilities(), twice.probabilities());
        assert!((once.sum() - 1.0).abs() <= 1e-6);
    }

    #[test]
    fn test_from_packed_rejects_wrong_length() {
        assert!(ContinuousCurve::from_packed_f32(&[0u8; 16]).is_err());
    }
}
