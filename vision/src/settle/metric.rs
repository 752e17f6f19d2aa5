use frame_settle_common::config::SettleMethod;

use super::raster::{CircleMask, Raster};

/// Norm and normalization of each settle method.
pub trait DifferenceMetric {
    /// Norm of `a - b`, or of `a` alone when `b` is `None`, over the pixels
    /// inside `mask`.
    fn norm(&self, a: &Raster, b: Option<&Raster>, mask: Option<&CircleMask>) -> f64;

    /// Largest possible norm for a raster of this geometry.
    fn scale(&self, raster: &Raster) -> f64;

    /// Percent difference between two prepared frames.
    ///
    /// With `contrast_enhance > 0` the score is divided, in blend, by the
    /// relative range of `reference`, so dim scenes do not hide movement.
    fn difference(
        &self,
        reference: &Raster,
        current: &Raster,
        mask: Option<&CircleMask>,
        contrast_enhance: f64,
    ) -> f64 {
        let scale = self.scale(current);
        if scale <= 0.0 {
            return 0.0;
        }
        let mut result = self.norm(reference, Some(current), mask) / scale;
        if contrast_enhance != 0.0 {
            let range = self.norm(reference, None, mask) / scale;
            if range != 0.0 {
                result *= contrast_enhance / range + (1.0 - contrast_enhance);
            }
        }
        result * 100.0
    }
}

impl DifferenceMetric for SettleMethod {
    fn norm(&self, a: &Raster, b: Option<&Raster>, mask: Option<&CircleMask>) -> f64 {
        let c = a.channels.max(1);
        let mask = mask.filter(|m| m.fits(a));
        let mut max = 0.0f64;
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        for (i, v) in a.data.iter().enumerate() {
            if mask.is_some_and(|m| !m.contains(i / c)) {
                continue;
            }
            let d = match b {
                Some(b) => (*v as f64 - b.data.get(i).copied().unwrap_or(0) as f64).abs(),
                None => *v as f64,
            };
            max = max.max(d);
            sum += d;
            sum_sq += d * d;
        }
        match self {
            SettleMethod::FixedTime => 0.0,
            SettleMethod::Maximum => max,
            SettleMethod::Mean => sum,
            SettleMethod::Euclidean => sum_sq.sqrt(),
            SettleMethod::Square => sum_sq,
        }
    }

    fn scale(&self, raster: &Raster) -> f64 {
        let n = (raster.pixel_count() * raster.channels) as f64;
        match self {
            SettleMethod::FixedTime => 0.0,
            SettleMethod::Maximum => 255.0,
            SettleMethod::Mean => 255.0 * n,
            SettleMethod::Euclidean => 255.0 * n.sqrt(),
            SettleMethod::Square => 255.0 * 255.0 * n,
        }
    }
}
