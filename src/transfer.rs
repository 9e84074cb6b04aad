//! Transfer functions: normalized intensity to color and opacity.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpacityPoint {
    pub intensity: f32,
    pub opacity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorPoint {
    pub intensity: f32,
    pub color: [f32; 3],
}

#[derive(Deserialize)]
struct RawTransferFunction {
    #[serde(default)]
    opacity: Vec<OpacityPoint>,
    #[serde(default)]
    color: Vec<ColorPoint>,
}

impl From<RawTransferFunction> for TransferFunction {
    fn from(raw: RawTransferFunction) -> Self {
        TransferFunction::new(raw.opacity, raw.color)
    }
}

/// Piecewise linear opacity and color curves over intensities in [0, 1].
///
/// Points are kept sorted by intensity with every component clamped to
/// [0, 1]. An empty opacity curve is fully transparent; an empty color curve
/// is a gray ramp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawTransferFunction")]
pub struct TransferFunction {
    opacity: Vec<OpacityPoint>,
    color: Vec<ColorPoint>,
}

impl Default for TransferFunction {
    fn default() -> Self {
        Self::grayscale()
    }
}

impl TransferFunction {
    pub fn new(opacity: Vec<OpacityPoint>, color: Vec<ColorPoint>) -> Self {
        let mut opacity: Vec<_> = opacity
            .into_iter()
            .filter(|p| p.intensity.is_finite() && p.opacity.is_finite())
            .map(|p| OpacityPoint {
                intensity: p.intensity.clamp(0.0, 1.0),
                opacity: p.opacity.clamp(0.0, 1.0),
            })
            .collect();
        let mut color: Vec<_> = color
            .into_iter()
            .filter(|p| p.intensity.is_finite() && p.color.iter().all(|c| c.is_finite()))
            .map(|p| ColorPoint {
                intensity: p.intensity.clamp(0.0, 1.0),
                color: p.color.map(|c| c.clamp(0.0, 1.0)),
            })
            .collect();
        opacity.sort_by(|a, b| a.intensity.total_cmp(&b.intensity));
        color.sort_by(|a, b| a.intensity.total_cmp(&b.intensity));
        Self { opacity, color }
    }

    /// Linear ramp: black and transparent at 0, white and opaque at 1.
    pub fn grayscale() -> Self {
        Self::new(
            vec![
                OpacityPoint { intensity: 0.0, opacity: 0.0 },
                OpacityPoint { intensity: 1.0, opacity: 1.0 },
            ],
            vec![
                ColorPoint { intensity: 0.0, color: [0.0, 0.0, 0.0] },
                ColorPoint { intensity: 1.0, color: [1.0, 1.0, 1.0] },
            ],
        )
    }

    /// Constant color and opacity at every intensity.
    pub fn constant(color: [f32; 3], opacity: f32) -> Self {
        Self::new(
            vec![OpacityPoint { intensity: 0.0, opacity }],
            vec![ColorPoint { intensity: 0.0, color }],
        )
    }

    pub fn ct_bone() -> Self {
        Self::new(
            vec![
                OpacityPoint { intensity: 0.0, opacity: 0.0 },
                OpacityPoint { intensity: 0.45, opacity: 0.0 },
                OpacityPoint { intensity: 0.6, opacity: 0.6 },
                OpacityPoint { intensity: 1.0, opacity: 0.9 },
            ],
            vec![
                ColorPoint { intensity: 0.0, color: [0.0, 0.0, 0.0] },
                ColorPoint { intensity: 0.45, color: [0.8, 0.5, 0.3] },
                ColorPoint { intensity: 0.7, color: [1.0, 0.95, 0.85] },
                ColorPoint { intensity: 1.0, color: [1.0, 1.0, 1.0] },
            ],
        )
    }

    pub fn ct_soft_tissue() -> Self {
        Self::new(
            vec![
                OpacityPoint { intensity: 0.0, opacity: 0.0 },
                OpacityPoint { intensity: 0.2, opacity: 0.0 },
                OpacityPoint { intensity: 0.35, opacity: 0.15 },
                OpacityPoint { intensity: 0.5, opacity: 0.3 },
                OpacityPoint { intensity: 1.0, opacity: 0.4 },
            ],
            vec![
                ColorPoint { intensity: 0.0, color: [0.0, 0.0, 0.0] },
                ColorPoint { intensity: 0.3, color: [0.7, 0.3, 0.25] },
                ColorPoint { intensity: 0.5, color: [0.95, 0.65, 0.55] },
                ColorPoint { intensity: 1.0, color: [1.0, 0.95, 0.9] },
            ],
        )
    }

    /// Built-in preset by name: `grayscale`, `ct-bone` or `ct-soft-tissue`.
    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "grayscale" | "gray" => Some(Self::grayscale()),
            "ct-bone" | "bone" => Some(Self::ct_bone()),
            "ct-soft-tissue" | "soft-tissue" => Some(Self::ct_soft_tissue()),
            _ => None,
        }
    }

    /// # Errors
    ///
    /// Returns the JSON error when `json` does not describe a transfer function.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn opacity_points(&self) -> &[OpacityPoint] {
        &self.opacity
    }

    pub fn color_points(&self) -> &[ColorPoint] {
        &self.color
    }

    pub fn opacity_at(&self, t: f32) -> f32 {
        if self.opacity.is_empty() {
            return 0.0;
        }
        interpolate(&self.opacity, t, |p| p.intensity, |p| [p.opacity])[0]
    }

    pub fn color_at(&self, t: f32) -> [f32; 3] {
        if self.color.is_empty() {
            let t = t.clamp(0.0, 1.0);
            return [t, t, t];
        }
        interpolate(&self.color, t, |p| p.intensity, |p| p.color)
    }

    /// (r, g, b, a) at normalized intensity `t`.
    pub fn sample(&self, t: f32) -> [f32; 4] {
        let [r, g, b] = self.color_at(t);
        [r, g, b, self.opacity_at(t)]
    }

    /// `entries` evenly spaced samples over [0, 1].
    pub fn bake(&self, entries: usize) -> Vec<[f32; 4]> {
        match entries {
            0 => Vec::new(),
            1 => vec![self.sample(0.0)],
            n => (0..n)
                .map(|i| self.sample(i as f32 / (n - 1) as f32))
                .collect(),
        }
    }
}

fn interpolate<P, const N: usize>(
    points: &[P],
    t: f32,
    key: impl Fn(&P) -> f32,
    value: impl Fn(&P) -> [f32; N],
) -> [f32; N] {
    let t = if t.is_nan() { 0.0 } else { t };
    let upper = points.partition_point(|p| key(p) <= t);
    if upper == 0 {
        return value(&points[0]);
    }
    if upper == points.len() {
        return value(&points[points.len() - 1]);
    }

    let (a, b) = (&points[upper - 1], &points[upper]);
    let span = key(b) - key(a);
    let f = if span > 0.0 { (t - key(a)) / span } else { 1.0 };
    let (va, vb) = (value(a), value(b));
    std::array::from_fn(|i| (vb[i] - va[i]).mul_add(f, va[i]))
}
