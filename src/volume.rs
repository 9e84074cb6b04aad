use crate::interpolator::Interpolator;

use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::Zip;
use ndarray::s;

/// Dense scalar volume with voxel spacing and observed value range.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeData {
    /// Indexed (z, y, x).
    pub data: Array3<f32>,
    /// Voxel spacing in mm as (x, y, z).
    pub spacing: (f32, f32, f32),
    /// Observed (min, max).
    pub range: (f32, f32),
}

impl Default for VolumeData {
    fn default() -> Self {
        Self {
            data: Array3::zeros((0, 0, 0)),
            spacing: (1.0, 1.0, 1.0),
            range: (0.0, 0.0),
        }
    }
}

impl VolumeData {
    /// Builds a volume, computing its value range.
    pub fn new(data: Array3<f32>, spacing: (f32, f32, f32)) -> Self {
        let range = data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let range = if range.0 <= range.1 { range } else { (0.0, 0.0) };
        Self::with_range(data, spacing, range)
    }

    pub fn with_range(data: Array3<f32>, spacing: (f32, f32, f32), range: (f32, f32)) -> Self {
        Self {
            data,
            spacing,
            range,
        }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn width(&self) -> usize {
        self.data.dim().2
    }

    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    pub fn depth(&self) -> usize {
        self.data.dim().0
    }

    pub fn voxel_count(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Host memory held by the voxels.
    pub fn estimated_bytes(&self) -> u64 {
        (self.voxel_count() * size_of::<f32>()) as u64
    }

    /// Size in mm along (x, y, z).
    pub fn physical_extent(&self) -> [f32; 3] {
        [
            self.width() as f32 * self.spacing.0,
            self.height() as f32 * self.spacing.1,
            self.depth() as f32 * self.spacing.2,
        ]
    }

    /// Half sizes of the volume's bounding box once scaled so that the
    /// longest physical axis has length 1.
    pub fn box_half_extents(&self) -> [f32; 3] {
        let extent = self.physical_extent();
        let longest = extent[0].max(extent[1]).max(extent[2]);
        if longest <= 0.0 {
            return [0.5; 3];
        }
        extent.map(|e| 0.5 * e / longest)
    }

    /// Longest axis in voxels.
    pub fn max_dimension(&self) -> usize {
        let (d, h, w) = self.dim();
        d.max(h).max(w)
    }

    /// Trilinear sample at voxel coordinates (x, y, z), clamped at the bounds.
    #[inline]
    pub fn sample(&self, x: f32, y: f32, z: f32) -> f32 {
        Interpolator::trilinear_interpolate(&self.data.view(), z, y, x)
    }

    /// Maps `value` into [0, 1] against the observed range.
    #[inline]
    pub fn normalize(&self, value: f32) -> f32 {
        let (min, max) = self.range;
        let span = if max > min { max - min } else { 1.0 };
        ((value - min) / span).clamp(0.0, 1.0)
    }

    pub fn get_slice(&self, z: usize) -> Option<ArrayView2<'_, f32>> {
        (z < self.depth()).then(|| self.data.slice(s![z, .., ..]))
    }

    /// Nearest-neighbour reduction by an integer factor per axis. The value
    /// range of the full volume is kept so that transfer functions line up.
    pub fn downsample(&self, factor: usize) -> VolumeData {
        if factor <= 1 {
            return self.clone();
        }
        let (d, h, w) = self.dim();
        let reduced = (d.div_ceil(factor), h.div_ceil(factor), w.div_ceil(factor));
        let mut data = Array3::<f32>::zeros(reduced);
        Zip::indexed(&mut data).par_for_each(|(z, y, x), voxel| {
            *voxel = self.data[[z * factor, y * factor, x * factor]];
        });
        let f = factor as f32;
        VolumeData::with_range(
            data,
            (self.spacing.0 * f, self.spacing.1 * f, self.spacing.2 * f),
            self.range,
        )
    }

    /// Voxels normalized to [0, 1], z-major.
    pub fn normalized_voxels(&self) -> impl Iterator<Item = f32> + '_ {
        self.data.iter().map(|&v| self.normalize(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp(d: usize, h: usize, w: usize) -> VolumeData {
        VolumeData::new(
            Array3::from_shape_fn((d, h, w), |(z, y, x)| (z * 100 + y * 10 + x) as f32),
            (0.5, 0.5, 2.0),
        )
    }

    #[test]
    fn test_range_is_observed() {
        let volume = ramp(2, 3, 4);
        assert_eq!(volume.range, (0.0, 123.0));
        assert_eq!((volume.width(), volume.height(), volume.depth()), (4, 3, 2));
        assert_eq!(volume.estimated_bytes(), 2 * 3 * 4 * 4);
    }

    #[test]
    fn test_box_half_extents_scale_longest_axis_to_one() {
        let volume = ramp(2, 3, 4);
        // physical extent 2 x 1.5 x 4 mm
        let half = volume.box_half_extents();
        assert_relative_eq!(half[0], 0.25);
        assert_relative_eq!(half[1], 0.1875);
        assert_relative_eq!(half[2], 0.5);
    }

    #[test]
    fn test_downsample_keeps_range() {
        let volume = ramp(3, 5, 5);
        let half = volume.downsample(2);
        assert_eq!(half.dim(), (2, 3, 3));
        assert_eq!(half.range, volume.range);
        assert_eq!(half.data[[1, 2, 2]], volume.data[[2, 4, 4]]);
        assert_eq!(half.spacing, (1.0, 1.0, 4.0));
        assert_eq!(volume.downsample(1), volume);
    }

    #[test]
    fn test_downsample_picks_every_nth_voxel() {
        let volume = ramp(7, 9, 5);
        let third = volume.downsample(3);
        let expected = Array3::from_shape_fn((3, 3, 2), |(z, y, x)| volume.data[[z * 3, y * 3, x * 3]]);
        assert_eq!(third.data, expected);
    }

    #[test]
    fn test_sample_matches_voxels() {
        let volume = ramp(2, 2, 2);
        assert_relative_eq!(volume.sample(1.0, 1.0, 1.0), 111.0);
        assert_relative_eq!(volume.sample(0.5, 0.0, 0.0), 0.5);
    }

    #[test]
    fn test_normalize_flat_volume() {
        let volume = VolumeData::new(Array3::from_elem((1, 2, 2), 7.0), (1.0, 1.0, 1.0));
        assert_relative_eq!(volume.normalize(7.0), 0.0);
        assert!(volume.normalized_voxels().all(|v| v == 0.0));
    }
}
