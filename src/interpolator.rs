use ndarray::ArrayView3;

pub(crate) struct Interpolator;

impl Interpolator {
    /// Trilinear sample at voxel coordinates, clamped to the volume bounds.
    ///
    /// `volume` is indexed (z, y, x).
    #[inline]
    pub(crate) fn trilinear_interpolate(volume: &ArrayView3<f32>, z: f32, y: f32, x: f32) -> f32 {
        let (depth, height, width) = volume.dim();
        if depth == 0 || height == 0 || width == 0 {
            return 0.0;
        }

        let z = z.clamp(0.0, (depth - 1) as f32);
        let y = y.clamp(0.0, (height - 1) as f32);
        let x = x.clamp(0.0, (width - 1) as f32);

        let z0 = z.floor() as usize;
        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let z1 = (z0 + 1).min(depth - 1);
        let y1 = (y0 + 1).min(height - 1);
        let x1 = (x0 + 1).min(width - 1);

        let dz = z - z0 as f32;
        let dy = y - y0 as f32;
        let dx = x - x0 as f32;
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;

        let plane = |zi: usize| {
            let v00 = volume[[zi, y0, x0]];
            let v01 = volume[[zi, y0, x1]];
            let v10 = volume[[zi, y1, x0]];
            let v11 = volume[[zi, y1, x1]];

            let v0 = v00.mul_add(one_minus_dx, v01 * dx);
            let v1 = v10.mul_add(one_minus_dx, v11 * dx);
            v0.mul_add(one_minus_dy, v1 * dy)
        };

        let front = plane(z0);
        if z1 == z0 || dz == 0.0 {
            return front;
        }
        front.mul_add(1.0 - dz, plane(z1) * dz)
    }
}
