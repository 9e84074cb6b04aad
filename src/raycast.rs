//! Software ray casting and the backend interface shared with the GPU path.

use crate::camera::{Camera, Ray, Vec3};
use crate::enums::RenderMode;
use crate::error::RenderError;
use crate::raster::RasterImage;
use crate::settings::{RenderSettings, ResourceLimits};
use crate::transfer::TransferFunction;
use crate::volume::VolumeData;

use rayon::prelude::*;
use std::sync::Arc;

/// Accumulated opacity at which compositing stops.
pub const EARLY_EXIT_ALPHA: f32 = 0.95;

/// Everything needed to draw one frame besides the volume.
#[derive(Debug, Clone, Copy)]
pub struct FrameRequest<'a> {
    pub camera: &'a Camera,
    pub transfer: &'a TransferFunction,
    /// Intensities mapped to 0 and 1 before the transfer function lookup.
    pub intensity_range: (f32, f32),
    pub settings: &'a RenderSettings,
    pub width: u32,
    pub height: u32,
}

impl FrameRequest<'_> {
    #[inline]
    pub fn normalize(&self, value: f32) -> f32 {
        let (low, high) = self.intensity_range;
        let span = if high > low { high - low } else { 1.0 };
        ((value - low) / span).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaySample {
    /// Premultiplied (r, g, b, a) before brightness and contrast.
    pub color: [f32; 4],
    /// Ray parameter of the isosurface hit.
    pub hit_depth: Option<f32>,
}

impl RaySample {
    const BACKGROUND: RaySample = RaySample {
        color: [0.0, 0.0, 0.0, 0.0],
        hit_depth: None,
    };
}

/// Entry and exit parameters of `ray` through the box `[-half, half]`.
pub fn intersect_box(ray: &Ray, half: [f32; 3]) -> Option<(f32, f32)> {
    let mut t_near = f32::NEG_INFINITY;
    let mut t_far = f32::INFINITY;
    for axis in 0..3 {
        let origin = ray.origin.component(axis);
        let direction = ray.direction.component(axis);
        if direction.abs() < 1e-9 {
            if origin < -half[axis] || origin > half[axis] {
                return None;
            }
            continue;
        }
        let inv = 1.0 / direction;
        let t0 = (-half[axis] - origin) * inv;
        let t1 = (half[axis] - origin) * inv;
        t_near = t_near.max(t0.min(t1));
        t_far = t_far.min(t0.max(t1));
    }
    let t_near = t_near.max(0.0);
    (t_far > t_near).then_some((t_near, t_far))
}

/// Reference ray caster over a [`VolumeData`].
pub struct RayCaster<'v> {
    volume: &'v VolumeData,
    half: [f32; 3],
    /// Box units per voxel of the longest axis.
    voxel_size: f32,
}

impl<'v> RayCaster<'v> {
    pub fn new(volume: &'v VolumeData) -> Self {
        Self {
            volume,
            half: volume.box_half_extents(),
            voxel_size: 1.0 / volume.max_dimension().max(1) as f32,
        }
    }

    /// Box position to voxel coordinates (x, y, z); box faces map to the
    /// centers of the outermost voxels.
    #[inline]
    fn to_voxel(&self, p: Vec3) -> (f32, f32, f32) {
        let (d, h, w) = self.volume.dim();
        let scale = |value: f32, axis: usize, count: usize| {
            let unit = (value + self.half[axis]) / (2.0 * self.half[axis]);
            unit * count.saturating_sub(1) as f32
        };
        (scale(p.x, 0, w), scale(p.y, 1, h), scale(p.z, 2, d))
    }

    #[inline]
    fn sample_at(&self, p: Vec3) -> f32 {
        let (x, y, z) = self.to_voxel(p);
        self.volume.sample(x, y, z)
    }

    /// Marches one ray through the volume.
    pub fn cast(&self, ray: &Ray, request: &FrameRequest) -> RaySample {
        let Some((t_near, t_far)) = intersect_box(ray, self.half) else {
            return RaySample::BACKGROUND;
        };
        let settings = request.settings;
        let step = settings.step_size.max(1e-3) * self.voxel_size;
        let steps = (((t_far - t_near) / step).ceil() as u32).clamp(1, settings.max_samples.max(1));

        match settings.mode {
            RenderMode::Mip => {
                let mut max = 0.0f32;
                for i in 0..steps {
                    let t = (i as f32 + 0.5).mul_add(step, t_near);
                    max = max.max(request.normalize(self.sample_at(ray.at(t))));
                }
                RaySample {
                    color: [max, max, max, 1.0],
                    hit_depth: None,
                }
            }
            RenderMode::Composite => {
                let mut color = [0.0f32; 3];
                let mut alpha = 0.0f32;
                for i in 0..steps {
                    let t = (i as f32 + 0.5).mul_add(step, t_near);
                    let intensity = request.normalize(self.sample_at(ray.at(t)));
                    let [r, g, b, a] = request.transfer.sample(intensity);
                    let a = (a * settings.opacity).clamp(0.0, 1.0);
                    let weight = a * (1.0 - alpha);
                    color[0] += r * weight;
                    color[1] += g * weight;
                    color[2] += b * weight;
                    alpha += weight;
                    if alpha >= EARLY_EXIT_ALPHA {
                        break;
                    }
                }
                RaySample {
                    color: [color[0], color[1], color[2], alpha],
                    hit_depth: None,
                }
            }
            RenderMode::Isosurface => {
                for i in 0..steps {
                    let t = (i as f32 + 0.5).mul_add(step, t_near);
                    let intensity = request.normalize(self.sample_at(ray.at(t)));
                    if intensity >= settings.iso_threshold {
                        let [r, g, b] = request.transfer.color_at(intensity);
                        return RaySample {
                            color: [r, g, b, 1.0],
                            hit_depth: Some(t),
                        };
                    }
                }
                RaySample::BACKGROUND
            }
        }
    }

    /// Renders a full frame, one scanline per rayon task.
    pub fn render(&self, request: &FrameRequest) -> RasterImage {
        let (width, height) = (request.width, request.height);
        let settings = request.settings;
        let pixels: Vec<u8> = (0..height)
            .into_par_iter()
            .flat_map_iter(|y| {
                (0..width).flat_map(move |x| {
                    let ray = request.camera.ray(x, y, width, height);
                    let [r, g, b, a] = self.cast(&ray, request).color;
                    if a <= 0.0 {
                        return [0, 0, 0, u8::MAX];
                    }
                    [
                        to_byte(settings.adjust(r)),
                        to_byte(settings.adjust(g)),
                        to_byte(settings.adjust(b)),
                        u8::MAX,
                    ]
                })
            })
            .collect();

        RasterImage {
            width,
            height,
            pixels,
        }
    }
}

#[inline]
fn to_byte(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// A ray casting implementation the viewer can drive.
pub trait RenderBackend {
    fn name(&self) -> &str;

    /// Ceilings a volume must fit before [`RenderBackend::upload`].
    fn limits(&self) -> ResourceLimits;

    /// Memory the backend will hold for `volume`.
    fn estimated_memory(&self, volume: &VolumeData) -> u64;

    /// Replaces the resident volume.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::TooLarge`] or [`RenderError::DeviceLost`].
    fn upload(&mut self, volume: Arc<VolumeData>) -> Result<(), RenderError>;

    /// # Errors
    ///
    /// Returns [`RenderError::NoVolume`] before the first upload and
    /// [`RenderError::DeviceLost`] once the device is gone.
    fn render(&mut self, request: &FrameRequest) -> Result<RasterImage, RenderError>;

    fn is_device_lost(&self) -> bool;

    /// Re-creates device resources after a loss. The volume must be uploaded
    /// again afterwards.
    ///
    /// # Errors
    ///
    /// Returns error if no device is available yet.
    fn recover(&mut self) -> Result<(), RenderError>;

    /// Frees every resource. Safe to call more than once.
    fn release(&mut self);
}

impl<B: RenderBackend + ?Sized> RenderBackend for Box<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn limits(&self) -> ResourceLimits {
        (**self).limits()
    }

    fn estimated_memory(&self, volume: &VolumeData) -> u64 {
        (**self).estimated_memory(volume)
    }

    fn upload(&mut self, volume: Arc<VolumeData>) -> Result<(), RenderError> {
        (**self).upload(volume)
    }

    fn render(&mut self, request: &FrameRequest) -> Result<RasterImage, RenderError> {
        (**self).render(request)
    }

    fn is_device_lost(&self) -> bool {
        (**self).is_device_lost()
    }

    fn recover(&mut self) -> Result<(), RenderError> {
        (**self).recover()
    }

    fn release(&mut self) {
        (**self).release();
    }
}

/// CPU backend built on [`RayCaster`].
#[derive(Debug, Default)]
pub struct SoftwareBackend {
    volume: Option<Arc<VolumeData>>,
    limits: ResourceLimits,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: ResourceLimits) -> Self {
        Self {
            volume: None,
            limits,
        }
    }
}

impl RenderBackend for SoftwareBackend {
    fn name(&self) -> &str {
        "software"
    }

    fn limits(&self) -> ResourceLimits {
        self.limits
    }

    fn estimated_memory(&self, volume: &VolumeData) -> u64 {
        volume.estimated_bytes()
    }

    fn upload(&mut self, volume: Arc<VolumeData>) -> Result<(), RenderError> {
        self.limits
            .check(volume.dim(), self.estimated_memory(&volume))?;
        self.volume = Some(volume);
        Ok(())
    }

    fn render(&mut self, request: &FrameRequest) -> Result<RasterImage, RenderError> {
        let volume = self.volume.as_ref().ok_or(RenderError::NoVolume)?;
        Ok(RayCaster::new(volume).render(request))
    }

    fn is_device_lost(&self) -> bool {
        false
    }

    fn recover(&mut self) -> Result<(), RenderError> {
        Ok(())
    }

    fn release(&mut self) {
        self.volume = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use assert_matches::assert_matches;
    use ndarray::Array3;

    const SIZE: u32 = 33;

    fn request<'a>(
        camera: &'a Camera,
        transfer: &'a TransferFunction,
        settings: &'a RenderSettings,
        range: (f32, f32),
    ) -> FrameRequest<'a> {
        FrameRequest {
            camera,
            transfer,
            intensity_range: range,
            settings,
            width: SIZE,
            height: SIZE,
        }
    }

    #[test]
    fn test_uniform_volume_composites_white_from_any_angle() {
        let volume = VolumeData::new(Array3::from_elem((8, 8, 8), 100.0), (1.0, 1.0, 1.0));
        let transfer = TransferFunction::constant([1.0, 1.0, 1.0], 1.0);
        let settings = RenderSettings::default();
        let caster = RayCaster::new(&volume);

        let mut camera = Camera::default();
        for (dx, dy) in [(0.0, 0.0), (0.8, 0.0), (0.3, 1.1), (2.5, -0.7)] {
            camera.orbit(dx, dy);
            let image = caster.render(&request(&camera, &transfer, &settings, volume.range));
            let center = SIZE / 2;
            for (x, y) in [(center, center), (center - 2, center + 2), (center + 3, center - 1)] {
                assert_eq!(image.pixel(x, y), [255, 255, 255, 255], "pixel ({x}, {y}) after orbit ({dx}, {dy})");
            }
        }
    }

    #[test]
    fn test_mip_shows_single_bright_voxel() {
        let mut data = Array3::zeros((9, 9, 9));
        data[[4, 4, 4]] = 1000.0;
        let volume = VolumeData::new(data, (1.0, 1.0, 1.0));
        let transfer = TransferFunction::grayscale();
        let settings = RenderSettings::default().with_mode(RenderMode::Mip);
        let camera = Camera::default();

        let image = RayCaster::new(&volume).render(&request(&camera, &transfer, &settings, volume.range));
        let center = image.pixel(SIZE / 2, SIZE / 2);
        assert!(center[0] > 0, "center pixel {center:?}");
        assert_eq!(image.pixel(0, 0), [0, 0, 0, 255]);
        assert_eq!(image.pixel(SIZE / 2, 2), [0, 0, 0, 255]);
    }

    #[test]
    fn test_isosurface_hits_step_boundary() {
        // front half (z < 16) is 0, back half is 1
        let volume = VolumeData::new(
            Array3::from_shape_fn((32, 8, 8), |(z, _, _)| if z < 16 { 0.0 } else { 1.0 }),
            (1.0, 1.0, 1.0),
        );
        let transfer = TransferFunction::constant([1.0, 0.0, 0.0], 1.0);
        let settings = RenderSettings {
            mode: RenderMode::Isosurface,
            iso_threshold: 0.5,
            step_size: 0.25,
            max_samples: 4096,
            ..RenderSettings::default()
        };
        let camera = Camera::default();
        let req = request(&camera, &transfer, &settings, volume.range);
        let caster = RayCaster::new(&volume);

        let ray = camera.ray(SIZE / 2, SIZE / 2, SIZE, SIZE);
        let hit = caster.cast(&ray, &req);
        let depth = hit.hit_depth.expect("center ray should hit the surface");
        // the box spans z in [-0.5, 0.5], the transition sits at its middle
        assert_relative_eq!(ray.at(depth).z, 0.0, epsilon = 0.02);
        assert_eq!(hit.color, [1.0, 0.0, 0.0, 1.0]);

        let image = caster.render(&req);
        assert_eq!(image.pixel(SIZE / 2, SIZE / 2), [255, 0, 0, 255]);

        // threshold above every value: no crossing
        let above = RenderSettings {
            iso_threshold: 1.5,
            ..settings
        };
        let miss = caster.cast(&ray, &request(&camera, &transfer, &above, volume.range));
        assert_eq!(miss, RaySample::BACKGROUND);
    }

    #[test]
    fn test_composite_stops_at_saturation() {
        let volume = VolumeData::new(Array3::from_elem((4, 4, 4), 1.0), (1.0, 1.0, 1.0));
        let transfer = TransferFunction::constant([0.5, 0.5, 0.5], 0.6);
        let settings = RenderSettings::default();
        let camera = Camera::default();
        let ray = camera.ray(SIZE / 2, SIZE / 2, SIZE, SIZE);
        let sample = RayCaster::new(&volume).cast(&ray, &request(&camera, &transfer, &settings, (0.0, 1.0)));
        // 0.6, 0.84, 0.936, 0.9744
        assert_relative_eq!(sample.color[3], 0.9744, epsilon = 1e-4);
        assert_relative_eq!(sample.color[0], 0.5 * 0.9744, epsilon = 1e-4);
    }

    #[test]
    fn test_ray_missing_box_is_background() {
        let ray = Ray {
            origin: Vec3::new(2.0, 0.0, -2.0),
            direction: Vec3::new(0.0, 0.0, 1.0),
        };
        assert_eq!(intersect_box(&ray, [0.5; 3]), None);
        let through = Ray {
            origin: Vec3::new(0.0, 0.0, -2.0),
            direction: Vec3::new(0.0, 0.0, 1.0),
        };
        assert_eq!(intersect_box(&through, [0.5; 3]), Some((1.5, 2.5)));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let volume = VolumeData::new(
            Array3::from_shape_fn((6, 7, 8), |(z, y, x)| (x * y + z) as f32),
            (0.8, 0.8, 2.0),
        );
        let transfer = TransferFunction::ct_soft_tissue();
        let settings = RenderSettings::default();
        let mut camera = Camera::default();
        camera.orbit(0.4, 0.2);
        let req = request(&camera, &transfer, &settings, volume.range);
        let caster = RayCaster::new(&volume);
        assert_eq!(caster.render(&req), caster.render(&req));
    }

    #[test]
    fn test_software_backend_lifecycle() {
        let mut backend = SoftwareBackend::with_limits(ResourceLimits {
            max_dimension: 8,
            max_memory_bytes: 1 << 20,
        });
        let camera = Camera::default();
        let transfer = TransferFunction::grayscale();
        let settings = RenderSettings::default();
        let req = request(&camera, &transfer, &settings, (0.0, 1.0));

        assert_matches!(backend.render(&req), Err(RenderError::NoVolume));
        let too_large = Arc::new(VolumeData::new(Array3::zeros((9, 1, 1)), (1.0, 1.0, 1.0)));
        assert_matches!(backend.upload(too_large), Err(RenderError::TooLarge(_)));

        backend
            .upload(Arc::new(VolumeData::new(Array3::zeros((4, 4, 4)), (1.0, 1.0, 1.0))))
            .unwrap();
        assert_eq!(backend.render(&req).unwrap().width, SIZE);

        backend.release();
        backend.release();
        assert_matches!(backend.render(&req), Err(RenderError::NoVolume));
    }
}
