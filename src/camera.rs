//! Perspective camera orbiting the volume's bounding box.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul, Neg, Sub};

const MIN_DISTANCE: f32 = 0.2;
const MAX_DISTANCE: f32 = 20.0;
const DEFAULT_DISTANCE: f32 = 2.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3::new(0.0, 0.0, 0.0);

    #[inline]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub fn dot(self, other: Vec3) -> f32 {
        self.z.mul_add(other.z, self.x.mul_add(other.x, self.y * other.y))
    }

    #[inline]
    pub fn cross(self, other: Vec3) -> Vec3 {
        Vec3::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    #[inline]
    pub fn length(self) -> f32 {
        self.dot(self).sqrt()
    }

    /// Unit vector, or zero for a zero-length input.
    #[inline]
    pub fn normalize(self) -> Vec3 {
        let length = self.length();
        if length > f32::EPSILON { self * (1.0 / length) } else { Vec3::ZERO }
    }

    #[inline]
    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }

    #[inline]
    pub fn component(self, axis: usize) -> f32 {
        match axis {
            0 => self.x,
            1 => self.y,
            _ => self.z,
        }
    }

    /// Rotation about the unit `axis` by `angle` radians (Rodrigues).
    pub fn rotate(self, axis: Vec3, angle: f32) -> Vec3 {
        let (sin, cos) = angle.sin_cos();
        self * cos + axis.cross(self) * sin + axis * (axis.dot(self) * (1.0 - cos))
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x + o.x, self.y + o.y, self.z + o.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x - o.x, self.y - o.y, self.z - o.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Vec3;
    fn mul(self, s: f32) -> Vec3 {
        Vec3::new(self.x * s, self.y * s, self.z * s)
    }
}

impl Neg for Vec3 {
    type Output = Vec3;
    fn neg(self) -> Vec3 {
        Vec3::new(-self.x, -self.y, -self.z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    /// Unit length.
    pub direction: Vec3,
}

impl Ray {
    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }
}

/// Orthonormal view basis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewBasis {
    pub forward: Vec3,
    pub right: Vec3,
    pub up: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y_degrees: f32,
}

/// Looks along +z at the volume center with row 0 at the top of the view.
impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, -DEFAULT_DISTANCE),
            target: Vec3::ZERO,
            up: Vec3::new(0.0, -1.0, 0.0),
            fov_y_degrees: 45.0,
        }
    }
}

impl Camera {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn distance(&self) -> f32 {
        (self.position - self.target).length()
    }

    pub fn basis(&self) -> ViewBasis {
        let forward = (self.target - self.position).normalize();
        let right = forward.cross(self.up).normalize();
        let up = right.cross(forward);
        ViewBasis { forward, right, up }
    }

    /// Rotates the position around the target: `dx` radians about the view's
    /// up axis, `dy` radians about its right axis.
    pub fn orbit(&mut self, dx: f32, dy: f32) {
        if !dx.is_finite() || !dy.is_finite() {
            return;
        }
        let basis = self.basis();
        let mut offset = self.position - self.target;
        offset = offset.rotate(basis.up, dx);
        let right = basis.right.rotate(basis.up, dx);
        offset = offset.rotate(right, dy);
        self.up = basis.up.rotate(right, dy);
        self.position = self.target + offset;
    }

    /// Moves toward the target by `factor` (> 1 zooms in), clamping the
    /// distance.
    pub fn zoom(&mut self, factor: f32) {
        if !factor.is_finite() || factor <= 0.0 {
            return;
        }
        let offset = self.position - self.target;
        let distance = (offset.length() / factor).clamp(MIN_DISTANCE, MAX_DISTANCE);
        self.position = self.target + offset.normalize() * distance;
    }

    /// Translates position and target in the view plane, scaled by distance.
    pub fn pan(&mut self, dx: f32, dy: f32) {
        if !dx.is_finite() || !dy.is_finite() {
            return;
        }
        let basis = self.basis();
        let shift = (basis.right * dx + basis.up * dy) * self.distance();
        self.position = self.position + shift;
        self.target = self.target + shift;
    }

    /// Ray through the center of pixel (`px`, `py`) of a `width` x `height` view.
    pub fn ray(&self, px: u32, py: u32, width: u32, height: u32) -> Ray {
        let basis = self.basis();
        let tan_half = (self.fov_y_degrees.to_radians() * 0.5).tan();
        let aspect = width as f32 / height.max(1) as f32;
        let sx = (2.0 * (px as f32 + 0.5) / width.max(1) as f32 - 1.0) * aspect * tan_half;
        let sy = (1.0 - 2.0 * (py as f32 + 0.5) / height.max(1) as f32) * tan_half;
        Ray {
            origin: self.position,
            direction: (basis.forward + basis.right * sx + basis.up * sy).normalize(),
        }
    }
}
