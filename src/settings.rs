//! Render parameters and viewer configuration.

use crate::enums::{QualityLevel, RenderMode};
use crate::error::RenderError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub mode: RenderMode,
    /// Ray step in voxels of the longest axis.
    pub step_size: f32,
    pub max_samples: u32,
    /// Normalized intensity at which the isosurface is hit.
    pub iso_threshold: f32,
    pub brightness: f32,
    pub contrast: f32,
    /// Multiplier applied to every transfer function opacity.
    pub opacity: f32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            mode: RenderMode::default(),
            step_size: 1.0,
            max_samples: 384,
            iso_threshold: 0.5,
            brightness: 1.0,
            contrast: 1.0,
            opacity: 1.0,
        }
        .with_quality(QualityLevel::default())
    }
}

impl RenderSettings {
    #[must_use]
    pub fn with_quality(mut self, quality: QualityLevel) -> Self {
        let preset = quality.preset();
        self.step_size = preset.step_size;
        self.max_samples = preset.max_samples;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: RenderMode) -> Self {
        self.mode = mode;
        self
    }

    /// `((c - 0.5) * contrast + 0.5) * brightness`, clamped to [0, 1].
    #[inline]
    pub fn adjust(&self, channel: f32) -> f32 {
        ((channel - 0.5).mul_add(self.contrast, 0.5) * self.brightness).clamp(0.0, 1.0)
    }
}

/// Ceilings checked before a volume is uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Largest extent along any axis, in voxels.
    pub max_dimension: u32,
    pub max_memory_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_dimension: 2048,
            max_memory_bytes: 1 << 30,
        }
    }
}

impl ResourceLimits {
    /// # Errors
    ///
    /// Returns [`RenderError::TooLarge`] naming the exceeded ceiling.
    pub fn check(&self, dim: (usize, usize, usize), bytes: u64) -> Result<(), RenderError> {
        let (depth, height, width) = dim;
        let largest = depth.max(height).max(width);
        if largest > self.max_dimension as usize {
            return Err(RenderError::TooLarge(format!(
                "volume {width}x{height}x{depth} exceeds the maximum dimension of {}",
                self.max_dimension
            )));
        }
        if bytes > self.max_memory_bytes {
            return Err(RenderError::TooLarge(format!(
                "volume {width}x{height}x{depth} needs {} MiB, limit is {} MiB",
                bytes >> 20,
                self.max_memory_bytes >> 20
            )));
        }
        Ok(())
    }

    /// The tighter of both limits.
    #[must_use]
    pub fn min(self, other: ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            max_dimension: self.max_dimension.min(other.max_dimension),
            max_memory_bytes: self.max_memory_bytes.min(other.max_memory_bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarningThresholds {
    pub min_fps: f32,
    pub large_volume_voxels: u64,
    pub high_memory_bytes: u64,
}

impl Default for WarningThresholds {
    fn default() -> Self {
        Self {
            min_fps: 20.0,
            large_volume_voxels: 512 * 512 * 512,
            high_memory_bytes: 512 << 20,
        }
    }
}

/// Staged upload of down-sampled copies before the full volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressiveConfig {
    pub enabled: bool,
    /// Smaller volumes are uploaded in one go.
    pub min_voxels: u64,
    /// Down-sampling factors of the preview stages.
    pub factors: Vec<usize>,
}

impl Default for ProgressiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_voxels: 256 * 256 * 64,
            factors: vec![4, 2],
        }
    }
}

impl ProgressiveConfig {
    /// Down-sampling factor per stage, coarsest first, ending with 1.
    pub fn stages(&self, voxels: u64) -> Vec<usize> {
        let mut stages = Vec::new();
        if self.enabled && voxels >= self.min_voxels {
            let mut factors: Vec<_> = self.factors.iter().copied().filter(|&f| f > 1).collect();
            factors.sort_unstable_by(|a, b| b.cmp(a));
            factors.dedup();
            stages.extend(factors);
        }
        stages.push(1);
        stages
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub limits: ResourceLimits,
    pub warnings: WarningThresholds,
    /// Idle time after the last interaction before quality is restored.
    pub restore_delay_ms: u64,
    pub metrics_interval_ms: u64,
    pub progressive: ProgressiveConfig,
    pub default_quality: QualityLevel,
    /// Quality used while the camera is being moved.
    pub interaction_quality: QualityLevel,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            warnings: WarningThresholds::default(),
            restore_delay_ms: 250,
            metrics_interval_ms: 1000,
            progressive: ProgressiveConfig::default(),
            default_quality: QualityLevel::Medium,
            interaction_quality: QualityLevel::Low,
        }
    }
}

impl ViewerConfig {
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or describes invalid limits.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ViewerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns error if the file cannot be read or holds invalid JSON.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for zero limits or intervals.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_dimension == 0 || self.limits.max_memory_bytes == 0 {
            return Err(ConfigError::Invalid("resource limits must be positive".to_string()));
        }
        if self.metrics_interval_ms == 0 {
            return Err(ConfigError::Invalid("metrics interval must be positive".to_string()));
        }
        if self.progressive.factors.contains(&0) {
            return Err(ConfigError::Invalid("progressive factors must be positive".to_string()));
        }
        Ok(())
    }
}
