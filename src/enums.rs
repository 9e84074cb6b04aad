use serde::{Deserialize, Serialize};

/// Slice ordering used when stacking a series into a volume.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    /// Z component of Image Position (Patient), head first.
    ImagePositionPatient,
    #[default]
    InstanceNumber,
    None,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Maximum intensity projection.
    Mip,
    #[default]
    Composite,
    Isosurface,
}

impl RenderMode {
    pub(crate) fn shader_index(self) -> u32 {
        match self {
            RenderMode::Mip => 0,
            RenderMode::Composite => 1,
            RenderMode::Isosurface => 2,
        }
    }
}

impl std::str::FromStr for RenderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mip" => Ok(RenderMode::Mip),
            "composite" => Ok(RenderMode::Composite),
            "isosurface" | "iso" => Ok(RenderMode::Isosurface),
            other => Err(format!("unknown render mode: {other}")),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Low,
    #[default]
    Medium,
    High,
}

/// Ray marching parameters bound to a [`QualityLevel`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityPreset {
    /// In voxels of the volume's longest axis.
    pub step_size: f32,
    pub max_samples: u32,
}

impl QualityLevel {
    #[must_use]
    pub fn preset(self) -> QualityPreset {
        match self {
            QualityLevel::Low => QualityPreset {
                step_size: 2.0,
                max_samples: 128,
            },
            QualityLevel::Medium => QualityPreset {
                step_size: 1.0,
                max_samples: 384,
            },
            QualityLevel::High => QualityPreset {
                step_size: 0.5,
                max_samples: 1024,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_mode_from_str() {
        assert_eq!("MIP".parse::<RenderMode>(), Ok(RenderMode::Mip));
        assert_eq!("iso".parse::<RenderMode>(), Ok(RenderMode::Isosurface));
        assert!("volume".parse::<RenderMode>().is_err());
    }

    #[test]
    fn test_quality_presets_are_ordered() {
        let low = QualityLevel::Low.preset();
        let high = QualityLevel::High.preset();
        assert!(low.step_size > high.step_size);
        assert!(low.max_samples < high.max_samples);
    }
}
