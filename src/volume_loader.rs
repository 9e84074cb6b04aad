use crate::decoder::{DecodedFrame, decode_frame};
use crate::enums::SortBy;
use crate::error::DecodeError;
use crate::metadata::{RescaleParams, SliceMetadata, parse_metadata};
use crate::volume::VolumeData;

use ndarray::{Array3, Axis};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::{fs, path::Path};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("No valid planes to assemble")]
    NoValidPlanes,

    #[error("Plane {index} is {found:?}, expected {expected:?}")]
    InconsistentDimensions {
        index: usize,
        expected: (u32, u32),
        found: (u32, u32),
    },

    #[error("Assembly cancelled after {completed} of {total} planes")]
    Cancelled { completed: usize, total: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared flag to abandon a running assembly.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyStage {
    /// Parsing and decoding slices, in completion order.
    Decoding,
    /// Copying decoded planes into the volume.
    Stacking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyProgress {
    pub stage: AssemblyStage,
    pub completed: usize,
    pub total: usize,
}

impl AssemblyProgress {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f32 / self.total as f32
        }
    }
}

/// A decoded frame plus the rescale to apply while stacking it.
#[derive(Debug, Clone)]
pub struct SamplePlane {
    pub frame: DecodedFrame,
    pub rescale: RescaleParams,
}

impl SamplePlane {
    pub fn new(frame: DecodedFrame) -> Self {
        Self {
            frame,
            rescale: RescaleParams::default(),
        }
    }

    fn dim(&self) -> (u32, u32) {
        (self.frame.width, self.frame.height)
    }
}

/// Raw slice bytes with an identifier used in reports.
#[derive(Debug, Clone)]
pub struct RawSlice {
    pub id: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum PlaneSkipReason {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Plane is {found:?}, series is {expected:?}")]
    Geometry {
        expected: (u32, u32),
        found: (u32, u32),
    },
}

#[derive(Debug)]
pub struct SkippedPlane {
    pub id: String,
    pub reason: PlaneSkipReason,
}

#[derive(Debug)]
pub struct Assembly {
    pub volume: VolumeData,
    pub skipped: Vec<SkippedPlane>,
}

struct DecodedSlice {
    id: String,
    metadata: SliceMetadata,
    frame: DecodedFrame,
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Stacks equally sized planes into a volume.
    ///
    /// Color planes are reduced to the average of their channels. `on_progress`
    /// is called after every plane; `cancel` is checked before every plane.
    ///
    /// # Errors
    ///
    /// Returns error if there are no planes, a plane differs in size from the
    /// first one, or the assembly was cancelled.
    pub fn assemble(
        planes: &[SamplePlane],
        spacing: (f32, f32, f32),
        mut on_progress: impl FnMut(AssemblyProgress),
        cancel: &CancellationToken,
    ) -> Result<VolumeData, AssemblyError> {
        let first = planes.first().ok_or(AssemblyError::NoValidPlanes)?;
        let expected = first.dim();
        if let Some((index, plane)) = planes.iter().enumerate().find(|(_, p)| p.dim() != expected) {
            return Err(AssemblyError::InconsistentDimensions {
                index,
                expected,
                found: plane.dim(),
            });
        }

        let (width, height) = (expected.0 as usize, expected.1 as usize);
        let total = planes.len();
        let mut volume = Array3::<f32>::zeros((total, height, width));
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;

        for (completed, (mut target, plane)) in volume.axis_iter_mut(Axis(0)).zip(planes).enumerate() {
            if cancel.is_cancelled() {
                log::info!("volume assembly cancelled at plane {completed} of {total}");
                return Err(AssemblyError::Cancelled { completed, total });
            }
            for (i, voxel) in target.iter_mut().enumerate() {
                let value = plane.rescale.apply(plane.frame.gray_at(i)) as f32;
                min = min.min(value);
                max = max.max(value);
                *voxel = value;
            }
            on_progress(AssemblyProgress {
                stage: AssemblyStage::Stacking,
                completed: completed + 1,
                total,
            });
        }

        log::debug!("assembled {width}x{height}x{total} volume, range [{min}, {max}]");
        Ok(VolumeData::with_range(volume, spacing, (min, max)))
    }

    /// Parses, sorts and decodes frame 0 of every slice, then assembles them.
    ///
    /// Slices that fail to decode, or whose size differs from the first
    /// sorted slice, are skipped and reported in [`Assembly::skipped`].
    /// Progress is reported per decoded slice, then per stacked plane.
    /// `cancel` is checked before every slice and every plane.
    ///
    /// # Errors
    ///
    /// Returns error if no slice survives or the assembly was cancelled.
    pub fn load_from_slices(
        slices: &[RawSlice],
        sort_by: SortBy,
        on_progress: impl FnMut(AssemblyProgress) + Send,
        cancel: &CancellationToken,
    ) -> Result<Assembly, AssemblyError> {
        let total = slices.len();
        let decoded_count = AtomicUsize::new(0);
        let on_progress = Mutex::new(on_progress);
        let report = |progress: AssemblyProgress| {
            let mut on_progress = on_progress.lock().unwrap_or_else(PoisonError::into_inner);
            on_progress(progress);
        };

        let results: Vec<Option<Result<DecodedSlice, SkippedPlane>>> = slices
            .par_iter()
            .map(|slice| {
                if cancel.is_cancelled() {
                    return None;
                }
                let result = Self::decode_slice(slice);
                // counted under the lock so reports arrive in order
                let mut on_progress = on_progress.lock().unwrap_or_else(PoisonError::into_inner);
                let completed = decoded_count.fetch_add(1, Ordering::AcqRel) + 1;
                on_progress(AssemblyProgress {
                    stage: AssemblyStage::Decoding,
                    completed,
                    total,
                });
                Some(result)
            })
            .collect();

        if cancel.is_cancelled() {
            let completed = decoded_count.load(Ordering::Acquire);
            log::info!("slice decoding cancelled after {completed} of {total} slices");
            return Err(AssemblyError::Cancelled { completed, total });
        }

        let mut decoded = Vec::with_capacity(total);
        let mut skipped = Vec::new();
        for result in results.into_iter().flatten() {
            match result {
                Ok(slice) => decoded.push(slice),
                Err(skip) => {
                    log::warn!("skipping slice {}: {}", skip.id, skip.reason);
                    skipped.push(skip);
                }
            }
        }

        Self::sort_slices(&mut decoded, sort_by);

        let expected = decoded
            .first()
            .map(|s| (s.frame.width, s.frame.height))
            .ok_or(AssemblyError::NoValidPlanes)?;
        let (kept, mismatched): (Vec<_>, Vec<_>) = decoded
            .into_iter()
            .partition(|s| (s.frame.width, s.frame.height) == expected);
        for s in mismatched {
            let reason = PlaneSkipReason::Geometry {
                expected,
                found: (s.frame.width, s.frame.height),
            };
            log::warn!("skipping slice {}: {reason}", s.id);
            skipped.push(SkippedPlane { id: s.id, reason });
        }

        let metadata: Vec<&SliceMetadata> = kept.iter().map(|s| &s.metadata).collect();
        let spacing = Self::get_spacing(&metadata);
        let planes: Vec<SamplePlane> = kept
            .into_iter()
            .map(|s| SamplePlane {
                rescale: s.metadata.rescale,
                frame: s.frame,
            })
            .collect();

        let volume = Self::assemble(&planes, spacing, report, cancel)?;
        Ok(Assembly { volume, skipped })
    }

    /// Load a volume from a directory containing .dcm files
    pub fn load_from_directory(
        path: impl AsRef<Path>,
        sort_by: SortBy,
    ) -> Result<Assembly, AssemblyError> {
        let paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(AssemblyError::NoValidPlanes);
        }

        let slices = paths
            .iter()
            .map(|path| {
                Ok(RawSlice {
                    id: path.display().to_string(),
                    bytes: fs::read(path)?,
                })
            })
            .collect::<Result<Vec<_>, std::io::Error>>()?;

        log::info!("loading {} slices from {}", slices.len(), path.as_ref().display());
        Self::load_from_slices(&slices, sort_by, |_| {}, &CancellationToken::new())
    }

    fn decode_slice(slice: &RawSlice) -> Result<DecodedSlice, SkippedPlane> {
        let decode = || -> Result<_, DecodeError> {
            let mut metadata = parse_metadata(&slice.bytes)?;
            let frame = decode_frame(&metadata, 0)?;
            // the decoded frame replaces the encoded payload
            metadata.pixel_data = None;
            Ok((metadata, frame))
        };
        match decode() {
            Ok((metadata, frame)) => Ok(DecodedSlice {
                id: slice.id.clone(),
                metadata,
                frame,
            }),
            Err(e) => Err(SkippedPlane {
                id: slice.id.clone(),
                reason: e.into(),
            }),
        }
    }

    fn get_sort_order(metadata: &SliceMetadata, sort_by: SortBy) -> Option<f64> {
        match sort_by {
            SortBy::ImagePositionPatient => metadata.image_position.map(|p| p[2]),
            SortBy::InstanceNumber => metadata.instance_number.map(|n| n as f64),
            SortBy::None => Some(0.0),
        }
    }

    /// Stable; slices without a sort key go last.
    fn sort_slices(slices: &mut [DecodedSlice], sort_by: SortBy) {
        if matches!(sort_by, SortBy::None) {
            return;
        }
        slices.sort_by(|a, b| {
            let a = Self::get_sort_order(&a.metadata, sort_by);
            let b = Self::get_sort_order(&b.metadata, sort_by);
            match (a, b) {
                (Some(a), Some(b)) => {
                    let ordering = a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal);
                    // head first
                    if matches!(sort_by, SortBy::ImagePositionPatient) {
                        ordering.reverse()
                    } else {
                        ordering
                    }
                }
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        });
    }

    /// (x, y, z) spacing: column and row pixel spacing, then the distance
    /// between the first two slice positions, the slice thickness or 1 mm.
    fn get_spacing(metadata: &[&SliceMetadata]) -> (f32, f32, f32) {
        let (row, column) = metadata
            .iter()
            .find_map(|m| m.pixel_spacing)
            .unwrap_or((1.0, 1.0));

        let position_delta = match metadata {
            [first, second, ..] => first.image_position.zip(second.image_position).map(|(a, b)| {
                ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
            }),
            _ => None,
        };
        let slice = position_delta
            .filter(|d| *d > 1e-6)
            .or_else(|| metadata.iter().find_map(|m| m.slice_thickness))
            .unwrap_or(1.0);

        (column as f32, row as f32, slice as f32)
    }
}
