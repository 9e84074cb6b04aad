//! Study-wide frame addressing across slices with varying frame counts.

use crate::error::DecodeError;
use crate::metadata::parse_header;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("slice {0} not found")]
    NotFound(String),
    #[error("failed to read slice {id}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Raw bytes of a slice, addressed by slice identifier.
pub trait SliceSource: Sync {
    /// # Errors
    ///
    /// Returns a [`SourceError`] when the slice cannot be fetched.
    fn fetch(&self, id: &str) -> Result<Vec<u8>, SourceError>;
}

impl<F> SliceSource for F
where
    F: Fn(&str) -> Result<Vec<u8>, SourceError> + Sync,
{
    fn fetch(&self, id: &str) -> Result<Vec<u8>, SourceError> {
        self(id)
    }
}

/// Slices held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource(pub HashMap<String, Vec<u8>>);

impl SliceSource for MemorySource {
    fn fetch(&self, id: &str) -> Result<Vec<u8>, SourceError> {
        self.0
            .get(id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(id.to_string()))
    }
}

/// Slices as files below a directory, the identifier being the file name.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    pub root: PathBuf,
}

impl SliceSource for DirectorySource {
    fn fetch(&self, id: &str) -> Result<Vec<u8>, SourceError> {
        std::fs::read(self.root.join(id)).map_err(|source| SourceError::Io {
            id: id.to_string(),
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceRef {
    pub id: String,
    /// Declared sequence number, e.g. the instance number.
    pub sequence: Option<i64>,
}

impl SliceRef {
    #[must_use]
    pub fn new(id: impl Into<String>, sequence: Option<i64>) -> Self {
        Self {
            id: id.into(),
            sequence,
        }
    }
}

/// Ascending sequence, unnumbered slices last, ties by identifier.
#[must_use]
pub fn sort_slices(slices: &[SliceRef]) -> Vec<SliceRef> {
    let mut sorted = slices.to_vec();
    sorted.sort_by(|a, b| {
        let key = |s: &SliceRef| (s.sequence.is_none(), s.sequence);
        key(a).cmp(&key(b)).then_with(|| a.id.cmp(&b.id))
    });
    sorted
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLocation {
    pub slice_id: String,
    /// Position of the slice in the sorted order.
    pub slice_position: usize,
    pub local_frame: u32,
}

#[derive(Debug, Error)]
pub enum SkipReason {
    #[error(transparent)]
    Fetch(#[from] SourceError),
    #[error(transparent)]
    Parse(#[from] DecodeError),
}

#[derive(Debug)]
pub struct SkippedSlice {
    pub id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Default)]
pub struct Resolution {
    /// `None` when the index lies beyond the last frame.
    pub location: Option<FrameLocation>,
    pub skipped: Vec<SkippedSlice>,
}

pub struct FrameIndexResolver<S> {
    source: S,
    prefetch: usize,
}

impl<S: SliceSource> FrameIndexResolver<S> {
    #[must_use]
    pub fn new(source: S) -> Self {
        Self {
            source,
            prefetch: 1,
        }
    }

    /// Fetches up to `window` slices concurrently. The mapping does not
    /// depend on the window.
    #[must_use]
    pub fn with_prefetch(mut self, window: usize) -> Self {
        self.prefetch = window.max(1);
        self
    }

    fn frame_count(&self, slice: &SliceRef) -> Result<u32, SkipReason> {
        let bytes = self.source.fetch(&slice.id)?;
        Ok(parse_header(&bytes)?.number_of_frames)
    }

    fn frame_counts(&self, window: &[SliceRef]) -> Vec<Result<u32, SkipReason>> {
        if window.len() == 1 {
            return vec![self.frame_count(&window[0])];
        }
        window.par_iter().map(|slice| self.frame_count(slice)).collect()
    }

    /// Maps `global_index` to its slice and local frame.
    ///
    /// Slices that cannot be fetched or parsed contribute no frames and are
    /// reported in [`Resolution::skipped`].
    pub fn resolve(&self, slices: &[SliceRef], global_index: u64) -> Resolution {
        let sorted = sort_slices(slices);
        let mut resolution = Resolution::default();
        let mut frames_before: u64 = 0;

        for (window_index, window) in sorted.chunks(self.prefetch).enumerate() {
            let counts = self.frame_counts(window);
            for (offset, (slice, count)) in window.iter().zip(counts).enumerate() {
                let Some(count) = counted(slice, count, &mut resolution.skipped) else {
                    continue;
                };
                if global_index < frames_before + count {
                    resolution.location = Some(FrameLocation {
                        slice_id: slice.id.clone(),
                        slice_position: window_index * self.prefetch + offset,
                        local_frame: (global_index - frames_before) as u32,
                    });
                    return resolution;
                }
                frames_before += count;
            }
        }

        log::debug!("frame {global_index} not found, study has {frames_before} frames");
        resolution
    }

    /// Total frame count of the study plus the slices that were skipped.
    pub fn total_frames(&self, slices: &[SliceRef]) -> (u64, Vec<SkippedSlice>) {
        let sorted = sort_slices(slices);
        let mut skipped = Vec::new();
        let mut total = 0u64;
        for window in sorted.chunks(self.prefetch) {
            for (slice, count) in window.iter().zip(self.frame_counts(window)) {
                total += counted(slice, count, &mut skipped).unwrap_or(0);
            }
        }
        (total, skipped)
    }
}

/// Frame count of `slice`, or `None` after logging and recording the skip.
fn counted(slice: &SliceRef, count: Result<u32, SkipReason>, skipped: &mut Vec<SkippedSlice>) -> Option<u64> {
    match count {
        Ok(count) => Some(u64::from(count)),
        Err(reason) => {
            log::warn!("skipping slice {}: {reason}", slice.id);
            skipped.push(SkippedSlice {
                id: slice.id.clone(),
                reason,
            });
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SliceBuilder;
    use assert_matches::assert_matches;

    fn slice_with_frames(frames: u32) -> Vec<u8> {
        SliceBuilder::explicit_little()
            .image(2, 2, 1, 8)
            .frames(frames)
            .native_pixels(vec![0; 4 * frames as usize])
            .build()
    }

    /// Slices "a", "b", "c" with 3, 1 and 4 frames, listed out of order.
    fn study() -> (MemorySource, Vec<SliceRef>) {
        let source = MemorySource(HashMap::from([
            ("a".to_string(), slice_with_frames(3)),
            ("b".to_string(), slice_with_frames(1)),
            ("c".to_string(), slice_with_frames(4)),
        ]));
        let slices = vec![
            SliceRef::new("c", Some(3)),
            SliceRef::new("a", Some(1)),
            SliceRef::new("b", Some(2)),
        ];
        (source, slices)
    }

    fn locate(resolver: &FrameIndexResolver<impl SliceSource>, slices: &[SliceRef], index: u64) -> Option<(String, u32)> {
        resolver
            .resolve(slices, index)
            .location
            .map(|l| (l.slice_id, l.local_frame))
    }

    #[test]
    fn test_resolves_across_frame_counts() {
        let (source, slices) = study();
        let resolver = FrameIndexResolver::new(source);

        let expected = [(0, "a", 0), (2, "a", 2), (3, "b", 0), (4, "c", 0), (7, "c", 3)];
        for (index, id, local) in expected {
            assert_eq!(
                locate(&resolver, &slices, index),
                Some((id.to_string(), local)),
                "global index {index}"
            );
        }
        assert_eq!(locate(&resolver, &slices, 8), None);
    }

    #[test]
    fn test_unparseable_slice_is_skipped() {
        let (mut source, slices) = study();
        source.0.insert("b".to_string(), vec![0xAB; 40]);
        let resolver = FrameIndexResolver::new(source);

        let resolution = resolver.resolve(&slices, 3);
        let location = resolution.location.unwrap();
        assert_eq!(location.slice_id, "c");
        assert_eq!(location.slice_position, 2);
        assert_eq!(location.local_frame, 0);
        assert_eq!(resolution.skipped.len(), 1);
        assert_eq!(resolution.skipped[0].id, "b");
        assert_matches!(resolution.skipped[0].reason, SkipReason::Parse(_));

        assert_eq!(locate(&resolver, &slices, 6), Some(("c".to_string(), 3)));
        assert_eq!(locate(&resolver, &slices, 7), None);
    }

    #[test]
    fn test_missing_slice_is_skipped() {
        let (mut source, slices) = study();
        source.0.remove("a");
        let resolver = FrameIndexResolver::new(source);
        let resolution = resolver.resolve(&slices, 0);
        assert_eq!(resolution.location.unwrap().slice_id, "b");
        assert_matches!(
            resolution.skipped[0].reason,
            SkipReason::Fetch(SourceError::NotFound(_))
        );
    }

    #[test]
    fn test_total_frames_reports_skips_like_resolve() {
        let (mut source, slices) = study();
        source.0.insert("b".to_string(), vec![0xAB; 40]);
        source.0.remove("c");
        let resolver = FrameIndexResolver::new(source).with_prefetch(2);

        let (total, skipped) = resolver.total_frames(&slices);
        assert_eq!(total, 3);
        let resolved = resolver.resolve(&slices, u64::MAX).skipped;
        let ids = |skipped: &[SkippedSlice]| skipped.iter().map(|s| s.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&skipped), ["b", "c"]);
        assert_eq!(ids(&skipped), ids(&resolved));
        assert_matches!(skipped[0].reason, SkipReason::Parse(_));
        assert_matches!(skipped[1].reason, SkipReason::Fetch(SourceError::NotFound(_)));
    }

    #[test]
    fn test_prefetch_does_not_change_mapping() {
        let (source, slices) = study();
        let sequential = FrameIndexResolver::new(source.clone());
        let prefetching = FrameIndexResolver::new(source).with_prefetch(2);
        for index in 0..10 {
            assert_eq!(
                locate(&sequential, &slices, index),
                locate(&prefetching, &slices, index)
            );
        }
        assert_eq!(prefetching.total_frames(&slices).0, 8);
    }

    #[test]
    fn test_sort_puts_unnumbered_last() {
        let sorted = sort_slices(&[
            SliceRef::new("z", None),
            SliceRef::new("y", Some(5)),
            SliceRef::new("b", Some(1)),
            SliceRef::new("a", Some(1)),
            SliceRef::new("x", None),
        ]);
        let ids: Vec<_> = sorted.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "y", "x", "z"]);
    }

    #[test]
    fn test_closure_source() {
        let (source, slices) = study();
        let resolver = FrameIndexResolver::new(move |id: &str| {
            source
                .0
                .get(id)
                .cloned()
                .ok_or_else(|| SourceError::NotFound(id.to_string()))
        });
        assert_eq!(locate(&resolver, &slices, 5), Some(("c".to_string(), 1)));
    }
}
