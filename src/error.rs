use thiserror::Error;

/// Failures of the 2D path: parsing a slice and decoding one of its frames.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The Part 10 structure (preamble, magic, file meta group) is unreadable.
    #[error("Malformed DICOM container: {0}")]
    MalformedContainer(String),

    #[error("Frame index {index} out of range (slice has {count} frames)")]
    FrameIndexOutOfRange { index: u32, count: u32 },

    #[error("No pixel data element present")]
    MissingPixelData,

    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Pixel data truncated: frame needs {needed} bytes, {available} available")]
    TruncatedPixelData { needed: usize, available: usize },

    #[error("Image geometry is empty ({rows}x{columns})")]
    EmptyGeometry { rows: u16, columns: u16 },

    #[error("Failed to decode compressed frame: {0}")]
    Codec(String),
}

/// Coarse classification of [`RenderError`] used by callers to pick a
/// fallback (software renderer, smaller volume, retry later).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    NotSupported,
    TooLarge,
    DeviceLost,
    Unexpected,
}

#[derive(Debug, Error)]
pub enum RenderError {
    /// No acceleration available (no adapter, no device).
    #[error("Rendering backend not supported: {0}")]
    NotSupported(String),

    /// Volume rejected before upload.
    #[error("Volume too large: {0}")]
    TooLarge(String),

    #[error("Rendering device lost")]
    DeviceLost,

    #[error("No volume loaded")]
    NoVolume,

    #[error("Unexpected rendering failure: {0}")]
    Unexpected(String),
}

impl RenderError {
    #[must_use]
    pub fn category(&self) -> FailureCategory {
        match self {
            RenderError::NotSupported(_) => FailureCategory::NotSupported,
            RenderError::TooLarge(_) => FailureCategory::TooLarge,
            RenderError::DeviceLost => FailureCategory::DeviceLost,
            RenderError::NoVolume | RenderError::Unexpected(_) => FailureCategory::Unexpected,
        }
    }
}
