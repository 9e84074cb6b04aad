//! # DICOM-render library
//!
//! This crate turns raw DICOM Part 10 slices into display rasters and stacks
//! them into volumes that can be ray cast on the CPU or the GPU.
//!
//! The 2D path reads a slice with `dicom-object` into [`SliceMetadata`],
//! decodes one frame (native in either byte order, or any encapsulated
//! syntax the `dicom-pixeldata` registry decodes) and maps it to an 8-bit
//! RGBA [`RasterImage`] using the rescale, window and photometric
//! interpretation of the slice. Frames of a multi-slice study can be
//! addressed by one global index through the [`FrameIndexResolver`].
//!
//! The 3D path assembles decoded slices into a [`VolumeData`] and renders it
//! as a maximum intensity projection, a front-to-back composite through a
//! [`TransferFunction`], or a first-hit isosurface. Two backends implement
//! the same [`RenderBackend`] interface:
//!  - [`SoftwareBackend`], the reference ray caster parallelised with rayon
//!  - [`GpuRaycaster`], a wgpu compute shader over a 3D texture
//!
//! [`VolumeViewer`] wraps a backend with the interactive behaviour: resource
//! validation, progressive loading, adaptive quality, device loss recovery,
//! performance metrics and disposal.
//!
//! Slices that fail to load in a multi-slice operation are skipped and
//! reported, never silently dropped.
//!
//! # Examples
//!
//! ## Rendering one frame to PNG
//!
//! ```no_run
//! # use dicom_render::{render_frame_or_placeholder, Window};
//! let bytes = std::fs::read("slice.dcm").expect("should have read the slice");
//! let outcome = render_frame_or_placeholder(&bytes, 0, Some(Window::new(40.0, 400.0)));
//! std::fs::write("slice.png", outcome.raster().to_png().expect("should encode"))
//!     .expect("should have written the PNG");
//! ```
//!
//! ## Ray casting a series
//!
//! ```no_run
//! # use dicom_render::{SoftwareBackend, SortBy, ViewerConfig, VolumeLoader, VolumeViewer};
//! let assembly = VolumeLoader::load_from_directory("dicom", SortBy::InstanceNumber)
//!     .expect("should have loaded files from directory");
//! let mut viewer = VolumeViewer::new(SoftwareBackend::new(), ViewerConfig::default());
//! viewer.load_volume(assembly.volume, None).expect("volume should fit");
//! viewer.rotate_camera(0.5, 0.2);
//! let image = viewer.render(512, 512).expect("should render").expect("viewer is active");
//! image.to_rgba_image().expect("valid raster").save("volume.png").expect("should save");
//! ```

pub mod camera;
pub mod clock;
pub mod codec;
pub mod decoder;
pub mod enums;
pub mod error;
pub mod gpu_raycaster;
mod interpolator;
pub mod metadata;
pub mod metrics;
mod parser;
pub mod raster;
pub mod raycast;
pub mod resolver;
pub mod settings;
pub mod transfer;
pub mod viewer;
pub mod volume;
pub mod volume_loader;

#[cfg(test)]
mod test_support;

pub use camera::Camera;
pub use decoder::{DecodedFrame, decode_frame};
pub use enums::{QualityLevel, RenderMode, SortBy};
pub use error::{DecodeError, FailureCategory, RenderError};
pub use gpu_raycaster::GpuRaycaster;
pub use metadata::{SliceMetadata, Window, parse_metadata};
pub use raster::{FrameOutcome, RasterImage, map_to_raster, render_frame, render_frame_or_placeholder};
pub use raycast::{RayCaster, RenderBackend, SoftwareBackend};
pub use resolver::{FrameIndexResolver, SliceRef, SliceSource};
pub use settings::{RenderSettings, ViewerConfig};
pub use transfer::TransferFunction;
pub use viewer::VolumeViewer;
pub use volume::VolumeData;
pub use volume_loader::VolumeLoader;
