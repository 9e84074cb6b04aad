//! Interactive volume viewer driving a [`RenderBackend`].
//!
//! The viewer owns the camera, transfer function and render settings, and
//! adds the stateful behaviour around a backend:
//!
//! * volumes are validated against resource limits before upload and may be
//!   uploaded progressively, coarsest stage first;
//! * camera interaction lowers the quality, which is restored after an idle
//!   delay;
//! * a lost device suspends the viewer until [`VolumeViewer::tick`] manages to
//!   recover it and re-upload the last volume;
//! * [`VolumeViewer::dispose`] releases the backend and turns every later call
//!   into a no-op.
//!
//! There is no internal thread. The host calls [`VolumeViewer::tick`] from its
//! frame loop and [`VolumeViewer::render`] whenever it wants a new image.

use crate::camera::Camera;
use crate::clock::{Clock, SystemClock};
use crate::enums::{QualityLevel, RenderMode};
use crate::error::RenderError;
use crate::metrics::{MetricsObserver, PerformanceMetrics, PerformanceMonitor, WarningObserver};
use crate::raster::RasterImage;
use crate::raycast::{FrameRequest, RenderBackend};
use crate::settings::{RenderSettings, ViewerConfig};
use crate::transfer::TransferFunction;
use crate::volume::VolumeData;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    Active,
    /// The device was lost; waiting for recovery.
    Suspended,
    Disposed,
}

/// Reported after each progressive stage is resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadProgress {
    /// 1-based.
    pub stage: usize,
    pub stages: usize,
    /// Down-sampling factor of the stage, 1 for full resolution.
    pub factor: usize,
}

impl LoadProgress {
    pub fn is_complete(&self) -> bool {
        self.stage == self.stages
    }
}

pub type ProgressObserver = Box<dyn FnMut(LoadProgress) + Send>;

/// Lowers quality while the camera moves and restores it after an idle delay.
#[derive(Debug, Clone)]
struct QualityGovernor {
    base: QualityLevel,
    interaction: QualityLevel,
    restore_delay: Duration,
    last_interaction: Option<Duration>,
}

impl QualityGovernor {
    fn current(&self) -> QualityLevel {
        match self.last_interaction {
            Some(_) => self.interaction.min(self.base),
            None => self.base,
        }
    }

    fn interact(&mut self, now: Duration) {
        if self.last_interaction.is_none() && self.interaction < self.base {
            log::debug!("quality lowered to {:?} during interaction", self.interaction);
        }
        self.last_interaction = Some(now);
    }

    /// Returns true when quality was restored.
    fn poll(&mut self, now: Duration) -> bool {
        match self.last_interaction {
            Some(last) if now.saturating_sub(last) >= self.restore_delay => {
                self.last_interaction = None;
                log::debug!("quality restored to {:?}", self.base);
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AutoRotation {
    /// Radians per second about the view's up axis.
    speed: f32,
    last: Duration,
}

/// Pending and completed stages of the current load.
struct ProgressiveLoad {
    pending: VecDeque<usize>,
    total: usize,
    on_progress: Option<ProgressObserver>,
}

pub struct VolumeViewer<B: RenderBackend, C: Clock = SystemClock> {
    backend: B,
    clock: C,
    config: ViewerConfig,
    state: ViewerState,
    camera: Camera,
    transfer: TransferFunction,
    /// Explicit intensity range of the transfer function.
    intensity_range: Option<(f32, f32)>,
    settings: RenderSettings,
    governor: QualityGovernor,
    auto_rotation: Option<AutoRotation>,
    /// Full resolution volume, kept for device recovery.
    volume: Option<Arc<VolumeData>>,
    resident_factor: Option<usize>,
    load: Option<ProgressiveLoad>,
    monitor: PerformanceMonitor,
    needs_redraw: bool,
}

impl<B: RenderBackend> VolumeViewer<B, SystemClock> {
    pub fn new(backend: B, config: ViewerConfig) -> Self {
        Self::with_clock(backend, config, SystemClock::default())
    }
}

impl<B: RenderBackend, C: Clock> VolumeViewer<B, C> {
    pub fn with_clock(backend: B, config: ViewerConfig, clock: C) -> Self {
        let governor = QualityGovernor {
            base: config.default_quality,
            interaction: config.interaction_quality,
            restore_delay: Duration::from_millis(config.restore_delay_ms),
            last_interaction: None,
        };
        let mut monitor = PerformanceMonitor::new(
            config.warnings,
            Duration::from_millis(config.metrics_interval_ms),
        );
        monitor.set_quality(config.default_quality);
        Self {
            backend,
            clock,
            state: ViewerState::Active,
            camera: Camera::default(),
            transfer: TransferFunction::default(),
            intensity_range: None,
            settings: RenderSettings::default().with_quality(config.default_quality),
            governor,
            auto_rotation: None,
            volume: None,
            resident_factor: None,
            load: None,
            monitor,
            needs_redraw: false,
            config,
        }
    }

    pub fn state(&self) -> ViewerState {
        self.state
    }

    pub fn is_disposed(&self) -> bool {
        self.state == ViewerState::Disposed
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn transfer_function(&self) -> &TransferFunction {
        &self.transfer
    }

    /// Settings the next frame is rendered with, quality included.
    pub fn effective_settings(&self) -> RenderSettings {
        self.settings.with_quality(self.governor.current())
    }

    pub fn quality(&self) -> QualityLevel {
        self.governor.current()
    }

    pub fn volume(&self) -> Option<&Arc<VolumeData>> {
        self.volume.as_ref()
    }

    /// Down-sampling factor of the volume on the backend.
    pub fn resident_factor(&self) -> Option<usize> {
        self.resident_factor
    }

    pub fn is_loading(&self) -> bool {
        self.load.as_ref().is_some_and(|load| !load.pending.is_empty())
    }

    /// True after any change that alters the next frame.
    pub fn needs_redraw(&self) -> bool {
        self.needs_redraw
    }

    fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Validates and uploads `volume`, replacing the current one.
    ///
    /// With progressive loading the coarsest stage is uploaded here and the
    /// remaining stages on later ticks. Stages still pending from an earlier
    /// load are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::TooLarge`] when the volume exceeds the configured
    /// or backend limits, [`RenderError::DeviceLost`] when the backend is gone,
    /// and [`RenderError::Unexpected`] for an empty volume or a disposed viewer.
    pub fn load_volume(
        &mut self,
        volume: impl Into<Arc<VolumeData>>,
        on_progress: Option<ProgressObserver>,
    ) -> Result<(), RenderError> {
        if self.is_disposed() {
            return Err(RenderError::Unexpected("viewer has been disposed".to_string()));
        }
        let volume = volume.into();
        if volume.is_empty() {
            return Err(RenderError::Unexpected("volume has no voxels".to_string()));
        }
        let memory = self.backend.estimated_memory(&volume);
        self.backend
            .limits()
            .min(self.config.limits)
            .check(volume.dim(), memory)?;

        let stages = self.config.progressive.stages(volume.voxel_count() as u64);
        log::info!(
            "loading {:?} volume on {} in {} stage(s)",
            volume.dim(),
            self.backend.name(),
            stages.len()
        );
        let voxels = volume.voxel_count() as u64;
        let previous_volume = self.volume.replace(volume);
        let previous_load = self.load.replace(ProgressiveLoad {
            total: stages.len(),
            pending: stages.into(),
            on_progress,
        });
        let previous_factor = self.resident_factor.take();

        if let Err(e) = self.upload_next_stage() {
            log::warn!("first stage upload failed ({e}), keeping the previous volume");
            self.volume = previous_volume;
            // a lost device keeps nothing resident
            if self.state == ViewerState::Active {
                self.load = previous_load;
                self.resident_factor = previous_factor;
            }
            return Err(e);
        }
        self.monitor.set_volume(voxels, memory);
        Ok(())
    }

    fn upload_next_stage(&mut self) -> Result<(), RenderError> {
        let Some(volume) = self.volume.clone() else {
            return Ok(());
        };
        let Some(load) = self.load.as_mut() else {
            return Ok(());
        };
        let Some(factor) = load.pending.pop_front() else {
            return Ok(());
        };
        let stage = load.total - load.pending.len();

        let staged = if factor > 1 {
            Arc::new(volume.downsample(factor))
        } else {
            volume
        };
        if let Err(e) = self.backend.upload(staged) {
            self.load = None;
            if matches!(e, RenderError::DeviceLost) {
                self.suspend();
            }
            return Err(e);
        }
        self.resident_factor = Some(factor);
        self.needs_redraw = true;
        log::debug!("progressive stage {stage} resident (factor {factor})");

        if let Some(load) = self.load.as_mut() {
            let progress = LoadProgress {
                stage,
                stages: load.total,
                factor,
            };
            if let Some(observer) = load.on_progress.as_mut() {
                observer(progress);
            }
            if progress.is_complete() {
                self.load = None;
            }
        }
        Ok(())
    }

    pub fn set_render_mode(&mut self, mode: RenderMode) {
        if self.is_disposed() || self.settings.mode == mode {
            return;
        }
        self.settings.mode = mode;
        self.needs_redraw = true;
    }

    /// Replaces the transfer function, normalizing intensities against
    /// `[min, max]`. An empty or non-finite range falls back to the volume's
    /// observed range.
    pub fn set_transfer_function(&mut self, transfer: TransferFunction, min: f32, max: f32) {
        if self.is_disposed() {
            return;
        }
        self.transfer = transfer;
        self.intensity_range = if min.is_finite() && max.is_finite() && max > min {
            Some((min, max))
        } else {
            log::warn!("ignoring transfer function range [{min}, {max}]");
            None
        };
        self.needs_redraw = true;
    }

    pub fn set_quality(&mut self, quality: QualityLevel) {
        if self.is_disposed() {
            return;
        }
        self.governor.base = quality;
        self.monitor.set_quality(self.governor.current());
        self.needs_redraw = true;
    }

    /// Multiplier for every transfer function opacity. Negative or
    /// non-finite values are ignored.
    pub fn set_opacity(&mut self, opacity: f32) {
        if self.is_disposed() || !opacity.is_finite() || opacity < 0.0 {
            return;
        }
        self.settings.opacity = opacity;
        self.needs_redraw = true;
    }

    pub fn set_brightness_contrast(&mut self, brightness: f32, contrast: f32) {
        if self.is_disposed() || !brightness.is_finite() || !contrast.is_finite() {
            return;
        }
        self.settings.brightness = brightness.max(0.0);
        self.settings.contrast = contrast.max(0.0);
        self.needs_redraw = true;
    }

    pub fn set_iso_threshold(&mut self, threshold: f32) {
        if self.is_disposed() || !threshold.is_finite() {
            return;
        }
        self.settings.iso_threshold = threshold.clamp(0.0, 1.0);
        self.needs_redraw = true;
    }

    pub fn reset_camera(&mut self) {
        self.interact(Camera::reset);
    }

    pub fn rotate_camera(&mut self, dx: f32, dy: f32) {
        self.interact(|camera| camera.orbit(dx, dy));
    }

    pub fn zoom_camera(&mut self, factor: f32) {
        self.interact(|camera| camera.zoom(factor));
    }

    pub fn pan_camera(&mut self, dx: f32, dy: f32) {
        self.interact(|camera| camera.pan(dx, dy));
    }

    fn interact(&mut self, change: impl FnOnce(&mut Camera)) {
        if self.is_disposed() {
            return;
        }
        change(&mut self.camera);
        let now = self.now();
        self.governor.interact(now);
        self.monitor.set_quality(self.governor.current());
        self.needs_redraw = true;
    }

    /// Spins the camera at `speed` radians per second on every tick.
    pub fn start_auto_rotation(&mut self, speed: f32) {
        if self.is_disposed() || !speed.is_finite() {
            return;
        }
        let last = self.now();
        self.auto_rotation = Some(AutoRotation { speed, last });
    }

    pub fn stop_auto_rotation(&mut self) {
        self.auto_rotation = None;
    }

    pub fn is_auto_rotating(&self) -> bool {
        self.auto_rotation.is_some()
    }

    /// Advances timers: device recovery, quality restore, auto-rotation, the
    /// next progressive stage and metrics reporting.
    pub fn tick(&mut self) {
        if self.is_disposed() {
            return;
        }
        let now = self.now();

        if self.state == ViewerState::Active && self.backend.is_device_lost() {
            self.suspend();
        }
        if self.state == ViewerState::Suspended {
            self.try_recover();
            if self.state == ViewerState::Suspended {
                return;
            }
        }

        if self.governor.poll(now) {
            self.monitor.set_quality(self.governor.current());
            self.needs_redraw = true;
        }

        if let Some(rotation) = self.auto_rotation.as_mut() {
            let elapsed = now.saturating_sub(rotation.last).as_secs_f32();
            rotation.last = now;
            if elapsed > 0.0 {
                self.camera.orbit(rotation.speed * elapsed, 0.0);
                self.needs_redraw = true;
            }
        }

        if self.is_loading() {
            if let Err(e) = self.upload_next_stage() {
                log::warn!("progressive load stopped: {e}");
            }
        }

        self.monitor.poll(now);
    }

    fn suspend(&mut self) {
        if self.state == ViewerState::Active {
            log::warn!("{} device lost, viewer suspended", self.backend.name());
            self.state = ViewerState::Suspended;
            self.resident_factor = None;
            self.load = None;
        }
    }

    fn try_recover(&mut self) {
        if let Err(e) = self.backend.recover() {
            log::debug!("device recovery failed: {e}");
            return;
        }
        self.state = ViewerState::Active;
        if let Some(volume) = self.volume.clone() {
            match self.backend.upload(volume) {
                Ok(()) => {
                    self.resident_factor = Some(1);
                    log::info!("device recovered, volume re-uploaded");
                }
                Err(e) => {
                    log::warn!("re-upload after recovery failed: {e}");
                    if matches!(e, RenderError::DeviceLost) {
                        self.suspend();
                        return;
                    }
                }
            }
        }
        if let Some(rotation) = self.auto_rotation.as_mut() {
            rotation.last = self.clock.now();
        }
        self.needs_redraw = true;
    }

    /// Renders one frame of `width` x `height`.
    ///
    /// Returns `Ok(None)` while suspended or after disposal.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::NoVolume`] before a volume is loaded,
    /// [`RenderError::DeviceLost`] on the frame that detects a device loss and
    /// [`RenderError::Unexpected`] for an empty output size.
    pub fn render(&mut self, width: u32, height: u32) -> Result<Option<RasterImage>, RenderError> {
        if self.state != ViewerState::Active {
            return Ok(None);
        }
        if width == 0 || height == 0 {
            return Err(RenderError::Unexpected(format!("empty output size {width}x{height}")));
        }
        if self.backend.is_device_lost() {
            self.suspend();
            return Err(RenderError::DeviceLost);
        }
        let Some(volume) = self.volume.as_ref() else {
            return Err(RenderError::NoVolume);
        };

        let settings = self.effective_settings();
        let request = FrameRequest {
            camera: &self.camera,
            transfer: &self.transfer,
            intensity_range: self.intensity_range.unwrap_or(volume.range),
            settings: &settings,
            width,
            height,
        };
        let start = self.clock.now();
        match self.backend.render(&request) {
            Ok(image) => {
                let end = self.clock.now();
                self.monitor.record_frame(end, end.saturating_sub(start));
                self.needs_redraw = false;
                Ok(Some(image))
            }
            Err(RenderError::DeviceLost) => {
                self.suspend();
                Err(RenderError::DeviceLost)
            }
            Err(e) => Err(e),
        }
    }

    pub fn subscribe_metrics(&mut self, observer: MetricsObserver) {
        if !self.is_disposed() {
            self.monitor.subscribe_metrics(observer);
        }
    }

    pub fn subscribe_warnings(&mut self, observer: WarningObserver) {
        if !self.is_disposed() {
            self.monitor.subscribe_warnings(observer);
        }
    }

    pub fn metrics(&mut self) -> PerformanceMetrics {
        let now = self.now();
        self.monitor.metrics(now)
    }

    /// Releases the backend and drops the volume. Safe to call more than once.
    pub fn dispose(&mut self) {
        if self.is_disposed() {
            return;
        }
        self.state = ViewerState::Disposed;
        self.load = None;
        self.auto_rotation = None;
        self.volume = None;
        self.resident_factor = None;
        self.monitor.clear_observers();
        self.backend.release();
        log::info!("viewer disposed");
    }
}

impl<B: RenderBackend, C: Clock> Drop for VolumeViewer<B, C> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::PerformanceWarning;
    use crate::raycast::SoftwareBackend;
    use crate::settings::{ProgressiveConfig, ResourceLimits};
    use assert_matches::assert_matches;
    use ndarray::Array3;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockBackend {
        uploads: Vec<(usize, usize, usize)>,
        /// Uploads still to be rejected.
        failing_uploads: usize,
        resident: bool,
        renders: Vec<RenderSettings>,
        lost: bool,
        recoverable: bool,
        recoveries: usize,
        releases: usize,
    }

    impl RenderBackend for MockBackend {
        fn name(&self) -> &str {
            "mock"
        }

        fn limits(&self) -> ResourceLimits {
            ResourceLimits::default()
        }

        fn estimated_memory(&self, volume: &VolumeData) -> u64 {
            volume.estimated_bytes()
        }

        fn upload(&mut self, volume: Arc<VolumeData>) -> Result<(), RenderError> {
            if self.lost {
                return Err(RenderError::DeviceLost);
            }
            if self.failing_uploads > 0 {
                self.failing_uploads -= 1;
                return Err(RenderError::Unexpected("upload rejected".to_string()));
            }
            self.uploads.push(volume.dim());
            self.resident = true;
            Ok(())
        }

        fn render(&mut self, request: &FrameRequest) -> Result<RasterImage, RenderError> {
            if self.lost {
                return Err(RenderError::DeviceLost);
            }
            if !self.resident {
                return Err(RenderError::NoVolume);
            }
            self.renders.push(*request.settings);
            Ok(RasterImage::filled(request.width, request.height, [0, 0, 0, 255]))
        }

        fn is_device_lost(&self) -> bool {
            self.lost
        }

        fn recover(&mut self) -> Result<(), RenderError> {
            if !self.recoverable {
                return Err(RenderError::NotSupported("device unavailable".to_string()));
            }
            self.lost = false;
            self.resident = false;
            self.recoveries += 1;
            Ok(())
        }

        fn release(&mut self) {
            self.releases += 1;
            self.resident = false;
        }
    }

    fn config() -> ViewerConfig {
        ViewerConfig {
            progressive: ProgressiveConfig {
                enabled: false,
                ..ProgressiveConfig::default()
            },
            ..ViewerConfig::default()
        }
    }

    fn cube(n: usize) -> VolumeData {
        VolumeData::new(
            Array3::from_shape_fn((n, n, n), |(z, y, x)| (x + y + z) as f32),
            (1.0, 1.0, 1.0),
        )
    }

    fn viewer(config: ViewerConfig) -> (VolumeViewer<MockBackend, ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        (
            VolumeViewer::with_clock(MockBackend::default(), config, clock.clone()),
            clock,
        )
    }

    #[test]
    fn test_dispose_is_terminal_and_idempotent() {
        let (mut viewer, _) = viewer(config());
        assert_matches!(viewer.render(16, 16), Err(RenderError::NoVolume));
        viewer.load_volume(cube(8), None).unwrap();
        assert!(viewer.render(16, 16).unwrap().is_some());

        viewer.dispose();
        viewer.dispose();
        assert_eq!(viewer.state(), ViewerState::Disposed);
        assert_eq!(viewer.backend().releases, 1);

        let camera = *viewer.camera();
        viewer.rotate_camera(1.0, 0.5);
        viewer.set_render_mode(RenderMode::Mip);
        viewer.set_opacity(0.3);
        viewer.start_auto_rotation(1.0);
        viewer.tick();
        assert_eq!(*viewer.camera(), camera);
        assert!(!viewer.is_auto_rotating());
        assert_matches!(viewer.render(16, 16), Ok(None));
        assert_matches!(viewer.load_volume(cube(4), None), Err(RenderError::Unexpected(_)));
        assert_eq!(viewer.backend().renders.len(), 1);
    }

    #[test]
    fn test_failed_upload_keeps_previous_volume() {
        let (mut viewer, _) = viewer(config());
        viewer.load_volume(cube(8), None).unwrap();

        viewer.backend.failing_uploads = 1;
        assert_matches!(viewer.load_volume(cube(4), None), Err(RenderError::Unexpected(_)));
        assert_eq!(viewer.volume().map(|v| v.dim()), Some((8, 8, 8)));
        assert_eq!(viewer.resident_factor(), Some(1));
        assert!(!viewer.is_loading());
        assert_eq!(viewer.backend().uploads, vec![(8, 8, 8)]);
        assert!(viewer.render(8, 8).unwrap().is_some());
    }

    #[test]
    fn test_failed_first_load_leaves_viewer_empty() {
        let (mut viewer, _) = viewer(config());
        viewer.backend.failing_uploads = 1;
        assert!(viewer.load_volume(cube(4), None).is_err());
        assert!(viewer.volume().is_none());
        assert_eq!(viewer.resident_factor(), None);
        assert_matches!(viewer.render(8, 8), Err(RenderError::NoVolume));
    }

    #[test]
    fn test_interaction_lowers_quality_until_idle() {
        let (mut viewer, clock) = viewer(config());
        viewer.load_volume(cube(8), None).unwrap();
        assert_eq!(viewer.quality(), QualityLevel::Medium);

        viewer.rotate_camera(0.1, 0.0);
        assert_eq!(viewer.quality(), QualityLevel::Low);
        viewer.render(8, 8).unwrap();
        assert_eq!(viewer.backend().renders[0].max_samples, QualityLevel::Low.preset().max_samples);

        // continuous interaction keeps the reduced level
        for _ in 0..5 {
            clock.advance(Duration::from_millis(100));
            viewer.zoom_camera(1.1);
            viewer.tick();
            assert_eq!(viewer.quality(), QualityLevel::Low);
        }

        clock.advance(Duration::from_millis(200));
        viewer.tick();
        assert_eq!(viewer.quality(), QualityLevel::Low);
        clock.advance(Duration::from_millis(50));
        viewer.tick();
        assert_eq!(viewer.quality(), QualityLevel::Medium);
        assert!(viewer.needs_redraw());
        viewer.render(8, 8).unwrap();
        assert_eq!(viewer.backend().renders[1].max_samples, QualityLevel::Medium.preset().max_samples);
    }

    #[test]
    fn test_set_quality_changes_base_level() {
        let (mut viewer, clock) = viewer(config());
        viewer.set_quality(QualityLevel::High);
        assert_eq!(viewer.quality(), QualityLevel::High);
        viewer.pan_camera(0.1, 0.0);
        assert_eq!(viewer.quality(), QualityLevel::Low);
        clock.advance(Duration::from_secs(1));
        viewer.tick();
        assert_eq!(viewer.effective_settings().step_size, QualityLevel::High.preset().step_size);
    }

    #[test]
    fn test_device_loss_suspends_and_recovers() {
        let (mut viewer, _) = viewer(config());
        viewer.load_volume(cube(8), None).unwrap();
        viewer.render(8, 8).unwrap();

        viewer.backend.lost = true;
        assert_matches!(viewer.render(8, 8), Err(RenderError::DeviceLost));
        assert_eq!(viewer.state(), ViewerState::Suspended);
        assert_matches!(viewer.render(8, 8), Ok(None));

        // not yet available
        viewer.tick();
        assert_eq!(viewer.state(), ViewerState::Suspended);

        viewer.backend.recoverable = true;
        viewer.tick();
        assert_eq!(viewer.state(), ViewerState::Active);
        assert_eq!(viewer.backend().recoveries, 1);
        assert_eq!(viewer.backend().uploads, vec![(8, 8, 8), (8, 8, 8)]);
        assert!(viewer.render(8, 8).unwrap().is_some());
    }

    #[test]
    fn test_loss_detected_on_tick() {
        let (mut viewer, _) = viewer(config());
        viewer.load_volume(cube(4), None).unwrap();
        viewer.start_auto_rotation(1.0);
        viewer.backend.lost = true;
        let camera = *viewer.camera();
        viewer.tick();
        assert_eq!(viewer.state(), ViewerState::Suspended);
        // no animation while suspended
        assert_eq!(*viewer.camera(), camera);
    }

    #[test]
    fn test_progressive_stages_replace_coarse_volume() {
        let config = ViewerConfig {
            progressive: ProgressiveConfig {
                enabled: true,
                min_voxels: 1,
                factors: vec![4, 2],
            },
            ..ViewerConfig::default()
        };
        let (mut viewer, _) = viewer(config);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        viewer
            .load_volume(cube(16), Some(Box::new(move |p: LoadProgress| sink.lock().unwrap().push(p))))
            .unwrap();

        assert_eq!(viewer.resident_factor(), Some(4));
        assert!(viewer.render(8, 8).unwrap().is_some());
        viewer.tick();
        assert_eq!(viewer.resident_factor(), Some(2));
        viewer.tick();
        assert_eq!(viewer.resident_factor(), Some(1));
        assert!(!viewer.is_loading());
        viewer.tick();

        assert_eq!(viewer.backend().uploads, vec![(4, 4, 4), (8, 8, 8), (16, 16, 16)]);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen[2].is_complete());
        assert_eq!(seen[0], LoadProgress { stage: 1, stages: 3, factor: 4 });
    }

    #[test]
    fn test_new_load_drops_pending_stages() {
        let config = ViewerConfig {
            progressive: ProgressiveConfig {
                enabled: true,
                min_voxels: 1000,
                factors: vec![2],
            },
            ..ViewerConfig::default()
        };
        let (mut viewer, _) = viewer(config);
        viewer.load_volume(cube(16), None).unwrap();
        assert!(viewer.is_loading());
        // below min_voxels: single stage
        viewer.load_volume(cube(4), None).unwrap();
        assert!(!viewer.is_loading());
        viewer.tick();
        assert_eq!(viewer.backend().uploads, vec![(8, 8, 8), (4, 4, 4)]);

        viewer.load_volume(cube(16), None).unwrap();
        viewer.dispose();
        viewer.tick();
        assert_eq!(viewer.backend().uploads.len(), 3);
    }

    #[test]
    fn test_oversized_volume_is_rejected_before_upload() {
        let config = ViewerConfig {
            limits: ResourceLimits {
                max_dimension: 8,
                max_memory_bytes: 1 << 30,
            },
            ..config()
        };
        let (mut viewer, _) = viewer(config);
        assert_matches!(viewer.load_volume(cube(9), None), Err(RenderError::TooLarge(_)));
        assert!(viewer.backend().uploads.is_empty());
        assert_matches!(
            viewer.load_volume(VolumeData::default(), None),
            Err(RenderError::Unexpected(_))
        );
    }

    #[test]
    fn test_auto_rotation_follows_clock() {
        let (mut viewer, clock) = viewer(config());
        viewer.load_volume(cube(4), None).unwrap();
        let start = viewer.camera().position;
        viewer.start_auto_rotation(std::f32::consts::PI);
        clock.advance(Duration::from_millis(500));
        viewer.tick();
        let moved = viewer.camera().position;
        assert!((moved.x - start.x).abs() > 1.0, "camera at {moved:?}");
        // auto-rotation does not count as interaction
        assert_eq!(viewer.quality(), QualityLevel::Medium);

        viewer.stop_auto_rotation();
        clock.advance(Duration::from_millis(500));
        viewer.tick();
        assert_eq!(viewer.camera().position, moved);
    }

    #[test]
    fn test_metrics_and_warnings_reach_observers() {
        let config = ViewerConfig {
            warnings: crate::settings::WarningThresholds {
                large_volume_voxels: 100,
                ..Default::default()
            },
            ..config()
        };
        let (mut viewer, clock) = viewer(config);
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&warnings);
        viewer.subscribe_warnings(Box::new(move |w: &PerformanceWarning| sink.lock().unwrap().push(*w)));
        let reports = Arc::new(Mutex::new(Vec::new()));
        let report_sink = Arc::clone(&reports);
        viewer.subscribe_metrics(Box::new(move |m: &PerformanceMetrics| report_sink.lock().unwrap().push(*m)));

        viewer.load_volume(cube(8), None).unwrap();
        viewer.render(8, 8).unwrap();
        clock.advance(Duration::from_millis(10));
        viewer.tick();

        assert_matches!(
            warnings.lock().unwrap().as_slice(),
            [PerformanceWarning::LargeVolume { voxels: 512, .. }]
        );
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].fps, 1.0);
        assert_eq!(reports[0].voxel_count, 512);
    }

    #[test]
    fn test_software_backend_end_to_end() {
        let mut viewer = VolumeViewer::new(SoftwareBackend::new(), config());
        viewer.load_volume(cube(6), None).unwrap();
        viewer.set_transfer_function(TransferFunction::ct_bone(), 0.0, 15.0);
        viewer.set_render_mode(RenderMode::Mip);
        let image = viewer.render(20, 10).unwrap().unwrap();
        assert_eq!((image.width, image.height), (20, 10));
        assert_matches!(viewer.render(0, 10), Err(RenderError::Unexpected(_)));
    }
}
