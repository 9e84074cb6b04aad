//! Frame timing, memory accounting and threshold warnings.

use crate::enums::QualityLevel;
use crate::settings::WarningThresholds;

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

const FPS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    /// Frames rendered during the last second.
    pub fps: f32,
    pub last_render_ms: f32,
    pub estimated_memory_bytes: u64,
    pub voxel_count: u64,
    pub quality: QualityLevel,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PerformanceWarning {
    LowFrameRate { fps: f32, min_fps: f32 },
    LargeVolume { voxels: u64, threshold: u64 },
    HighMemory { bytes: u64, threshold: u64 },
}

impl PerformanceWarning {
    fn slot(&self) -> usize {
        match self {
            PerformanceWarning::LowFrameRate { .. } => 0,
            PerformanceWarning::LargeVolume { .. } => 1,
            PerformanceWarning::HighMemory { .. } => 2,
        }
    }
}

impl fmt::Display for PerformanceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerformanceWarning::LowFrameRate { fps, min_fps } => {
                write!(f, "frame rate {fps:.1} fps below {min_fps:.1} fps")
            }
            PerformanceWarning::LargeVolume { voxels, threshold } => {
                write!(f, "volume of {voxels} voxels exceeds {threshold}")
            }
            PerformanceWarning::HighMemory { bytes, threshold } => {
                write!(f, "volume needs {} MiB, above {} MiB", bytes >> 20, threshold >> 20)
            }
        }
    }
}

pub type MetricsObserver = Box<dyn FnMut(&PerformanceMetrics) + Send>;
pub type WarningObserver = Box<dyn FnMut(&PerformanceWarning) + Send>;

/// Collects render timings and notifies observers.
///
/// Metrics are reported at most once per interval from [`PerformanceMonitor::poll`].
/// A warning is delivered when its condition starts to hold and re-armed once
/// it clears.
pub struct PerformanceMonitor {
    thresholds: WarningThresholds,
    interval: Duration,
    frames: VecDeque<Duration>,
    first_frame: Option<Duration>,
    last_render: Duration,
    memory: u64,
    voxels: u64,
    quality: QualityLevel,
    last_report: Option<Duration>,
    active: [bool; 3],
    metrics_observers: Vec<MetricsObserver>,
    warning_observers: Vec<WarningObserver>,
}

impl PerformanceMonitor {
    pub fn new(thresholds: WarningThresholds, interval: Duration) -> Self {
        Self {
            thresholds,
            interval,
            frames: VecDeque::new(),
            first_frame: None,
            last_render: Duration::ZERO,
            memory: 0,
            voxels: 0,
            quality: QualityLevel::default(),
            last_report: None,
            active: [false; 3],
            metrics_observers: Vec::new(),
            warning_observers: Vec::new(),
        }
    }

    pub fn subscribe_metrics(&mut self, observer: MetricsObserver) {
        self.metrics_observers.push(observer);
    }

    pub fn subscribe_warnings(&mut self, observer: WarningObserver) {
        self.warning_observers.push(observer);
    }

    pub fn clear_observers(&mut self) {
        self.metrics_observers.clear();
        self.warning_observers.clear();
    }

    /// Records the resident volume and checks the size thresholds.
    pub fn set_volume(&mut self, voxels: u64, memory: u64) {
        self.voxels = voxels;
        self.memory = memory;
        let large = PerformanceWarning::LargeVolume {
            voxels,
            threshold: self.thresholds.large_volume_voxels,
        };
        self.update(large, voxels > self.thresholds.large_volume_voxels);
        let high = PerformanceWarning::HighMemory {
            bytes: memory,
            threshold: self.thresholds.high_memory_bytes,
        };
        self.update(high, memory > self.thresholds.high_memory_bytes);
    }

    pub fn set_quality(&mut self, quality: QualityLevel) {
        self.quality = quality;
    }

    pub fn record_frame(&mut self, now: Duration, render_time: Duration) {
        self.first_frame.get_or_insert(now);
        self.frames.push_back(now);
        self.last_render = render_time;
        self.trim(now);
    }

    fn trim(&mut self, now: Duration) {
        while self
            .frames
            .front()
            .is_some_and(|&t| now.saturating_sub(t) >= FPS_WINDOW)
        {
            self.frames.pop_front();
        }
    }

    pub fn metrics(&mut self, now: Duration) -> PerformanceMetrics {
        self.trim(now);
        PerformanceMetrics {
            fps: self.frames.len() as f32,
            last_render_ms: self.last_render.as_secs_f32() * 1000.0,
            estimated_memory_bytes: self.memory,
            voxel_count: self.voxels,
            quality: self.quality,
        }
    }

    /// Reports metrics when the interval has elapsed and evaluates the frame
    /// rate once a full window of frames has been observed.
    pub fn poll(&mut self, now: Duration) {
        if self
            .last_report
            .is_some_and(|last| now.saturating_sub(last) < self.interval)
        {
            return;
        }
        self.last_report = Some(now);
        let metrics = self.metrics(now);
        for observer in &mut self.metrics_observers {
            observer(&metrics);
        }

        let full_window = self
            .first_frame
            .is_some_and(|first| now.saturating_sub(first) >= FPS_WINDOW);
        if full_window && !self.frames.is_empty() {
            let low = PerformanceWarning::LowFrameRate {
                fps: metrics.fps,
                min_fps: self.thresholds.min_fps,
            };
            self.update(low, metrics.fps < self.thresholds.min_fps);
        }
    }

    fn update(&mut self, warning: PerformanceWarning, holds: bool) {
        let slot = warning.slot();
        if holds && !self.active[slot] {
            log::warn!("performance warning: {warning}");
            for observer in &mut self.warning_observers {
                observer(&warning);
            }
        }
        self.active[slot] = holds;
    }
}
