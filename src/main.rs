use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dicom_render::{
    FrameOutcome, GpuRaycaster, RenderBackend, RenderMode, SoftwareBackend, SortBy,
    TransferFunction, ViewerConfig, VolumeLoader, VolumeViewer, Window,
    error::RenderError,
    render_frame_or_placeholder,
    settings::ConfigError,
    volume_loader::AssemblyError,
};
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render one frame of a slice to PNG
    Frame {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Frame index within the slice
        #[arg(short, long, default_value_t = 0)]
        frame: u32,

        /// Window center, used together with --width
        #[arg(long, requires = "width", allow_hyphen_values = true)]
        center: Option<f64>,

        /// Window width, used together with --center
        #[arg(long, requires = "center")]
        width: Option<f64>,

        #[arg(short, long, default_value = "frame.png")]
        output: PathBuf,
    },
    /// Stack a directory of slices and ray cast it to PNG
    Volume {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// mip, composite or isosurface
        #[arg(short, long, default_value = "composite")]
        mode: RenderMode,

        /// Transfer function preset: grayscale, ct-bone or ct-soft-tissue
        #[arg(short, long, default_value = "grayscale")]
        preset: String,

        /// Slice order: instance, position or none
        #[arg(long, default_value = "instance", value_parser = parse_sort)]
        sort: SortBy,

        /// Use the software ray caster even when a GPU is available
        #[arg(long)]
        cpu: bool,

        /// Output size as WIDTHxHEIGHT
        #[arg(short, long, default_value = "512x512", value_parser = parse_size)]
        size: (u32, u32),

        /// Camera orbit in radians as YAW,PITCH
        #[arg(long, default_value = "0.5,0.3", value_parser = parse_orbit, allow_hyphen_values = true)]
        orbit: (f32, f32),

        /// Viewer configuration JSON
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(short, long, default_value = "volume.png")]
        output: PathBuf,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode PNG: {0}")]
    Encode(#[from] image::ImageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("Unknown transfer function preset: {0}")]
    UnknownPreset(String),

    #[error("Viewer produced no image")]
    NoImage,
}

fn parse_sort(s: &str) -> Result<SortBy, String> {
    match s.to_ascii_lowercase().as_str() {
        "instance" => Ok(SortBy::InstanceNumber),
        "position" => Ok(SortBy::ImagePositionPatient),
        "none" => Ok(SortBy::None),
        other => Err(format!("unknown sort order: {other}")),
    }
}

fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s}"))?;
    let w: u32 = w.trim().parse().map_err(|e| format!("invalid width: {e}"))?;
    let h: u32 = h.trim().parse().map_err(|e| format!("invalid height: {e}"))?;
    if w == 0 || h == 0 {
        return Err("size must be positive".to_string());
    }
    Ok((w, h))
}

fn parse_orbit(s: &str) -> Result<(f32, f32), String> {
    let (yaw, pitch) = s
        .split_once(',')
        .ok_or_else(|| format!("expected YAW,PITCH, got {s}"))?;
    let yaw = yaw.trim().parse().map_err(|e| format!("invalid yaw: {e}"))?;
    let pitch = pitch.trim().parse().map_err(|e| format!("invalid pitch: {e}"))?;
    Ok((yaw, pitch))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let _ = env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .try_init();

    let result = match Args::parse().command {
        Command::Frame {
            file,
            frame,
            center,
            width,
            output,
        } => render_frame_command(file, frame, center.zip(width), output),
        Command::Volume {
            dir,
            mode,
            preset,
            sort,
            cpu,
            size,
            orbit,
            config,
            output,
        } => {
            let options = VolumeOptions {
                mode,
                preset,
                sort,
                cpu,
                size,
                orbit,
                config,
            };
            render_volume_command(dir, options, output).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn render_frame_command(
    file: PathBuf,
    frame: u32,
    window: Option<(f64, f64)>,
    output: PathBuf,
) -> Result<(), CliError> {
    let bytes = std::fs::read(&file)?;
    let window = window.map(|(center, width)| Window::new(center, width));
    let outcome = render_frame_or_placeholder(&bytes, frame, window);
    if let FrameOutcome::Placeholder { reason, .. } = &outcome {
        log::warn!("{}: {reason}, writing placeholder", file.display());
    }
    std::fs::write(&output, outcome.raster().to_png()?)?;
    println!("{}", output.display());
    Ok(())
}

struct VolumeOptions {
    mode: RenderMode,
    preset: String,
    sort: SortBy,
    cpu: bool,
    size: (u32, u32),
    orbit: (f32, f32),
    config: Option<PathBuf>,
}

async fn create_backend(cpu: bool, config: &ViewerConfig) -> Box<dyn RenderBackend> {
    if cpu {
        return Box::new(SoftwareBackend::with_limits(config.limits));
    }
    match GpuRaycaster::new(config.limits).await {
        Ok(gpu) => Box::new(gpu),
        Err(e) => {
            log::warn!("{e}, falling back to the software ray caster");
            Box::new(SoftwareBackend::with_limits(config.limits))
        }
    }
}

async fn render_volume_command(
    dir: PathBuf,
    options: VolumeOptions,
    output: PathBuf,
) -> Result<(), CliError> {
    let mut config = match &options.config {
        Some(path) => ViewerConfig::from_path(path)?,
        None => ViewerConfig::default(),
    };
    // one still frame: no previews, no reduced interaction quality
    config.progressive.enabled = false;
    config.interaction_quality = config.default_quality;

    let transfer = TransferFunction::preset(&options.preset)
        .ok_or_else(|| CliError::UnknownPreset(options.preset.clone()))?;

    let assembly = VolumeLoader::load_from_directory(&dir, options.sort)?;
    for skipped in &assembly.skipped {
        log::warn!("skipped {}: {}", skipped.id, skipped.reason);
    }
    let range = assembly.volume.range;

    let backend = create_backend(options.cpu, &config).await;
    let mut viewer = VolumeViewer::new(backend, config);
    viewer.load_volume(assembly.volume, None)?;
    viewer.set_render_mode(options.mode);
    viewer.set_transfer_function(transfer, range.0, range.1);
    viewer.rotate_camera(options.orbit.0, options.orbit.1);

    let (width, height) = options.size;
    let image = viewer.render(width, height)?.ok_or(CliError::NoImage)?;
    std::fs::write(&output, image.to_png()?)?;
    println!("{}", output.display());
    viewer.dispose();
    Ok(())
}
