//! Compute-shader ray casting on wgpu.

use crate::error::RenderError;
use crate::raster::RasterImage;
use crate::raycast::{EARLY_EXIT_ALPHA, FrameRequest, RenderBackend};
use crate::settings::ResourceLimits;
use crate::volume::VolumeData;

use half::f16;
use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use wgpu::{PollType, util::DeviceExt};

const WORKGROUP_SIZE: u32 = 8;
const LUT_ENTRIES: usize = 256;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct Uniforms {
    eye: [f32; 4],
    forward: [f32; 4],
    right: [f32; 4],
    up: [f32; 4],
    box_half: [f32; 4],
    window: [f32; 4],
    shading: [f32; 4],
    dims: [f32; 4],
    output: [u32; 4],
}

/// Device, queue and pipeline objects. Replaced as a whole after a loss.
struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    lost: Arc<AtomicBool>,
}

impl GpuContext {
    async fn create(adapter: &wgpu::Adapter) -> Result<Self, RenderError> {
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Volume Raycast Device"),
                ..Default::default()
            })
            .await
            .map_err(|e| RenderError::NotSupported(e.to_string()))?;

        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            log::warn!("GPU device lost ({reason:?}): {message}");
            flag.store(true, Ordering::Release);
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Volume Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Volume Raycast Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("shaders/raycast.wgsl"))),
        });

        let buffer_entry = |binding, ty| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Volume Raycast Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D3,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                // packed RGBA output
                buffer_entry(2, wgpu::BufferBindingType::Storage { read_only: false }),
                buffer_entry(3, wgpu::BufferBindingType::Uniform),
                // baked transfer function
                buffer_entry(4, wgpu::BufferBindingType::Storage { read_only: true }),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Volume Raycast Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Volume Raycast Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            sampler,
            lost,
        })
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

/// Volume texture resident on the device.
struct ResidentVolume {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    /// (width, height, depth) in voxels.
    dims: [u32; 3],
    half: [f32; 3],
    max_dimension: u32,
    range: (f32, f32),
}

/// [`RenderBackend`] executing the ray march in a compute shader over a
/// half-float 3D texture with hardware trilinear filtering.
pub struct GpuRaycaster {
    adapter: wgpu::Adapter,
    adapter_name: String,
    context: Option<GpuContext>,
    volume: Option<ResidentVolume>,
    limits: ResourceLimits,
}

impl GpuRaycaster {
    /// Requests a high performance adapter and a device on it.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::NotSupported`] when no adapter or device is
    /// available.
    pub async fn new(limits: ResourceLimits) -> Result<Self, RenderError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .map_err(|e| RenderError::NotSupported(e.to_string()))?;
        let adapter_name = adapter.get_info().name;
        let context = GpuContext::create(&adapter).await?;
        log::info!("GPU ray caster on {adapter_name}");

        Ok(Self {
            adapter,
            adapter_name,
            context: Some(context),
            volume: None,
            limits,
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn live_context(&self) -> Result<&GpuContext, RenderError> {
        match &self.context {
            Some(context) if !context.is_lost() => Ok(context),
            _ => Err(RenderError::DeviceLost),
        }
    }

    fn dispatch(
        context: &GpuContext,
        resident: &ResidentVolume,
        request: &FrameRequest,
    ) -> Result<Vec<u8>, RenderError> {
        let (width, height) = (request.width, request.height);
        let output_size = (width as u64) * (height as u64) * size_of::<u32>() as u64;
        if output_size > context.device.limits().max_storage_buffer_binding_size as u64 {
            return Err(RenderError::TooLarge(format!(
                "output of {width}x{height} exceeds the storage buffer limit"
            )));
        }

        let uniforms = Self::uniforms(resident, request);
        let uniform_buffer = context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Raycast Uniform Buffer"),
                contents: bytemuck::bytes_of(&uniforms),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let lut = request.transfer.bake(LUT_ENTRIES);
        let lut_buffer = context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Transfer Function Buffer"),
                contents: bytemuck::cast_slice(&lut),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let output_buffer = context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Raycast Output Buffer"),
            size: output_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging_buffer = context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Raycast Staging Buffer"),
            size: output_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group = context.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Volume Raycast Bind Group"),
            layout: &context.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&resident.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&context.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: output_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: lut_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Volume Raycast Encoder"),
            });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Volume Raycast Pass"),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(&context.pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            compute_pass.dispatch_workgroups(
                width.div_ceil(WORKGROUP_SIZE),
                height.div_ceil(WORKGROUP_SIZE),
                1,
            );
        }
        encoder.copy_buffer_to_buffer(&output_buffer, 0, &staging_buffer, 0, output_size);
        context.queue.submit(Some(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        context
            .device
            .poll(PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| Self::failure(context, e.to_string()))?;
        futures::executor::block_on(receiver)
            .map_err(|_| Self::failure(context, "readback callback dropped".to_string()))?
            .map_err(|e| Self::failure(context, e.to_string()))?;

        let pixels = {
            let data = buffer_slice.get_mapped_range();
            bytemuck::cast_slice::<u8, u32>(&data)
                .iter()
                .flat_map(|packed| packed.to_le_bytes())
                .collect()
        };
        staging_buffer.unmap();
        Ok(pixels)
    }

    fn failure(context: &GpuContext, message: String) -> RenderError {
        if context.is_lost() {
            RenderError::DeviceLost
        } else {
            RenderError::Unexpected(message)
        }
    }

    fn uniforms(resident: &ResidentVolume, request: &FrameRequest) -> Uniforms {
        let basis = request.camera.basis();
        let eye = request.camera.position;
        let settings = request.settings;
        let tan_half = (request.camera.fov_y_degrees.to_radians() * 0.5).tan();
        let aspect = request.width as f32 / request.height.max(1) as f32;
        let step = settings.step_size.max(1e-3) / resident.max_dimension.max(1) as f32;

        // texels hold values normalized against the volume's own range;
        // rescale them to the requested intensity range
        let (vmin, vmax) = resident.range;
        let volume_span = if vmax > vmin { vmax - vmin } else { 1.0 };
        let (low, high) = request.intensity_range;
        let span = if high > low { high - low } else { 1.0 };

        let [hx, hy, hz] = resident.half;
        let [w, h, d] = resident.dims;
        Uniforms {
            eye: [eye.x, eye.y, eye.z, tan_half],
            forward: [basis.forward.x, basis.forward.y, basis.forward.z, aspect],
            right: [basis.right.x, basis.right.y, basis.right.z, 0.0],
            up: [basis.up.x, basis.up.y, basis.up.z, 0.0],
            box_half: [hx, hy, hz, step],
            window: [
                volume_span / span,
                (vmin - low) / span,
                settings.iso_threshold,
                settings.opacity,
            ],
            shading: [settings.brightness, settings.contrast, EARLY_EXIT_ALPHA, 0.0],
            dims: [w as f32, h as f32, d as f32, 0.0],
            output: [
                request.width,
                request.height,
                settings.mode.shader_index(),
                settings.max_samples.max(1),
            ],
        }
    }
}

impl RenderBackend for GpuRaycaster {
    fn name(&self) -> &str {
        "gpu"
    }

    fn limits(&self) -> ResourceLimits {
        match &self.context {
            Some(context) => self.limits.min(ResourceLimits {
                max_dimension: context.device.limits().max_texture_dimension_3d,
                max_memory_bytes: u64::MAX,
            }),
            None => self.limits,
        }
    }

    fn estimated_memory(&self, volume: &VolumeData) -> u64 {
        (volume.voxel_count() * size_of::<f16>()) as u64
    }

    fn upload(&mut self, volume: Arc<VolumeData>) -> Result<(), RenderError> {
        self.limits()
            .check(volume.dim(), self.estimated_memory(&volume))?;
        let context = self.live_context()?;
        if volume.is_empty() {
            return Err(RenderError::Unexpected("volume has no voxels".to_string()));
        }

        let (depth, height, width) = volume.dim();
        let (depth, height, width) = (depth as u32, height as u32, width as u32);
        let texture_size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: depth,
        };
        let texture = context.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Volume 3D Texture"),
            size: texture_size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format: wgpu::TextureFormat::R16Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let texels: Vec<f16> = volume.normalized_voxels().map(f16::from_f32).collect();
        context.queue.write_texture(
            wgpu::TexelCopyTextureInfoBase {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&texels),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * size_of::<f16>() as u32),
                rows_per_image: Some(height),
            },
            texture_size,
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        if let Some(previous) = self.volume.take() {
            previous.texture.destroy();
        }
        log::debug!("uploaded {width}x{height}x{depth} volume texture");
        self.volume = Some(ResidentVolume {
            texture,
            view,
            dims: [width, height, depth],
            half: volume.box_half_extents(),
            max_dimension: volume.max_dimension() as u32,
            range: volume.range,
        });
        Ok(())
    }

    fn render(&mut self, request: &FrameRequest) -> Result<RasterImage, RenderError> {
        let context = self.live_context()?;
        let resident = self.volume.as_ref().ok_or(RenderError::NoVolume)?;
        if request.width == 0 || request.height == 0 {
            return Err(RenderError::Unexpected(format!(
                "empty output size {}x{}",
                request.width, request.height
            )));
        }
        let pixels = Self::dispatch(context, resident, request)?;
        RasterImage::new(request.width, request.height, pixels)
            .ok_or_else(|| RenderError::Unexpected("readback size mismatch".to_string()))
    }

    fn is_device_lost(&self) -> bool {
        self.context.as_ref().is_none_or(GpuContext::is_lost)
    }

    fn recover(&mut self) -> Result<(), RenderError> {
        if !self.is_device_lost() {
            return Ok(());
        }
        self.volume = None;
        if let Some(stale) = self.context.take() {
            stale.device.destroy();
        }
        let context = futures::executor::block_on(GpuContext::create(&self.adapter))?;
        log::info!("GPU device re-created on {}", self.adapter_name);
        self.context = Some(context);
        Ok(())
    }

    fn release(&mut self) {
        if let Some(resident) = self.volume.take() {
            resident.texture.destroy();
        }
        if let Some(context) = self.context.take() {
            context.device.destroy();
            log::debug!("GPU resources released");
        }
    }
}

impl Drop for GpuRaycaster {
    fn drop(&mut self) {
        self.release();
    }
}
