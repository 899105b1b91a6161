//! wgpu compute executor for the stage kernels

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use log::{error, info, trace};
use tokio::sync::oneshot;
use wgpu::{
    BindGroupLayout, Buffer, ComputePipeline, Device, Queue, Sampler, Texture, TextureView,
};

use crate::backend::{FluidBackend, Kernel, Relaxation, SourceTerm, StageContext};
use crate::config::Palette;
use crate::error::{FluidError, Result};
use crate::grid::{GridSize, WORKGROUP_SIZE};
use crate::texture::{
    FilterMode, GridTexture, HostTexture, SampleFormat, TextureDesc, TextureFactory, WrapMode,
};

const STAGE_SHADER: &str = include_str!("shaders/stages.wgsl");

const OUTPUT_FORMATS: [SampleFormat; 3] = [
    SampleFormat::R32Float,
    SampleFormat::Rg32Float,
    SampleFormat::Rgba32Float,
];

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
struct StageUniforms {
    size: [u32; 2],
    dt: f32,
    a: f32,
    b: f32,
    inv: f32,
    radius: f32,
    _padding: f32,
    amount: [f32; 4],
    center: [f32; 4],
    ink: [f32; 4],
    flow: [f32; 4],
}

impl StageUniforms {
    fn new(ctx: &StageContext) -> Self {
        let grid = ctx.grid();
        Self {
            size: [grid.width, grid.height],
            dt: ctx.dt,
            ..Default::default()
        }
    }
}

impl SampleFormat {
    fn wgpu_format(self) -> wgpu::TextureFormat {
        match self {
            SampleFormat::R32Float => wgpu::TextureFormat::R32Float,
            SampleFormat::Rg32Float => wgpu::TextureFormat::Rg32Float,
            SampleFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        }
    }

    fn wgsl_name(self) -> &'static str {
        match self {
            SampleFormat::R32Float => "r32float",
            SampleFormat::Rg32Float => "rg32float",
            SampleFormat::Rgba32Float => "rgba32float",
        }
    }
}

impl From<WrapMode> for wgpu::AddressMode {
    fn from(mode: WrapMode) -> Self {
        match mode {
            WrapMode::Clamp => wgpu::AddressMode::ClampToEdge,
            WrapMode::Repeat => wgpu::AddressMode::Repeat,
        }
    }
}

impl From<FilterMode> for wgpu::FilterMode {
    fn from(mode: FilterMode) -> Self {
        match mode {
            FilterMode::Point => wgpu::FilterMode::Nearest,
            FilterMode::Bilinear => wgpu::FilterMode::Linear,
        }
    }
}

/// A field buffer resident on the GPU.
pub struct GpuTexture {
    texture: Texture,
    view: TextureView,
    sampler: Sampler,
    size: GridSize,
    format: SampleFormat,
}

impl GpuTexture {
    pub fn texture(&self) -> &Texture {
        &self.texture
    }

    pub fn view(&self) -> &TextureView {
        &self.view
    }

    /// Sampler matching the wrap and filter modes the buffer was requested with.
    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }
}

impl GridTexture for GpuTexture {
    fn size(&self) -> GridSize {
        self.size
    }

    fn format(&self) -> SampleFormat {
        self.format
    }
}

fn extent(size: GridSize) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.width,
        height: size.height,
        depth_or_array_layers: 1,
    }
}

fn copy_target(texture: &Texture) -> wgpu::ImageCopyTexture<'_> {
    wgpu::ImageCopyTexture {
        texture,
        mip_level: 0,
        origin: wgpu::Origin3d::ZERO,
        aspect: wgpu::TextureAspect::All,
    }
}

/// Compute pipelines for every [`Kernel`], resolved once at construction.
struct KernelTable {
    pipelines: HashMap<Kernel, ComputePipeline>,
    layouts: HashMap<SampleFormat, BindGroupLayout>,
}

impl KernelTable {
    async fn build(device: &Device, workgroup: [u32; 2]) -> Result<Self> {
        let mut layouts = HashMap::new();
        let mut modules = HashMap::new();
        let mut pipeline_layouts = HashMap::new();

        for format in OUTPUT_FORMATS {
            let source = STAGE_SHADER
                .replace("{{OUTPUT_FORMAT}}", format.wgsl_name())
                .replace("{{WORKGROUP_X}}", &workgroup[0].to_string())
                .replace("{{WORKGROUP_Y}}", &workgroup[1].to_string());

            for kernel in Kernel::ALL.iter().filter(|k| k.output_format() == format) {
                if !source.contains(&format!("fn {}(", kernel.entry_point())) {
                    return Err(FluidError::KernelResolution {
                        kernel: kernel.label(),
                        reason: format!("entry point `{}` is missing", kernel.entry_point()),
                    });
                }
            }

            device.push_error_scope(wgpu::ErrorFilter::Validation);
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(format.wgsl_name()),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            if let Some(err) = device.pop_error_scope().await {
                return Err(FluidError::KernelResolution {
                    kernel: format.wgsl_name(),
                    reason: err.to_string(),
                });
            }

            let layout = stage_layout(device, format);
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Stage Pipeline Layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            layouts.insert(format, layout);
            modules.insert(format, module);
            pipeline_layouts.insert(format, pipeline_layout);
        }

        let mut pipelines = HashMap::new();
        for kernel in Kernel::ALL {
            let format = kernel.output_format();
            device.push_error_scope(wgpu::ErrorFilter::Validation);
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(kernel.label()),
                layout: pipeline_layouts.get(&format),
                module: &modules[&format],
                entry_point: kernel.entry_point(),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            });
            if let Some(err) = device.pop_error_scope().await {
                return Err(FluidError::KernelResolution {
                    kernel: kernel.label(),
                    reason: err.to_string(),
                });
            }
            pipelines.insert(kernel, pipeline);
        }

        Ok(Self { pipelines, layouts })
    }

    /// The pipeline and bind group layout for `kernel` writing a `target` texture.
    fn resolve(
        &self,
        kernel: Kernel,
        target: SampleFormat,
    ) -> Result<(&ComputePipeline, &BindGroupLayout)> {
        let format = kernel.output_format();
        if target != format {
            return Err(FluidError::KernelResolution {
                kernel: kernel.label(),
                reason: format!("writes {format:?} but was given a {target:?} target"),
            });
        }
        match (self.pipelines.get(&kernel), self.layouts.get(&format)) {
            (Some(pipeline), Some(layout)) => Ok((pipeline, layout)),
            _ => Err(FluidError::KernelResolution {
                kernel: kernel.label(),
                reason: "not in the kernel table".into(),
            }),
        }
    }
}

fn stage_layout(device: &Device, format: SampleFormat) -> BindGroupLayout {
    let sampled = |binding| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    };

    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Stage Bind Group Layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: wgpu::BufferSize::new(
                        std::mem::size_of::<StageUniforms>() as u64,
                    ),
                },
                count: None,
            },
            sampled(1),
            sampled(2),
            wgpu::BindGroupLayoutEntry {
                binding: 3,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::StorageTexture {
                    access: wgpu::StorageTextureAccess::WriteOnly,
                    format: format.wgpu_format(),
                    view_dimension: wgpu::TextureViewDimension::D2,
                },
                count: None,
            },
        ],
    })
}

pub struct GpuBackend {
    device: Device,
    queue: Queue,
    uniforms: Buffer,
    kernels: KernelTable,
    workgroup: [u32; 2],
}

impl GpuBackend {
    pub async fn new() -> Result<Self> {
        Self::with_workgroup(WORKGROUP_SIZE).await
    }

    pub async fn with_workgroup(workgroup: [u32; 2]) -> Result<Self> {
        let instance = wgpu::Instance::default();

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(FluidError::Adapter)?;
        info!("using GPU adapter {}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Fluid Solver Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults()
                        .using_resolution(adapter.limits()),
                },
                None,
            )
            .await?;

        Self::from_device(device, queue, workgroup).await
    }

    /// Builds the kernel table on an existing device. Fails before any frame if
    /// an entry point cannot be resolved.
    pub async fn from_device(device: Device, queue: Queue, workgroup: [u32; 2]) -> Result<Self> {
        if workgroup[0] == 0 || workgroup[1] == 0 {
            return Err(FluidError::KernelResolution {
                kernel: "all",
                reason: format!("work-group {workgroup:?} has a zero dimension"),
            });
        }

        let kernels = KernelTable::build(&device, workgroup).await?;
        let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Stage Uniforms"),
            size: std::mem::size_of::<StageUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        info!("resolved {} compute kernels", kernels.pipelines.len());

        Ok(Self {
            device,
            queue,
            uniforms,
            kernels,
            workgroup,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Records and submits one kernel launch.
    ///
    /// Each launch is its own submission, so the uniform write lands before it
    /// and every earlier launch has completed its writes.
    fn dispatch(
        &self,
        kernel: Kernel,
        ctx: &StageContext,
        uniforms: StageUniforms,
        field_a: &GpuTexture,
        field_b: &GpuTexture,
        out: &GpuTexture,
    ) {
        // Every kernel is resolved in `new` and every field is allocated with
        // its kernel's format.
        let (pipeline, layout) = match self.kernels.resolve(kernel, out.format) {
            Ok(resolved) => resolved,
            Err(err) => {
                error!("{err}");
                debug_assert!(false, "{err}");
                return;
            }
        };

        self.queue
            .write_buffer(&self.uniforms, 0, bytemuck::bytes_of(&uniforms));

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.label()),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&field_a.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&field_b.view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&out.view),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Stage Encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.label()),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let [groups_x, groups_y] = ctx.dispatch.groups;
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        trace!("{} dispatched {:?} groups", kernel.label(), ctx.dispatch.groups);
        self.queue.submit(std::iter::once(encoder.finish()));
    }
}

impl TextureFactory for GpuBackend {
    type Texture = GpuTexture;

    fn ensure(&mut self, desc: &TextureDesc, existing: Option<GpuTexture>) -> Result<GpuTexture> {
        if let Some(texture) = existing {
            if desc.matches(&texture) {
                return Ok(texture);
            }
            texture.texture.destroy();
        }

        let max = self.device.limits().max_texture_dimension_2d;
        if desc.size.is_empty() || desc.size.width > max || desc.size.height > max {
            return Err(FluidError::Allocation {
                label: desc.label,
                width: desc.size.width,
                height: desc.size.height,
                reason: format!("dimensions must be within 1..={max}"),
            });
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: extent(desc.size),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: desc.format.wgpu_format(),
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some(desc.label),
            address_mode_u: desc.wrap.into(),
            address_mode_v: desc.wrap.into(),
            address_mode_w: desc.wrap.into(),
            mag_filter: desc.filter.into(),
            min_filter: desc.filter.into(),
            ..Default::default()
        });

        let mut texture = GpuTexture {
            texture,
            view,
            sampler,
            size: desc.size,
            format: desc.format,
        };
        let zeros = HostTexture::zeroed(desc.size, desc.format)?;
        self.upload(&mut texture, &zeros)?;
        Ok(texture)
    }
}

impl FluidBackend for GpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn workgroup_size(&self) -> [u32; 2] {
        self.workgroup
    }

    fn add_source(
        &mut self,
        ctx: &StageContext,
        field: &GpuTexture,
        out: &mut GpuTexture,
        source: &SourceTerm,
    ) {
        let uniforms = StageUniforms {
            radius: source.radius,
            amount: source.amount.to_array(),
            center: [source.center.0 as f32, source.center.1 as f32, 0.0, 0.0],
            ..StageUniforms::new(ctx)
        };
        self.dispatch(Kernel::add_source(out.format), ctx, uniforms, field, field, out);
    }

    fn relax(
        &mut self,
        ctx: &StageContext,
        x0: &GpuTexture,
        iterate: &GpuTexture,
        out: &mut GpuTexture,
        coefficients: Relaxation,
    ) {
        let uniforms = StageUniforms {
            a: coefficients.a,
            b: coefficients.b,
            inv: coefficients.inv,
            ..StageUniforms::new(ctx)
        };
        self.dispatch(Kernel::relax(out.format), ctx, uniforms, x0, iterate, out);
    }

    fn advect(
        &mut self,
        ctx: &StageContext,
        field: &GpuTexture,
        velocity: &GpuTexture,
        out: &mut GpuTexture,
    ) {
        let uniforms = StageUniforms::new(ctx);
        self.dispatch(Kernel::advect(out.format), ctx, uniforms, field, velocity, out);
    }

    fn divergence(&mut self, ctx: &StageContext, velocity: &GpuTexture, out: &mut GpuTexture) {
        let uniforms = StageUniforms::new(ctx);
        self.dispatch(Kernel::Divergence, ctx, uniforms, velocity, velocity, out);
    }

    fn subtract_gradient(
        &mut self,
        ctx: &StageContext,
        velocity: &GpuTexture,
        pressure: &GpuTexture,
        out: &mut GpuTexture,
    ) {
        let uniforms = StageUniforms::new(ctx);
        self.dispatch(Kernel::SubtractGradient, ctx, uniforms, velocity, pressure, out);
    }

    fn draw(
        &mut self,
        ctx: &StageContext,
        density: &GpuTexture,
        velocity: &GpuTexture,
        out: &mut GpuTexture,
        palette: &Palette,
    ) {
        let uniforms = StageUniforms {
            ink: palette.ink.extend(1.0).to_array(),
            flow: palette.flow.extend(palette.flow_scale).to_array(),
            ..StageUniforms::new(ctx)
        };
        self.dispatch(Kernel::Draw, ctx, uniforms, density, velocity, out);
    }

    fn upload(&mut self, dst: &mut GpuTexture, src: &HostTexture) -> Result<()> {
        if dst.size != src.size() || dst.format != src.format() {
            return Err(FluidError::Readback(format!(
                "cannot upload {:?} {}x{} into {:?} {}x{}",
                src.format(),
                src.size().width,
                src.size().height,
                dst.format,
                dst.size.width,
                dst.size.height
            )));
        }
        let data = src.packed();
        self.queue.write_texture(
            copy_target(&dst.texture),
            bytemuck::cast_slice(&data),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(dst.size.width * dst.format.bytes_per_texel()),
                rows_per_image: Some(dst.size.height),
            },
            extent(dst.size),
        );
        Ok(())
    }

    fn download(&mut self, src: &GpuTexture) -> Result<HostTexture> {
        let unpadded = src.size.width * src.format.bytes_per_texel();
        let alignment = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = unpadded.div_ceil(alignment) * alignment;

        let read_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Field Read Buffer"),
            size: u64::from(padded) * u64::from(src.size.height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Read Field Encoder"),
            });
        encoder.copy_texture_to_buffer(
            copy_target(&src.texture),
            wgpu::ImageCopyBuffer {
                buffer: &read_buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(src.size.height),
                },
            },
            extent(src.size),
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = read_buffer.slice(..);
        let (sender, mut receiver) = oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        receiver
            .try_recv()
            .map_err(|err| FluidError::Readback(err.to_string()))?
            .map_err(|err| FluidError::Readback(err.to_string()))?;

        let data = {
            let mapped = buffer_slice.get_mapped_range();
            let mut floats = Vec::with_capacity(src.size.cells() * src.format.channels());
            for row in mapped.chunks_exact(padded as usize) {
                let texels: &[f32] = bytemuck::cast_slice(&row[..unpadded as usize]);
                floats.extend_from_slice(texels);
            }
            floats
        };
        read_buffer.unmap();

        HostTexture::from_packed(src.size, src.format, &data)
    }
}
