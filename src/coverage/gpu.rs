//! wgpu compute strategy for terrain-free coverage.

use std::sync::{mpsc, OnceLock};

use bytemuck::{Pod, Zeroable};
use futures_lite::future;
use log::{debug, info, warn};
use wgpu::util::DeviceExt;

use crate::cancel::Ticket;
use crate::coverage::{CoverageRaster, RasterBuffers, RenderJob, Strategy};
use crate::error::{AnalysisError, AnalysisResult};
use crate::geo::METERS_PER_DEG_LAT;

const WORKGROUP_SIZE: u32 = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Params {
    lat_step: f32,
    lon_step: f32,
    lat_scale: f32,
    render_range: f32,
    fspl_1m_db: f32,
    max_path_loss_db: f32,
    path_loss_exp: f32,
    clutter_loss_db: f32,
    fade_by_margin: u32,
    origin_count: u32,
    rows: u32,
    cols: u32,
    required_overlap: u32,
    _pad: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct GpuOrigin {
    row_offset_deg: f32,
    col_offset_deg: f32,
    lon_scale: f32,
    _pad: f32,
}

/// Uniforms and origins as the shader sees them. Origin positions are offsets
/// from the grid corner so f32 keeps sub-cell precision.
fn pack(job: &RenderJob) -> (Params, Vec<GpuOrigin>) {
    let grid = &job.grid;
    let params = Params {
        lat_step: grid.lat_step as f32,
        lon_step: grid.lon_step as f32,
        lat_scale: METERS_PER_DEG_LAT as f32,
        render_range: job.render_range_m as f32,
        fspl_1m_db: job.fspl_1m_db as f32,
        max_path_loss_db: job.max_path_loss_db as f32,
        path_loss_exp: job.path_loss_exponent as f32,
        clutter_loss_db: job.clutter_loss_db as f32,
        fade_by_margin: job.fade_by_margin as u32,
        origin_count: job.origins.len() as u32,
        rows: grid.rows as u32,
        cols: grid.cols as u32,
        required_overlap: job.required_overlap as u32,
        _pad: [0; 3],
    };
    let origins = job
        .origins
        .iter()
        .map(|o| GpuOrigin {
            row_offset_deg: (grid.bounds.lat_max - o.position.lat) as f32,
            col_offset_deg: (o.position.lon - grid.bounds.lon_min) as f32,
            lon_scale: o.lon_scale as f32,
            _pad: 0.0,
        })
        .collect();
    (params, origins)
}

fn unavailable(reason: impl std::fmt::Display) -> AnalysisError {
    AnalysisError::ComputeBackendUnavailable(reason.to_string())
}

pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
}

impl GpuContext {
    pub fn new() -> AnalysisResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = future::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| unavailable("no compute adapter"))?;

        let (device, queue) = future::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("coverage-device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(unavailable)?;

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("coverage-shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("coverage.wgsl").into()),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("coverage-pipeline"),
            layout: None,
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        info!("GPU coverage backend: {}", adapter.get_info().name);
        Ok(Self { device, queue, pipeline })
    }

    fn check_limits(&self, job: &RenderJob) -> AnalysisResult<()> {
        let limits = self.device.limits();
        let groups_x = (job.grid.cols as u32).div_ceil(WORKGROUP_SIZE);
        let groups_y = (job.grid.rows as u32).div_ceil(WORKGROUP_SIZE);
        if groups_x > limits.max_compute_workgroups_per_dimension
            || groups_y > limits.max_compute_workgroups_per_dimension
        {
            return Err(unavailable("grid exceeds workgroup limits"));
        }
        let bytes = (job.grid.cell_count() * 4) as u64;
        if bytes > limits.max_storage_buffer_binding_size as u64 {
            return Err(unavailable("grid exceeds storage buffer limits"));
        }
        Ok(())
    }

    /// One dispatch over the whole grid; blocks until it completes.
    pub fn render(&self, job: &RenderJob, ticket: &Ticket) -> AnalysisResult<CoverageRaster> {
        self.check_limits(job)?;
        let grid = &job.grid;
        let cells = grid.cell_count();

        let (params, origins) = pack(job);

        let device = &self.device;
        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("coverage-params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let origins_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("coverage-origins"),
            contents: bytemuck::cast_slice(&origins),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let size = (cells * 4) as wgpu::BufferAddress;
        let storage = |label| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };
        let readback = |label| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        let pixel_buffer = storage("coverage-pixels");
        let count_buffer = storage("coverage-counts");
        let pixel_read = readback("coverage-pixels-read");
        let count_read = readback("coverage-counts-read");

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("coverage-bind-group"),
            layout: &self.pipeline.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: params_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: origins_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: pixel_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: count_buffer.as_entire_binding() },
            ],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("coverage-encoder") });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("coverage-pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                (grid.cols as u32).div_ceil(WORKGROUP_SIZE),
                (grid.rows as u32).div_ceil(WORKGROUP_SIZE),
                1,
            );
        }
        encoder.copy_buffer_to_buffer(&pixel_buffer, 0, &pixel_read, 0, size);
        encoder.copy_buffer_to_buffer(&count_buffer, 0, &count_read, 0, size);
        self.queue.submit(Some(encoder.finish()));
        device.poll(wgpu::Maintain::Wait);
        ticket.ensure_current()?;

        let pixels = self.read_words(&pixel_read)?;
        let counts = self.read_words(&count_read)?;
        ticket.ensure_current()?;

        let buffers = RasterBuffers {
            pixel_rgba: pixels.iter().flat_map(|w| w.to_le_bytes()).collect(),
            coverage_count: counts.iter().map(|&c| c.min(255) as u8).collect(),
        };
        Ok(job.finish(buffers, ticket.token(), Strategy::Gpu))
    }

    fn read_words(&self, buffer: &wgpu::Buffer) -> AnalysisResult<Vec<u32>> {
        let slice = buffer.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(unavailable)?
            .map_err(unavailable)?;

        let words = {
            let data = slice.get_mapped_range();
            data.chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        };
        buffer.unmap();
        Ok(words)
    }
}

/// Lazily created GPU context. A failed initialisation is remembered so later
/// renders go straight to the CPU strategy.
#[derive(Default)]
pub struct GpuSlot {
    context: OnceLock<Option<GpuContext>>,
}

impl GpuSlot {
    pub fn context(&self) -> Option<&GpuContext> {
        self.context
            .get_or_init(|| match GpuContext::new() {
                Ok(ctx) => Some(ctx),
                Err(e) => {
                    warn!("{e}");
                    None
                }
            })
            .as_ref()
    }

    pub fn render(&self, job: &RenderJob, ticket: &Ticket) -> AnalysisResult<CoverageRaster> {
        let ctx = self.context().ok_or_else(|| unavailable("no usable GPU device"))?;
        debug!("GPU dispatch {}x{} for token {}", job.grid.cols, job.grid.rows, ticket.token());
        ctx.render(job, ticket)
    }
}
