//! wgpu implementation of the reconstruction stages.
//!
//! Three compute pipelines built from one WGSL module share a single queue.
//! A revolution is one submission: post-process, contrast window, warp, then
//! copies of the results into a staging buffer that `read_back` maps
//! synchronously. Validation errors raised while recording or submitting are
//! caught with error scopes and reported as [`OctError::Dispatch`].

use std::borrow::Cow;

use super::params::{GpuParams, ReconstructionParams};
use super::{check_argument, ComputeBackend, SpectralBatch, SpectralMode};
use crate::data::{FrameShape, ReconstructedFrame};
use crate::error::{AppResult, OctError};

const WORKGROUP_SIZE: u32 = 64;
const MAX_GROUPS_PER_DIM: u32 = 65_535;

/// Workgroup grid for `pixels` byte pixels packed four per word.
fn workgroups(pixels: usize) -> (u32, u32) {
    let words = pixels.div_ceil(4) as u32;
    let groups = words.div_ceil(WORKGROUP_SIZE).max(1);
    let x = groups.min(MAX_GROUPS_PER_DIM);
    (x, groups.div_ceil(x))
}

fn packed_size(pixels: usize) -> u64 {
    (pixels.div_ceil(4).max(1) * 4) as u64
}

fn float_size(values: usize) -> u64 {
    (values.max(1) * std::mem::size_of::<f32>()) as u64
}

/// Per-shape GPU buffers and the bind group over them.
struct FrameBuffers {
    shape: FrameShape,
    params: wgpu::Buffer,
    real: wgpu::Buffer,
    imag: wgpu::Buffer,
    prev_prescale: wgpu::Buffer,
    prescale: wgpu::Buffer,
    polar: wgpu::Buffer,
    windowed: wgpu::Buffer,
    display: wgpu::Buffer,
    video: wgpu::Buffer,
    staging: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

impl FrameBuffers {
    fn new(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        shape: FrameShape,
    ) -> AppResult<Self> {
        let polar_floats = float_size(shape.polar_len());
        let polar_packed = packed_size(shape.polar_len());
        let sector_packed = packed_size(shape.sector_len());

        let storage = |label: &str, size: u64, extra: wgpu::BufferUsages| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE | extra,
                mapped_at_creation: false,
            })
        };

        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("params"),
            size: std::mem::size_of::<GpuParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let real = storage("real", polar_floats, wgpu::BufferUsages::COPY_DST);
        let imag = storage("imag", polar_floats, wgpu::BufferUsages::COPY_DST);
        let prev_prescale = storage("prev_prescale", polar_floats, wgpu::BufferUsages::COPY_DST);
        let prescale = storage("prescale", polar_floats, wgpu::BufferUsages::COPY_SRC);
        let polar = storage("polar", polar_packed, wgpu::BufferUsages::COPY_SRC);
        let windowed = storage("windowed", polar_packed, wgpu::BufferUsages::empty());
        let display = storage("display", sector_packed, wgpu::BufferUsages::COPY_SRC);
        let video = storage("video", sector_packed, wgpu::BufferUsages::COPY_SRC);
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size: polar_packed + polar_floats + 2 * sector_packed,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(OctError::BufferAllocation(format!(
                "frame buffers for {shape:?}: {err}"
            )));
        }

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("reconstruction_bind_group"),
            layout,
            entries: &[
                (0, &params),
                (1, &real),
                (2, &imag),
                (3, &prev_prescale),
                (4, &prescale),
                (5, &polar),
                (6, &windowed),
                (7, &display),
                (8, &video),
            ]
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            }),
        });

        Ok(Self {
            shape,
            params,
            real,
            imag,
            prev_prescale,
            prescale,
            polar,
            windowed,
            display,
            video,
            staging,
            bind_group,
        })
    }

    fn polar_packed(&self) -> u64 {
        packed_size(self.shape.polar_len())
    }

    fn polar_floats(&self) -> u64 {
        float_size(self.shape.polar_len())
    }

    fn sector_packed(&self) -> u64 {
        packed_size(self.shape.sector_len())
    }
}

/// wgpu compute backend running the three reconstruction stages.
pub struct GpuBackend {
    name: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    layout: wgpu::BindGroupLayout,
    post_process: wgpu::ComputePipeline,
    contrast_window: wgpu::ComputePipeline,
    polar_to_sector: wgpu::ComputePipeline,
    buffers: FrameBuffers,
    upload: Vec<f32>,
    has_history: bool,
    dispatched: bool,
    bind_failures: u64,
}

impl GpuBackend {
    /// Open `adapter`, build the kernels and allocate buffers for `shape`.
    pub fn new(adapter: wgpu::Adapter, shape: FrameShape) -> AppResult<Self> {
        let name = adapter.get_info().name;
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("rust-oct"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| OctError::Configuration(format!("compute device request failed: {e}")))?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("reconstruction"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!(
                "shaders/reconstruction.wgsl"
            ))),
        });

        let buffer_entry = |binding: u32, ty: wgpu::BufferBindingType| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let read_only = wgpu::BufferBindingType::Storage { read_only: true };
        let read_write = wgpu::BufferBindingType::Storage { read_only: false };
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("reconstruction_layout"),
            entries: &[
                buffer_entry(0, wgpu::BufferBindingType::Uniform),
                buffer_entry(1, read_only),
                buffer_entry(2, read_only),
                buffer_entry(3, read_only),
                buffer_entry(4, read_write),
                buffer_entry(5, read_write),
                buffer_entry(6, read_write),
                buffer_entry(7, read_write),
                buffer_entry(8, read_write),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("reconstruction_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = |entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let post_process = pipeline("post_process");
        let contrast_window = pipeline("contrast_window");
        let polar_to_sector = pipeline("polar_to_sector");
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(OctError::KernelBuild(err.to_string()));
        }

        let buffers = FrameBuffers::new(&device, &layout, shape)?;
        tracing::debug!(adapter = %name, ?shape, "GPU reconstruction kernels ready");

        Ok(Self {
            name,
            device,
            queue,
            layout,
            post_process,
            contrast_window,
            polar_to_sector,
            buffers,
            upload: Vec::new(),
            has_history: false,
            dispatched: false,
            bind_failures: 0,
        })
    }

    /// Write `data` into `buffer`, padding or truncating to `expected` values.
    fn upload_plane(
        queue: &wgpu::Queue,
        buffer: &wgpu::Buffer,
        data: &[f32],
        expected: usize,
        scratch: &mut Vec<f32>,
    ) {
        if data.len() == expected {
            queue.write_buffer(buffer, 0, bytemuck::cast_slice(data));
            return;
        }
        scratch.clear();
        scratch.extend(data.iter().take(expected));
        scratch.resize(expected, 0.0);
        queue.write_buffer(buffer, 0, bytemuck::cast_slice(scratch));
    }

    fn encode_stage(
        encoder: &mut wgpu::CommandEncoder,
        pipeline: &wgpu::ComputePipeline,
        bind_group: &wgpu::BindGroup,
        pixels: usize,
    ) {
        let (x, y) = workgroups(pixels);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
    }
}

impl ComputeBackend for GpuBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(
        &mut self,
        batch: &SpectralBatch,
        params: &ReconstructionParams,
    ) -> AppResult<()> {
        let shape = params.shape();
        if shape != self.buffers.shape {
            self.buffers = FrameBuffers::new(&self.device, &self.layout, shape)?;
            self.has_history = false;
        }
        let expected = shape.polar_len();

        if !check_argument("post_process", 1, "real", batch.real.len(), expected) {
            self.bind_failures += 1;
        }
        Self::upload_plane(
            &self.queue,
            &self.buffers.real,
            &batch.real,
            expected,
            &mut self.upload,
        );
        if params.mode == SpectralMode::Complex {
            if !check_argument("post_process", 2, "imag", batch.imag.len(), expected) {
                self.bind_failures += 1;
            }
            Self::upload_plane(
                &self.queue,
                &self.buffers.imag,
                &batch.imag,
                expected,
                &mut self.upload,
            );
        }
        self.queue.write_buffer(
            &self.buffers.params,
            0,
            bytemuck::bytes_of(&params.to_gpu(self.has_history)),
        );

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("reconstruction"),
            });
        let b = &self.buffers;
        Self::encode_stage(&mut encoder, &self.post_process, &b.bind_group, expected);
        Self::encode_stage(&mut encoder, &self.contrast_window, &b.bind_group, expected);
        Self::encode_stage(
            &mut encoder,
            &self.polar_to_sector,
            &b.bind_group,
            shape.sector_len(),
        );

        encoder.copy_buffer_to_buffer(&b.prescale, 0, &b.prev_prescale, 0, b.polar_floats());
        let mut offset = 0;
        for (source, size) in [
            (&b.polar, b.polar_packed()),
            (&b.prescale, b.polar_floats()),
            (&b.display, b.sector_packed()),
            (&b.video, b.sector_packed()),
        ] {
            encoder.copy_buffer_to_buffer(source, 0, &b.staging, offset, size);
            offset += size;
        }
        self.queue.submit(Some(encoder.finish()));

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            self.dispatched = false;
            return Err(OctError::Dispatch(err.to_string()));
        }
        self.has_history = true;
        self.dispatched = true;
        Ok(())
    }

    fn read_back(&mut self, frame: &mut ReconstructedFrame) -> AppResult<()> {
        if !self.dispatched {
            return Err(OctError::Readback("nothing dispatched".into()));
        }
        let b = &self.buffers;
        if frame.shape() != b.shape {
            return Err(OctError::Readback(format!(
                "frame shape {:?} does not match backend shape {:?}",
                frame.shape(),
                b.shape
            )));
        }

        let slice = b.staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| OctError::Readback(format!("map channel closed: {e}")))?
            .map_err(|e| OctError::Readback(format!("staging map failed: {e}")))?;

        {
            let data = slice.get_mapped_range();
            let polar_at = 0;
            let prescale_at = polar_at + b.polar_packed() as usize;
            let display_at = prescale_at + b.polar_floats() as usize;
            let video_at = display_at + b.sector_packed() as usize;

            let polar_len = b.shape.polar_len();
            let sector_len = b.shape.sector_len();
            frame
                .raw_data
                .copy_from_slice(&data[polar_at..polar_at + polar_len]);
            for (dst, src) in frame
                .spectral_data
                .iter_mut()
                .zip(data[prescale_at..display_at].chunks_exact(4))
            {
                *dst = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
            }
            frame
                .display_bytes
                .copy_from_slice(&data[display_at..display_at + sector_len]);
            frame
                .video_bytes
                .copy_from_slice(&data[video_at..video_at + sector_len]);
        }
        b.staging.unmap();
        self.dispatched = false;
        Ok(())
    }

    fn reset_history(&mut self) {
        self.has_history = false;
    }

    fn bind_failures(&self) -> u64 {
        self.bind_failures
    }
}
