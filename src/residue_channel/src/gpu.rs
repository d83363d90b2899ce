use std::borrow::Cow;
use std::sync::mpsc;
use std::time::Instant;

use crate::backend::{ComputeBackend, DispatchGeometry, KernelRole};
use crate::{
    ChannelOptions, ResidueError, ResidueResult, Word, bytes_len, elapsed_ms, validate_options,
};

const LISTENER_SHADER: &str = include_str!("shaders/listener.wgsl");
const WRITER_SHADER: &str = include_str!("shaders/writer.wgsl");
const PARAMS_WORDS: usize = 4;

#[derive(Debug, Clone)]
pub struct AdapterSummary {
    pub index: usize,
    pub name: String,
    pub backend: String,
    pub device_type: String,
    pub max_workgroup_storage_bytes: u32,
    pub max_invocations_per_workgroup: u32,
}

/// Every adapter wgpu can see, in the order `ChannelOptions::adapter_index`
/// refers to them.
pub fn list_adapters() -> Vec<AdapterSummary> {
    let instance = wgpu::Instance::default();
    instance
        .enumerate_adapters(wgpu::Backends::all())
        .into_iter()
        .enumerate()
        .map(|(index, adapter)| {
            let info = adapter.get_info();
            let limits = adapter.limits();
            AdapterSummary {
                index,
                name: info.name,
                backend: format!("{:?}", info.backend),
                device_type: format!("{:?}", info.device_type),
                max_workgroup_storage_bytes: limits.max_compute_workgroup_storage_size,
                max_invocations_per_workgroup: limits.max_compute_invocations_per_workgroup,
            }
        })
        .collect()
}

#[derive(Debug)]
pub struct GpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
    profile_timing: bool,
}

#[derive(Debug)]
pub struct Kernel {
    role: KernelRole,
    geometry: DispatchGeometry,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

impl Kernel {
    pub fn role(&self) -> KernelRole {
        self.role
    }

    pub fn geometry(&self) -> DispatchGeometry {
        self.geometry
    }
}

#[derive(Debug)]
pub struct DeviceBuffer {
    buffer: wgpu::Buffer,
    words: usize,
}

impl DeviceBuffer {
    pub fn words(&self) -> usize {
        self.words
    }

    fn size(&self) -> u64 {
        self.buffer.size()
    }
}

impl GpuDevice {
    pub fn create(options: &ChannelOptions) -> ResidueResult<Self> {
        pollster::block_on(Self::create_async(options))
    }

    async fn create_async(options: &ChannelOptions) -> ResidueResult<Self> {
        let instance = wgpu::Instance::default();
        let adapter = match options.adapter_index {
            Some(index) => instance
                .enumerate_adapters(wgpu::Backends::all())
                .into_iter()
                .nth(index)
                .ok_or_else(|| {
                    ResidueError::BackendInit(format!("adapter index {index} not found"))
                })?,
            None => instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: options.power_preference,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .ok_or_else(|| ResidueError::BackendInit("adapter not found".to_string()))?,
        };

        let info = adapter.get_info();
        log::info!(
            "using adapter \"{}\" vendor=0x{:x} device=0x{:x} backend={:?} type={:?}",
            info.name,
            info.vendor,
            info.device,
            info.backend,
            info.device_type
        );

        // Workgroup storage of 8192 words is above the WebGPU default limit,
        // so ask for everything the adapter offers.
        let limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("residue-device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                },
                None,
            )
            .await
            .map_err(|err| ResidueError::BackendInit(err.to_string()))?;
        device.on_uncaptured_error(Box::new(|error| {
            log::error!("uncaptured wgpu error: {error}");
        }));

        Ok(Self {
            device,
            queue,
            info,
            limits,
            profile_timing: options.profile_timing,
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.info
    }

    pub fn limits(&self) -> &wgpu::Limits {
        &self.limits
    }

    /// Specialises the role's WGSL for `geometry` and builds its pipeline.
    /// Workgroup memory zero-initialisation is turned off; without that the
    /// listener would only ever read zeros.
    pub fn compile_kernel(
        &self,
        role: KernelRole,
        geometry: DispatchGeometry,
    ) -> ResidueResult<Kernel> {
        self.check_geometry(geometry)?;

        let template = match role {
            KernelRole::Writer => WRITER_SHADER,
            KernelRole::Listener => LISTENER_SHADER,
        };
        let source = template
            .replace("{{LOCAL_WORDS}}", &geometry.local_memory_words.to_string())
            .replace("{{THREADS}}", &geometry.threads_per_workgroup.to_string());

        let mut entries = vec![storage_entry(0)];
        if role == KernelRole::Writer {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
            entries.push(storage_entry(2));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(kernel_label(role, "shader").as_str()),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
            });
        let bind_group_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(kernel_label(role, "bgl").as_str()),
                    entries: &entries,
                });
        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(kernel_label(role, "layout").as_str()),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(kernel_label(role, "pipeline").as_str()),
                layout: Some(&layout),
                module: &shader,
                entry_point: "main",
                compilation_options: wgpu::PipelineCompilationOptions {
                    zero_initialize_workgroup_memory: false,
                    ..Default::default()
                },
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ResidueError::BackendInit(format!(
                "{} kernel: {err}",
                role.as_str()
            )));
        }

        Ok(Kernel {
            role,
            geometry,
            bind_group_layout,
            pipeline,
        })
    }

    /// A storage buffer of `words` words. wgpu zero-fills new buffers; only
    /// workgroup memory is left uninitialised.
    pub fn allocate_buffer(&self, words: usize) -> ResidueResult<DeviceBuffer> {
        let size = bytes_len::<Word>(words.max(1))?;
        if size > self.limits.max_buffer_size
            || size > u64::from(self.limits.max_storage_buffer_binding_size)
        {
            return Err(ResidueError::BackendInit(format!(
                "buffer of {size} bytes exceeds device limits"
            )));
        }

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("residue-dump-buffer"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(DeviceBuffer { buffer, words })
    }

    fn check_geometry(&self, geometry: DispatchGeometry) -> ResidueResult<()> {
        let limits = &self.limits;
        if geometry.local_memory_bytes() > u64::from(limits.max_compute_workgroup_storage_size) {
            return Err(ResidueError::BackendInit(format!(
                "{} bytes of workgroup memory requested, device allows {}",
                geometry.local_memory_bytes(),
                limits.max_compute_workgroup_storage_size
            )));
        }
        if geometry.threads_per_workgroup > limits.max_compute_invocations_per_workgroup
            || geometry.threads_per_workgroup > limits.max_compute_workgroup_size_x
        {
            return Err(ResidueError::BackendInit(format!(
                "{} threads per workgroup requested, device allows {}",
                geometry.threads_per_workgroup,
                limits
                    .max_compute_invocations_per_workgroup
                    .min(limits.max_compute_workgroup_size_x)
            )));
        }
        if geometry.workgroup_count > limits.max_compute_workgroups_per_dimension {
            return Err(ResidueError::BackendInit(format!(
                "{} workgroups requested, device allows {}",
                geometry.workgroup_count, limits.max_compute_workgroups_per_dimension
            )));
        }
        Ok(())
    }
}

/// Device, kernel and buffers for one session.
#[derive(Debug)]
pub struct WgpuBackend {
    gpu: GpuDevice,
    kernel: Kernel,
    dump: DeviceBuffer,
    params_buffer: Option<wgpu::Buffer>,
    // Bound at binding 2 of the writer kernel; the host never touches it.
    _aux: Option<DeviceBuffer>,
    readback: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    dispatches: u64,
}

impl WgpuBackend {
    pub fn open(role: KernelRole, options: &ChannelOptions) -> ResidueResult<Self> {
        validate_options(options)?;
        let gpu = GpuDevice::create(options)?;
        Self::with_device(gpu, role, options.geometry())
    }

    pub fn with_device(
        gpu: GpuDevice,
        role: KernelRole,
        geometry: DispatchGeometry,
    ) -> ResidueResult<Self> {
        let kernel = gpu.compile_kernel(role, geometry)?;
        let dump = gpu.allocate_buffer(geometry.buffer_words())?;

        let readback = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("residue-readback"),
            size: dump.size(),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let (params_buffer, aux) = match role {
            KernelRole::Writer => {
                let params = gpu.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("residue-writer-params"),
                    size: bytes_len::<Word>(PARAMS_WORDS)?,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                (Some(params), Some(gpu.allocate_buffer(1)?))
            }
            KernelRole::Listener => (None, None),
        };

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: dump.buffer.as_entire_binding(),
        }];
        if let (Some(params), Some(aux)) = (&params_buffer, &aux) {
            entries.push(wgpu::BindGroupEntry {
                binding: 1,
                resource: params.as_entire_binding(),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: 2,
                resource: aux.buffer.as_entire_binding(),
            });
        }
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel_label(role, "bg").as_str()),
            layout: &kernel.bind_group_layout,
            entries: &entries,
        });

        Ok(Self {
            gpu,
            kernel,
            dump,
            params_buffer,
            _aux: aux,
            readback,
            bind_group,
            dispatches: 0,
        })
    }

    pub fn device(&self) -> &GpuDevice {
        &self.gpu
    }

    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }
}

impl ComputeBackend for WgpuBackend {
    fn role(&self) -> KernelRole {
        self.kernel.role()
    }

    fn geometry(&self) -> DispatchGeometry {
        self.kernel.geometry()
    }

    fn reinitialize(&mut self, buffer: &[Word], message_len: usize) -> ResidueResult<()> {
        let Some(params_buffer) = &self.params_buffer else {
            return Err(ResidueError::InvalidOptions(
                "listener kernel does not take a message",
            ));
        };
        if buffer.len() != self.dump.words() {
            return Err(ResidueError::InvalidOptions(
                "buffer length does not match the session geometry",
            ));
        }
        let message_len = u32::try_from(message_len)
            .map_err(|_| ResidueError::InvalidOptions("message length does not fit in u32"))?;

        let params: [u32; PARAMS_WORDS] =
            [message_len, self.kernel.geometry.local_memory_words, 0, 0];
        self.gpu
            .queue
            .write_buffer(&self.dump.buffer, 0, bytemuck::cast_slice(buffer));
        self.gpu
            .queue
            .write_buffer(params_buffer, 0, bytemuck::cast_slice(&params));
        Ok(())
    }

    fn dispatch(&mut self) -> ResidueResult<()> {
        let start = self.gpu.profile_timing.then(Instant::now);
        let device = &self.gpu.device;

        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(kernel_label(self.kernel.role, "dispatch").as_str()),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel_label(self.kernel.role, "pass").as_str()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.kernel.pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.dispatch_workgroups(self.kernel.geometry.workgroup_count, 1, 1);
        }
        encoder.copy_buffer_to_buffer(&self.dump.buffer, 0, &self.readback, 0, self.dump.size());
        self.gpu.queue.submit(Some(encoder.finish()));
        device.poll(wgpu::Maintain::Wait);

        let validation = pollster::block_on(device.pop_error_scope());
        let out_of_memory = pollster::block_on(device.pop_error_scope());
        if let Some(err) = validation.or(out_of_memory) {
            return Err(ResidueError::Dispatch(err.to_string()));
        }

        self.dispatches += 1;
        if let Some(start) = start {
            log::debug!(
                "[timing] dispatch={} role={} workgroups={} t_submit_wait_ms={:.3}",
                self.dispatches,
                self.kernel.role.as_str(),
                self.kernel.geometry.workgroup_count,
                elapsed_ms(start)
            );
        }
        Ok(())
    }

    fn read_buffer(&mut self) -> ResidueResult<Vec<Word>> {
        let slice = self.readback.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.gpu.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(ResidueError::Dispatch(err.to_string())),
            Err(err) => return Err(ResidueError::Dispatch(err.to_string())),
        }

        let words = {
            let mapped = slice.get_mapped_range();
            let words: &[Word] = bytemuck::cast_slice(&mapped);
            words[..self.dump.words()].to_vec()
        };
        self.readback.unmap();
        Ok(words)
    }
}

fn storage_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn kernel_label(role: KernelRole, part: &str) -> String {
    format!("residue-{}-{part}", role.as_str())
}
