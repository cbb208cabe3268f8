use std::collections::{BTreeSet, HashMap, VecDeque};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::renderer::bindings::{Binding, DescriptorSet, SamplerKind};
use crate::renderer::commands::{AttachmentOp, ClearValue, Command, CommandStream, DrawKind, Framebuffer};
use crate::renderer::device::{
    BindlessId, BufferId, DeviceFeatures, DeviceInfo, Extent2d, Fence, GpuDevice, ImageDesc,
    ImageId, ImageUsage, Pixmap, SubmissionIndex,
};
use crate::renderer::error::{RenderError, RenderResult};
use crate::renderer::format::{FormatSupport, TextureFormat};
use crate::renderer::shaders::{Pipeline, PipelineId};
use crate::renderer::FRAMES_IN_FLIGHT;

/// Texture at binding `i` is paired with its sampler at `i + SAMPLER_BINDING_OFFSET`.
pub const SAMPLER_BINDING_OFFSET: u32 = 16;

/// Workgroup edge assumed by `DispatchThreads`.
pub const WORKGROUP_SIZE: u32 = 8;

const PUSH_CONSTANT_SIZE: u32 = 128;

fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::R8 => wgpu::TextureFormat::R8Unorm,
        TextureFormat::R16 => wgpu::TextureFormat::R16Float,
        TextureFormat::R32F => wgpu::TextureFormat::R32Float,
        TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Bgra8 => wgpu::TextureFormat::Bgra8Unorm,
        TextureFormat::Rgba16 => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rgba32F => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::R11G11B10UF => wgpu::TextureFormat::Rg11b10Ufloat,
        TextureFormat::Depth16 => wgpu::TextureFormat::Depth16Unorm,
        TextureFormat::Depth24x8 => wgpu::TextureFormat::Depth24Plus,
        TextureFormat::Depth32F => wgpu::TextureFormat::Depth32Float,
    }
}

fn texture_usages(usage: ImageUsage) -> wgpu::TextureUsages {
    let mut usages = wgpu::TextureUsages::empty();
    if usage.contains(ImageUsage::ATTACHMENT) {
        usages |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    if usage.contains(ImageUsage::SAMPLED) {
        usages |= wgpu::TextureUsages::TEXTURE_BINDING;
    }
    if usage.contains(ImageUsage::STORAGE) {
        usages |= wgpu::TextureUsages::STORAGE_BINDING;
    }
    if usage.contains(ImageUsage::COPY_SRC) {
        usages |= wgpu::TextureUsages::COPY_SRC;
    }
    usages
}

fn format_support(allowed: wgpu::TextureUsages) -> FormatSupport {
    let mut support = FormatSupport::empty();
    if allowed.contains(wgpu::TextureUsages::RENDER_ATTACHMENT) {
        support |= FormatSupport::ATTACHMENT;
    }
    if allowed.contains(wgpu::TextureUsages::TEXTURE_BINDING) {
        support |= FormatSupport::SAMPLED;
    }
    if allowed.contains(wgpu::TextureUsages::STORAGE_BINDING) {
        support |= FormatSupport::STORAGE;
    }
    support
}

fn required_support(usage: ImageUsage) -> FormatSupport {
    let mut support = FormatSupport::empty();
    support.set(FormatSupport::ATTACHMENT, usage.contains(ImageUsage::ATTACHMENT));
    support.set(FormatSupport::SAMPLED, usage.contains(ImageUsage::SAMPLED));
    support.set(FormatSupport::STORAGE, usage.contains(ImageUsage::STORAGE));
    support
}

fn color_load(op: AttachmentOp, reopen: bool) -> wgpu::LoadOp<wgpu::Color> {
    match op {
        _ if reopen => wgpu::LoadOp::Load,
        AttachmentOp::Clear(ClearValue::Color([r, g, b, a])) => wgpu::LoadOp::Clear(wgpu::Color {
            r: f64::from(r),
            g: f64::from(g),
            b: f64::from(b),
            a: f64::from(a),
        }),
        AttachmentOp::Clear(ClearValue::Depth(_)) | AttachmentOp::Discard => {
            wgpu::LoadOp::Clear(wgpu::Color::default())
        }
        AttachmentOp::Preserve | AttachmentOp::Readonly => wgpu::LoadOp::Load,
    }
}

fn depth_ops(op: AttachmentOp, reopen: bool) -> Option<wgpu::Operations<f32>> {
    let load = match op {
        AttachmentOp::Readonly => return None,
        _ if reopen => wgpu::LoadOp::Load,
        AttachmentOp::Clear(ClearValue::Depth(depth)) => wgpu::LoadOp::Clear(depth),
        AttachmentOp::Clear(ClearValue::Color(_)) | AttachmentOp::Discard => {
            wgpu::LoadOp::Clear(0.0)
        }
        AttachmentOp::Preserve => wgpu::LoadOp::Load,
    };
    Some(wgpu::Operations {
        load,
        store: wgpu::StoreOp::Store,
    })
}

struct GpuImage {
    /// `None` for views imported from a surface.
    texture: Option<wgpu::Texture>,
    view: wgpu::TextureView,
    /// One single-level view per mip when the image has a chain.
    mip_views: Vec<wgpu::TextureView>,
    desc: ImageDesc,
}

enum GpuPipeline {
    Render(wgpu::RenderPipeline),
    Compute(wgpu::ComputePipeline),
}

impl GpuPipeline {
    fn bind_group_layout(&self) -> wgpu::BindGroupLayout {
        match self {
            GpuPipeline::Render(pipeline) => pipeline.get_bind_group_layout(0),
            GpuPipeline::Compute(pipeline) => pipeline.get_bind_group_layout(0),
        }
    }
}

struct InFlight {
    index: SubmissionIndex,
    submission: wgpu::SubmissionIndex,
    images: BTreeSet<ImageId>,
}

/// What a draw or dispatch binds before it runs.
struct Bound {
    pipeline: PipelineId,
    group: Option<wgpu::BindGroup>,
    push: Vec<u8>,
}

/// [`GpuDevice`] on top of wgpu.
///
/// Pipelines are compiled by the application against [`WgpuDevice::device`]
/// and registered here to obtain a [`Pipeline`] handle. Descriptor sets map
/// onto bind group 0 of the bound pipeline.
pub struct WgpuDevice {
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: DeviceInfo,
    next_id: u32,
    // Image ids are never reused, so any id below this that is not live was destroyed.
    next_image: u32,
    images: HashMap<ImageId, GpuImage>,
    buffers: HashMap<BufferId, wgpu::Buffer>,
    texture_arrays: HashMap<BindlessId, Vec<wgpu::TextureView>>,
    buffer_arrays: HashMap<BindlessId, Vec<wgpu::Buffer>>,
    pipelines: HashMap<PipelineId, GpuPipeline>,
    samplers: HashMap<SamplerKind, wgpu::Sampler>,
    bind_groups: HashMap<(u64, usize, PipelineId), wgpu::BindGroup>,
    in_flight: VecDeque<InFlight>,
    // Highest submission the queue reported finished.
    completed: Arc<AtomicU64>,
    next_submission: u64,
    warned_mesh_threads: bool,
}

impl WgpuDevice {
    /// Opens the high-performance adapter without a surface.
    pub fn new() -> RenderResult<Self> {
        pollster::block_on(Self::new_async())
    }

    pub async fn new_async() -> RenderResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(RenderError::device)?;

        let adapter_info = adapter.get_info();
        log::info!("Using adapter: {:?}", adapter_info);
        log::info!("Using backend: {:?}", adapter_info.backend);
        let adapter_features = adapter.features();

        if !adapter_features.contains(wgpu::Features::PUSH_CONSTANTS) {
            return Err(RenderError::device("adapter does not support push constants"));
        }
        let mut required_features = wgpu::Features::PUSH_CONSTANTS;
        let mut features = DeviceFeatures::empty();

        if adapter_features
            .contains(wgpu::Features::SAMPLED_TEXTURE_AND_STORAGE_BUFFER_ARRAY_NON_UNIFORM_INDEXING)
        {
            required_features |=
                wgpu::Features::SAMPLED_TEXTURE_AND_STORAGE_BUFFER_ARRAY_NON_UNIFORM_INDEXING
                    | wgpu::Features::TEXTURE_BINDING_ARRAY
                    | wgpu::Features::BUFFER_BINDING_ARRAY
                    | wgpu::Features::STORAGE_RESOURCE_BINDING_ARRAY;
            features |= DeviceFeatures::BINDLESS_NON_UNIFORM;
            log::info!("Bindless resources enabled");
        } else {
            log::warn!("Bindless resources not supported");
        }

        // Ray queries sit behind wgpu's experimental opt-in, which is not taken.
        if adapter_features.contains(wgpu::Features::EXPERIMENTAL_RAY_QUERY) {
            log::info!("Adapter supports ray queries; experimental features are disabled");
        }

        if adapter_features.contains(wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES) {
            required_features |= wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES;
        }
        if adapter_features.contains(wgpu::Features::FLOAT32_FILTERABLE) {
            required_features |= wgpu::Features::FLOAT32_FILTERABLE;
        }

        let mut limits = if features.contains(DeviceFeatures::BINDLESS_NON_UNIFORM) {
            wgpu::Limits {
                max_binding_array_elements_per_shader_stage: 256,
                ..wgpu::Limits::default()
            }
        } else {
            wgpu::Limits::default()
        };
        limits.max_push_constant_size = PUSH_CONSTANT_SIZE;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Device"),
                required_features,
                required_limits: limits,
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(RenderError::device)?;

        let samplers = [
            SamplerKind::Nearest,
            SamplerKind::NearestClamp,
            SamplerKind::Bilinear,
            SamplerKind::BilinearMirrored,
        ]
        .into_iter()
        .map(|kind| (kind, create_sampler(&device, kind)))
        .collect();

        Ok(Self {
            adapter,
            device,
            queue,
            info: DeviceInfo {
                name: adapter_info.name,
                features,
            },
            next_id: 1,
            next_image: 1,
            images: HashMap::new(),
            buffers: HashMap::new(),
            texture_arrays: HashMap::new(),
            buffer_arrays: HashMap::new(),
            pipelines: HashMap::new(),
            samplers,
            bind_groups: HashMap::new(),
            in_flight: VecDeque::new(),
            completed: Arc::new(AtomicU64::new(0)),
            next_submission: 1,
            warned_mesh_threads: false,
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn alloc_image(&mut self) -> ImageId {
        let image = ImageId(self.next_image);
        self.next_image += 1;
        image
    }

    pub fn register_render_pipeline(
        &mut self,
        pipeline: wgpu::RenderPipeline,
        writes_depth: bool,
    ) -> Pipeline {
        let id = PipelineId(self.alloc_id());
        self.pipelines.insert(id, GpuPipeline::Render(pipeline));
        if writes_depth {
            Pipeline::depth_writing(id)
        } else {
            Pipeline::graphics(id)
        }
    }

    pub fn register_compute_pipeline(&mut self, pipeline: wgpu::ComputePipeline) -> Pipeline {
        let id = PipelineId(self.alloc_id());
        self.pipelines.insert(id, GpuPipeline::Compute(pipeline));
        Pipeline::compute(id)
    }

    /// Makes a view owned elsewhere (a surface texture) usable as a target.
    /// Forget it with [`GpuDevice::destroy_image`] once presented.
    pub fn import_view(
        &mut self,
        view: wgpu::TextureView,
        format: TextureFormat,
        extent: Extent2d,
    ) -> ImageId {
        let image = self.alloc_image();
        self.images.insert(
            image,
            GpuImage {
                texture: None,
                view,
                mip_views: Vec::new(),
                desc: ImageDesc::attachment("imported", format, extent),
            },
        );
        image
    }

    pub fn register_texture_array(&mut self, views: Vec<wgpu::TextureView>) -> BindlessId {
        let id = BindlessId(self.alloc_id());
        self.texture_arrays.insert(id, views);
        id
    }

    pub fn register_buffer_array(&mut self, buffers: Vec<wgpu::Buffer>) -> BindlessId {
        let id = BindlessId(self.alloc_id());
        self.buffer_arrays.insert(id, buffers);
        id
    }

    fn view(&self, image: ImageId, mip: Option<u32>, storage: bool) -> RenderResult<&wgpu::TextureView> {
        let gpu = self.images.get(&image).ok_or(RenderError::StaleBinding(image))?;
        let view = match (mip, gpu.mip_views.is_empty()) {
            (Some(level), false) => gpu.mip_views.get(level as usize),
            (None, false) if storage => gpu.mip_views.first(),
            _ => Some(&gpu.view),
        };
        view.ok_or_else(|| RenderError::device(format!("{:?} has no mip {:?}", image, mip)))
    }

    fn bind_group(
        &mut self,
        pipeline: PipelineId,
        set: &DescriptorSet,
        frame_slot: usize,
    ) -> RenderResult<wgpu::BindGroup> {
        let key = (set.id(), frame_slot, pipeline);
        if let Some(group) = self.bind_groups.get(&key) {
            return Ok(group.clone());
        }
        let layout = self
            .pipelines
            .get(&pipeline)
            .ok_or_else(|| RenderError::device(format!("pipeline {:?} is not registered", pipeline)))?
            .bind_group_layout();

        let mut texture_arrays = Vec::new();
        let mut buffer_arrays = Vec::new();
        for binding in set.bindings() {
            match binding {
                Binding::TextureArray(id) => {
                    let views = self
                        .texture_arrays
                        .get(id)
                        .ok_or_else(|| RenderError::device(format!("unknown texture array {:?}", id)))?;
                    texture_arrays.push(views.iter().collect::<Vec<_>>());
                }
                Binding::BufferArray(id) => {
                    let buffers = self
                        .buffer_arrays
                        .get(id)
                        .ok_or_else(|| RenderError::device(format!("unknown buffer array {:?}", id)))?;
                    buffer_arrays.push(
                        buffers
                            .iter()
                            .map(|buffer| buffer.as_entire_buffer_binding())
                            .collect::<Vec<_>>(),
                    );
                }
                _ => {}
            }
        }

        let mut entries = Vec::with_capacity(set.slots().len() * 2);
        let (mut next_texture_array, mut next_buffer_array) = (0, 0);
        for (slot, binding) in set.slots().iter().enumerate() {
            let Some(binding) = binding else {
                return Err(RenderError::device(format!(
                    "{} set has an empty slot {}",
                    set.layout().label(),
                    slot
                )));
            };
            let index = slot as u32;
            let resource = match binding {
                Binding::Sampled { image, sampler, mip } => {
                    entries.push(wgpu::BindGroupEntry {
                        binding: index + SAMPLER_BINDING_OFFSET,
                        resource: wgpu::BindingResource::Sampler(&self.samplers[sampler]),
                    });
                    wgpu::BindingResource::TextureView(self.view(*image, *mip, false)?)
                }
                Binding::Storage { image, mip } => {
                    wgpu::BindingResource::TextureView(self.view(*image, *mip, true)?)
                }
                Binding::FrameUniform { buffer, slot_size } => {
                    let buffer = self
                        .buffers
                        .get(buffer)
                        .ok_or_else(|| RenderError::device(format!("unknown buffer {:?}", buffer)))?;
                    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer,
                        offset: frame_slot as u64 * slot_size,
                        size: NonZeroU64::new(*slot_size),
                    })
                }
                Binding::Sampler(kind) => wgpu::BindingResource::Sampler(&self.samplers[kind]),
                Binding::AccelerationStructure(_) => {
                    return Err(RenderError::device("ray queries are not enabled on this device"));
                }
                Binding::TextureArray(_) => {
                    next_texture_array += 1;
                    wgpu::BindingResource::TextureViewArray(&texture_arrays[next_texture_array - 1])
                }
                Binding::BufferArray(_) => {
                    next_buffer_array += 1;
                    wgpu::BindingResource::BufferArray(&buffer_arrays[next_buffer_array - 1])
                }
                Binding::Buffer(buffer) => self
                    .buffers
                    .get(buffer)
                    .ok_or_else(|| RenderError::device(format!("unknown buffer {:?}", buffer)))?
                    .as_entire_binding(),
            };
            entries.push(wgpu::BindGroupEntry {
                binding: index,
                resource,
            });
        }

        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(set.layout().label()),
            layout: &layout,
            entries: &entries,
        });
        drop(entries);
        self.bind_groups.insert(key, group.clone());
        Ok(group)
    }

    fn begin_render_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        framebuffer: &Framebuffer,
        label: &str,
        reopen: bool,
    ) -> RenderResult<wgpu::RenderPass<'static>> {
        let mut color_attachments = Vec::with_capacity(framebuffer.colors.len());
        for color in &framebuffer.colors {
            color_attachments.push(Some(wgpu::RenderPassColorAttachment {
                view: self.view(color.image, None, false)?,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: color_load(color.op, reopen),
                    store: wgpu::StoreOp::Store,
                },
            }));
        }
        let depth_stencil_attachment = match &framebuffer.depth {
            Some(depth) => Some(wgpu::RenderPassDepthStencilAttachment {
                view: self.view(depth.image, None, false)?,
                depth_ops: depth_ops(depth.op, reopen),
                stencil_ops: None,
            }),
            None => None,
        };

        let pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(label),
            color_attachments: &color_attachments,
            depth_stencil_attachment,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        Ok(pass.forget_lifetime())
    }

    fn encode(&mut self, stream: &CommandStream) -> RenderResult<wgpu::CommandBuffer> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("frame") });

        let slot = stream.frame_slot();
        let mut framebuffer = Framebuffer::none();
        let mut render: Option<wgpu::RenderPass<'static>> = None;
        let mut compute: Option<wgpu::ComputePass<'static>> = None;
        // A dispatch split the framebuffer's pass; continue it with loads.
        let mut interrupted = false;
        let mut label = String::new();
        let mut bound: Option<Bound> = None;

        for command in stream.commands() {
            match command {
                Command::SetFramebuffer(next) => {
                    render = None;
                    compute = None;
                    interrupted = false;
                    framebuffer = next.clone();
                    if !framebuffer.is_empty() {
                        render = Some(self.begin_render_pass(&mut encoder, &framebuffer, &label, false)?);
                    }
                }
                Command::DebugMarker(name) => {
                    label.clone_from(name);
                    if let Some(pass) = render.as_mut() {
                        pass.insert_debug_marker(name);
                    } else if let Some(pass) = compute.as_mut() {
                        pass.insert_debug_marker(name);
                    } else {
                        encoder.insert_debug_marker(name);
                    }
                }
                Command::SetUniforms {
                    pipeline,
                    descriptors,
                    push,
                } => {
                    bound = if pipeline.is_null() {
                        None
                    } else {
                        let group = match descriptors {
                            Some(set) => Some(self.bind_group(pipeline.id, set, slot)?),
                            None => None,
                        };
                        Some(Bound {
                            pipeline: pipeline.id,
                            group,
                            push: push.clone(),
                        })
                    };
                }
                Command::Draw(kind) => {
                    let Some(bound) = bound.as_ref() else {
                        continue;
                    };
                    compute = None;
                    if render.is_none() {
                        if framebuffer.is_empty() {
                            log::warn!("{}: draw without a framebuffer skipped", label);
                            continue;
                        }
                        render = Some(self.begin_render_pass(
                            &mut encoder,
                            &framebuffer,
                            &label,
                            interrupted,
                        )?);
                    }
                    let Some(pass) = render.as_mut() else {
                        continue;
                    };
                    let Some(GpuPipeline::Render(pipeline)) = self.pipelines.get(&bound.pipeline) else {
                        return Err(RenderError::device(format!(
                            "{}: {:?} is not a render pipeline",
                            label, bound.pipeline
                        )));
                    };
                    pass.set_pipeline(pipeline);
                    if let Some(group) = &bound.group {
                        pass.set_bind_group(0, group, &[]);
                    }
                    if !bound.push.is_empty() {
                        pass.set_push_constants(wgpu::ShaderStages::VERTEX_FRAGMENT, 0, &bound.push);
                    }
                    match kind {
                        DrawKind::Fullscreen => pass.draw(0..3, 0..1),
                        DrawKind::Vertices {
                            vertex_count,
                            instance_count,
                        } => pass.draw(0..*vertex_count, 0..*instance_count),
                        DrawKind::MeshThreads { .. } => {
                            if !self.warned_mesh_threads {
                                log::warn!("Mesh shading is not available; mesh draws are skipped");
                                self.warned_mesh_threads = true;
                            }
                        }
                    }
                }
                Command::Dispatch { x, y, z } | Command::DispatchThreads { x, y, z } => {
                    let Some(bound) = bound.as_ref() else {
                        continue;
                    };
                    if render.take().is_some() {
                        interrupted = true;
                    }
                    let pass = compute.get_or_insert_with(|| {
                        encoder
                            .begin_compute_pass(&wgpu::ComputePassDescriptor {
                                label: Some(&label),
                                timestamp_writes: None,
                            })
                            .forget_lifetime()
                    });
                    let Some(GpuPipeline::Compute(pipeline)) = self.pipelines.get(&bound.pipeline) else {
                        return Err(RenderError::device(format!(
                            "{}: {:?} is not a compute pipeline",
                            label, bound.pipeline
                        )));
                    };
                    pass.set_pipeline(pipeline);
                    if let Some(group) = &bound.group {
                        pass.set_bind_group(0, group, &[]);
                    }
                    if !bound.push.is_empty() {
                        pass.set_push_constants(0, &bound.push);
                    }
                    if matches!(command, Command::DispatchThreads { .. }) {
                        pass.dispatch_workgroups(
                            x.div_ceil(WORKGROUP_SIZE),
                            y.div_ceil(WORKGROUP_SIZE),
                            *z,
                        );
                    } else {
                        pass.dispatch_workgroups(*x, *y, *z);
                    }
                }
            }
        }
        drop(render);
        drop(compute);
        Ok(encoder.finish())
    }

    fn check_images(&self, images: &BTreeSet<ImageId>) -> RenderResult<()> {
        for image in images {
            if !self.images.contains_key(image) {
                if image.0 < self.next_image {
                    return Err(RenderError::StaleBinding(*image));
                }
                return Err(RenderError::UnknownImage(*image));
            }
        }
        Ok(())
    }

    fn poll_wait(
        &self,
        submission: Option<wgpu::SubmissionIndex>,
        timeout: Option<Duration>,
    ) -> RenderResult<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: submission,
                timeout,
            })
            .map(|_| ())
            .map_err(RenderError::device)
    }

    /// Drops records of finished submissions without waiting on the queue.
    fn retire_completed(&mut self) -> RenderResult<()> {
        self.device
            .poll(wgpu::PollType::Poll)
            .map_err(RenderError::device)?;
        let done = self.completed.load(Ordering::Acquire);
        self.in_flight.retain(|record| record.index.0 > done);
        Ok(())
    }

    fn retire_through(&mut self, index: SubmissionIndex, timeout: Option<Duration>) -> RenderResult<()> {
        let Some(record) = self.in_flight.iter().rev().find(|record| record.index <= index) else {
            return Ok(());
        };
        self.poll_wait(Some(record.submission.clone()), timeout)?;
        self.in_flight.retain(|record| record.index > index);
        Ok(())
    }

    fn with_validation<T>(&mut self, f: impl FnOnce(&mut Self) -> RenderResult<T>) -> RenderResult<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let result = f(self);
        let error = pollster::block_on(self.device.pop_error_scope());
        match (result, error) {
            (Err(err), _) => Err(err),
            (Ok(_), Some(err)) => Err(RenderError::device(err)),
            (Ok(value), None) => Ok(value),
        }
    }
}

fn create_sampler(device: &wgpu::Device, kind: SamplerKind) -> wgpu::Sampler {
    let (filter, address) = match kind {
        SamplerKind::Nearest => (wgpu::FilterMode::Nearest, wgpu::AddressMode::Repeat),
        SamplerKind::NearestClamp => (wgpu::FilterMode::Nearest, wgpu::AddressMode::ClampToEdge),
        SamplerKind::Bilinear => (wgpu::FilterMode::Linear, wgpu::AddressMode::ClampToEdge),
        SamplerKind::BilinearMirrored => (wgpu::FilterMode::Linear, wgpu::AddressMode::MirrorRepeat),
    };
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("renderer sampler"),
        address_mode_u: address,
        address_mode_v: address,
        address_mode_w: address,
        mag_filter: filter,
        min_filter: filter,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    })
}

impl GpuDevice for WgpuDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn format_support(&self, format: TextureFormat) -> FormatSupport {
        let features = self.adapter.get_texture_format_features(wgpu_format(format));
        format_support(features.allowed_usages)
    }

    fn create_image(&mut self, desc: &ImageDesc) -> RenderResult<ImageId> {
        let required = required_support(desc.usage);
        if !self.format_support(desc.format).contains(required) {
            return Err(RenderError::Allocation {
                label: desc.label.to_owned(),
                reason: format!("{} does not support {:?}", desc.format.name(), required),
            });
        }
        let format = wgpu_format(desc.format);
        let texture = self.with_validation(|this| {
            Ok(this.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(desc.label),
                size: wgpu::Extent3d {
                    width: desc.extent.width.max(1),
                    height: desc.extent.height.max(1),
                    depth_or_array_layers: 1,
                },
                mip_level_count: desc.mip_levels.max(1),
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage: texture_usages(desc.usage),
                view_formats: &[],
            }))
        })
        .map_err(|err| RenderError::Allocation {
            label: desc.label.to_owned(),
            reason: err.to_string(),
        })?;

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let mip_views = if desc.mip_levels > 1 {
            (0..desc.mip_levels)
                .map(|level| {
                    texture.create_view(&wgpu::TextureViewDescriptor {
                        base_mip_level: level,
                        mip_level_count: Some(1),
                        ..Default::default()
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        let image = self.alloc_image();
        self.images.insert(
            image,
            GpuImage {
                texture: Some(texture),
                view,
                mip_views,
                desc: desc.clone(),
            },
        );
        log::debug!(
            "Created {} {}x{} {} ({:?})",
            desc.label,
            desc.extent.width,
            desc.extent.height,
            desc.format.name(),
            image
        );
        Ok(image)
    }

    fn destroy_image(&mut self, image: ImageId) -> RenderResult<()> {
        self.retire_completed()?;
        if self.in_flight.iter().any(|record| record.images.contains(&image)) {
            return Err(RenderError::ResourceInFlight(image));
        }
        let gpu = self.images.remove(&image).ok_or(RenderError::UnknownImage(image))?;
        if let Some(texture) = gpu.texture {
            texture.destroy();
        }
        self.bind_groups.clear();
        Ok(())
    }

    fn image_extent(&self, image: ImageId) -> Option<Extent2d> {
        self.images.get(&image).map(|gpu| gpu.desc.extent)
    }

    fn create_buffer(&mut self, label: &'static str, size: u64) -> RenderResult<BufferId> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::UNIFORM
                | wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let id = BufferId(self.alloc_id());
        self.buffers.insert(id, buffer);
        Ok(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> RenderResult<()> {
        let target = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| RenderError::device(format!("unknown buffer {:?}", buffer)))?;
        if offset + data.len() as u64 > target.size() {
            return Err(RenderError::device(format!(
                "write of {} bytes at {} overflows {:?}",
                data.len(),
                offset,
                buffer
            )));
        }
        self.queue.write_buffer(target, offset, data);
        Ok(())
    }

    fn submit(&mut self, commands: CommandStream, fence: Option<&mut Fence>) -> RenderResult<()> {
        let images = commands.referenced_images();
        self.check_images(&images)?;

        let buffer = self.with_validation(|this| this.encode(&commands))?;
        let submission = self.queue.submit(std::iter::once(buffer));

        let index = SubmissionIndex(self.next_submission);
        self.next_submission += 1;
        let completed = Arc::clone(&self.completed);
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(index.0, Ordering::Release);
        });
        self.in_flight.push_back(InFlight {
            index,
            submission,
            images,
        });

        // Never waits here: the surface paces frames, and queue writes to a
        // frame slot are ordered after the submissions that read it.
        self.retire_completed()?;
        if self.in_flight.len() > FRAMES_IN_FLIGHT {
            log::trace!("{} submissions in flight", self.in_flight.len());
        }

        if let Some(fence) = fence {
            fence.arm(index);
        }
        Ok(())
    }

    fn wait_fence(&mut self, fence: &mut Fence, timeout: Option<Duration>) -> RenderResult<()> {
        if let Some(index) = fence.pending() {
            self.retire_through(index, timeout)?;
        }
        fence.signal();
        Ok(())
    }

    fn wait_idle(&mut self) -> RenderResult<()> {
        self.poll_wait(None, None)?;
        self.in_flight.clear();
        self.bind_groups.clear();
        Ok(())
    }

    fn read_pixels(&mut self, image: ImageId) -> RenderResult<Pixmap> {
        let gpu = self.images.get(&image).ok_or(RenderError::UnknownImage(image))?;
        let desc = gpu.desc.clone();
        let texture = match (&gpu.texture, desc.format.is_depth()) {
            (Some(texture), false) if desc.usage.contains(ImageUsage::COPY_SRC) => texture,
            _ => {
                return Err(RenderError::readback(format!(
                    "{} ({:?}) cannot be copied to the host",
                    desc.label, image
                )))
            }
        };

        let Extent2d { width, height } = desc.extent;
        let bytes_per_pixel = desc.format.bytes_per_pixel();
        let unpadded_row = width * bytes_per_pixel;
        let padded_row = unpadded_row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: u64::from(padded_row) * u64::from(height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        let submission = self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.poll_wait(Some(submission), None)?;
        rx.recv()
            .map_err(RenderError::readback)?
            .map_err(RenderError::readback)?;

        let mut data = Vec::with_capacity(unpadded_row as usize * height as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks(padded_row as usize).take(height as usize) {
                data.extend_from_slice(&row[..unpadded_row as usize]);
            }
        }
        staging.unmap();

        Ok(Pixmap {
            width,
            height,
            format: desc.format,
            data,
        })
    }
}
