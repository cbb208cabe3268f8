// renderer/headless.rs
// Images carry a 64-bit content hash instead of texels. Two frames read back
// equal exactly when they ran the same work on the same inputs.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::renderer::bindings::{Binding, DescriptorSet};
use crate::renderer::commands::{AttachmentOp, ClearValue, Command, CommandStream, DrawKind, Framebuffer};
use crate::renderer::device::{
    BufferId, DeviceFeatures, DeviceInfo, Extent2d, Fence, GpuDevice, ImageDesc, ImageId, Pixmap,
    SubmissionIndex,
};
use crate::renderer::error::{RenderError, RenderResult};
use crate::renderer::format::{FormatSupport, TextureFormat};
use crate::renderer::shaders::Pipeline;
use crate::renderer::FRAMES_IN_FLIGHT;

const DISCARDED: u64 = 0x6a09_e667_f3bc_c908;

/// Submissions kept for inspection unless overridden with
/// [`HeadlessDevice::set_history_depth`].
pub const DEFAULT_HISTORY_DEPTH: usize = 64;

fn mix(hash: u64, value: u64) -> u64 {
    (hash ^ value)
        .wrapping_mul(0x0000_0100_0000_01b3)
        .rotate_left(17)
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
}

fn mix_bytes(hash: u64, bytes: &[u8]) -> u64 {
    bytes.iter().fold(hash, |h, b| mix(h, u64::from(*b)))
}

#[derive(Debug)]
struct ImageState {
    desc: ImageDesc,
    content: u64,
}

/// One queued submission, kept for inspection.
#[derive(Clone, Debug)]
pub struct SubmissionRecord {
    pub index: SubmissionIndex,
    pub stream: CommandStream,
    pub images: BTreeSet<ImageId>,
}

impl SubmissionRecord {
    pub fn markers(&self) -> Vec<&str> {
        self.stream.markers().collect()
    }
}

pub struct HeadlessDevice {
    info: DeviceInfo,
    support: HashMap<TextureFormat, FormatSupport>,
    images: HashMap<ImageId, ImageState>,
    buffers: HashMap<BufferId, Vec<u8>>,
    // Image ids are never reused, so any id below this that is not live was destroyed.
    next_image: u32,
    next_buffer: u32,
    next_submission: u64,
    in_flight: Vec<SubmissionRecord>,
    history: VecDeque<SubmissionRecord>,
    history_depth: usize,
    image_limit: Option<usize>,
    idle_waits: u32,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    /// Every format fully supported, no optional features.
    pub fn new() -> Self {
        Self::with_features(DeviceFeatures::empty())
    }

    pub fn with_features(features: DeviceFeatures) -> Self {
        let all = FormatSupport::all();
        let support = [
            TextureFormat::R8,
            TextureFormat::R16,
            TextureFormat::R32F,
            TextureFormat::Rgba8,
            TextureFormat::Bgra8,
            TextureFormat::Rgba16,
            TextureFormat::Rgba32F,
            TextureFormat::R11G11B10UF,
            TextureFormat::Depth16,
            TextureFormat::Depth24x8,
            TextureFormat::Depth32F,
        ]
        .into_iter()
        .map(|format| (format, all))
        .collect();

        Self {
            info: DeviceInfo {
                name: "headless".to_string(),
                features,
            },
            support,
            images: HashMap::new(),
            buffers: HashMap::new(),
            next_image: 1,
            next_buffer: 1,
            next_submission: 1,
            in_flight: Vec::new(),
            history: VecDeque::new(),
            history_depth: DEFAULT_HISTORY_DEPTH,
            image_limit: None,
            idle_waits: 0,
        }
    }

    pub fn set_format_support(&mut self, format: TextureFormat, support: FormatSupport) {
        self.support.insert(format, support);
    }

    /// Simulates running out of memory: image creation fails while `limit`
    /// images are live.
    pub fn set_image_limit(&mut self, limit: Option<usize>) {
        self.image_limit = limit;
    }

    /// Caps the retained submission history; 0 disables recording.
    pub fn set_history_depth(&mut self, depth: usize) {
        self.history_depth = depth;
        while self.history.len() > depth {
            self.history.pop_front();
        }
    }

    /// The most recent submissions, oldest first.
    pub fn submissions(&self) -> impl Iterator<Item = &SubmissionRecord> {
        self.history.iter()
    }

    pub fn submission_count(&self) -> usize {
        self.history.len()
    }

    pub fn last_submission(&self) -> Option<&SubmissionRecord> {
        self.history.back()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn idle_waits(&self) -> u32 {
        self.idle_waits
    }

    pub fn live_images(&self) -> usize {
        self.images.len()
    }

    pub fn image_desc(&self, image: ImageId) -> Option<&ImageDesc> {
        self.images.get(&image).map(|state| &state.desc)
    }

    pub fn content_of(&self, image: ImageId) -> Option<u64> {
        self.images.get(&image).map(|state| state.content)
    }

    pub fn buffer_contents(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(Vec::as_slice)
    }


    fn retire_through(&mut self, index: SubmissionIndex) {
        self.in_flight.retain(|record| record.index > index);
    }

    fn check_images(&self, images: &BTreeSet<ImageId>) -> RenderResult<()> {
        for image in images {
            if self.images.contains_key(image) {
                continue;
            }
            if image.0 < self.next_image {
                return Err(RenderError::StaleBinding(*image));
            }
            return Err(RenderError::UnknownImage(*image));
        }
        Ok(())
    }

    fn content(&self, image: ImageId) -> u64 {
        self.images.get(&image).map_or(0, |state| state.content)
    }

    fn set_content(&mut self, image: ImageId, content: u64) {
        if let Some(state) = self.images.get_mut(&image) {
            state.content = content;
        }
    }

    fn input_hash(
        &self,
        stream: &CommandStream,
        pipeline: &Pipeline,
        descriptors: Option<&Arc<DescriptorSet>>,
        push: &[u8],
    ) -> u64 {
        let mut hash = mix(0, u64::from(pipeline.id.0));
        hash = mix_bytes(hash, push);
        let Some(set) = descriptors else {
            return hash;
        };
        for binding in set.bindings() {
            hash = match binding {
                Binding::Sampled { image, mip, .. } => {
                    mix(mix(hash, self.content(*image)), u64::from(mip.unwrap_or(u32::MAX)))
                }
                // Storage targets are outputs; their previous content is not read.
                Binding::Storage { mip, .. } => mix(hash, u64::from(mip.unwrap_or(u32::MAX))),
                Binding::FrameUniform { buffer, slot_size } => {
                    let start = (stream.frame_slot() as u64 * slot_size) as usize;
                    let end = start + *slot_size as usize;
                    let bytes = self
                        .buffers
                        .get(buffer)
                        .and_then(|data| data.get(start..end.min(data.len())))
                        .unwrap_or(&[]);
                    mix_bytes(hash, bytes)
                }
                Binding::Sampler(kind) => mix(hash, *kind as u64),
                Binding::AccelerationStructure(id) => mix(hash, u64::from(id.0)),
                Binding::TextureArray(id) | Binding::BufferArray(id) => mix(hash, u64::from(id.0)),
                Binding::Buffer(id) => mix(hash, u64::from(id.0)),
            };
        }
        hash
    }

    fn execute(&mut self, stream: &CommandStream) {
        let mut framebuffer = Framebuffer::none();
        let mut bound: Option<(Pipeline, Option<Arc<DescriptorSet>>, Vec<u8>)> = None;

        for command in stream.commands() {
            match command {
                Command::SetFramebuffer(next) => {
                    for attachment in next.attachments() {
                        match attachment.op {
                            AttachmentOp::Discard => self.set_content(attachment.image, DISCARDED),
                            AttachmentOp::Clear(value) => {
                                let content = match value {
                                    ClearValue::Color(rgba) => rgba
                                        .iter()
                                        .fold(1, |h, c| mix(h, u64::from(c.to_bits()))),
                                    ClearValue::Depth(depth) => mix(2, u64::from(depth.to_bits())),
                                };
                                self.set_content(attachment.image, content);
                            }
                            AttachmentOp::Preserve | AttachmentOp::Readonly => {}
                        }
                    }
                    framebuffer = next.clone();
                }
                Command::DebugMarker(_) => {}
                Command::SetUniforms {
                    pipeline,
                    descriptors,
                    push,
                } => bound = Some((*pipeline, descriptors.clone(), push.clone())),
                Command::Draw(kind) => {
                    let Some((pipeline, descriptors, push)) = &bound else {
                        continue;
                    };
                    if pipeline.is_null() {
                        continue;
                    }
                    let shape = match kind {
                        DrawKind::Fullscreen => 3,
                        DrawKind::Vertices {
                            vertex_count,
                            instance_count,
                        } => u64::from(*vertex_count) << 32 | u64::from(*instance_count),
                        DrawKind::MeshThreads { x, y } => u64::from(*x) << 32 | u64::from(*y),
                    };
                    let input = mix(self.input_hash(stream, pipeline, descriptors.as_ref(), push), shape);
                    if pipeline.writes_color {
                        for color in framebuffer.colors.iter().filter(|c| c.op.is_writable()) {
                            let content = mix(self.content(color.image), input);
                            self.set_content(color.image, content);
                        }
                    }
                    if pipeline.writes_depth {
                        if let Some(depth) = framebuffer.depth.filter(|d| d.op.is_writable()) {
                            let content = mix(self.content(depth.image), input);
                            self.set_content(depth.image, content);
                        }
                    }
                }
                Command::Dispatch { x, y, z } | Command::DispatchThreads { x, y, z } => {
                    let Some((pipeline, Some(set), push)) = &bound else {
                        continue;
                    };
                    if pipeline.is_null() {
                        continue;
                    }
                    let size = u64::from(*x) << 40 | u64::from(*y) << 20 | u64::from(*z);
                    let input = mix(self.input_hash(stream, pipeline, Some(set), push), size);
                    let outputs: Vec<(ImageId, u64)> = set
                        .bindings()
                        .filter_map(|binding| match binding {
                            Binding::Storage { image, mip } => {
                                Some((*image, mix(input, u64::from(mip.unwrap_or(0)))))
                            }
                            _ => None,
                        })
                        .collect();
                    for (image, content) in outputs {
                        self.set_content(image, content);
                    }
                }
            }
        }
    }
}

impl GpuDevice for HeadlessDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn format_support(&self, format: TextureFormat) -> FormatSupport {
        self.support.get(&format).copied().unwrap_or(FormatSupport::empty())
    }

    fn create_image(&mut self, desc: &ImageDesc) -> RenderResult<ImageId> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(RenderError::Allocation {
                label: desc.label.to_string(),
                reason: "zero-sized image".to_string(),
            });
        }
        if self.image_limit.is_some_and(|limit| self.images.len() >= limit) {
            return Err(RenderError::Allocation {
                label: desc.label.to_string(),
                reason: "out of device memory".to_string(),
            });
        }
        let image = ImageId(self.next_image);
        self.next_image += 1;
        self.images.insert(
            image,
            ImageState {
                desc: desc.clone(),
                content: 0,
            },
        );
        Ok(image)
    }

    fn destroy_image(&mut self, image: ImageId) -> RenderResult<()> {
        if self.in_flight.iter().any(|record| record.images.contains(&image)) {
            return Err(RenderError::ResourceInFlight(image));
        }
        if self.images.remove(&image).is_none() {
            return Err(RenderError::UnknownImage(image));
        }
        Ok(())
    }

    fn image_extent(&self, image: ImageId) -> Option<Extent2d> {
        self.images.get(&image).map(|state| state.desc.extent)
    }

    fn create_buffer(&mut self, _label: &'static str, size: u64) -> RenderResult<BufferId> {
        let buffer = BufferId(self.next_buffer);
        self.next_buffer += 1;
        self.buffers.insert(buffer, vec![0; size as usize]);
        Ok(buffer)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> RenderResult<()> {
        let contents = self
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| RenderError::device(format!("unknown buffer {:?}", buffer)))?;
        let start = offset as usize;
        let end = start + data.len();
        let dst = contents
            .get_mut(start..end)
            .ok_or_else(|| RenderError::device(format!("write past end of {:?}", buffer)))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn submit(&mut self, commands: CommandStream, fence: Option<&mut Fence>) -> RenderResult<()> {
        let images = commands.referenced_images();
        self.check_images(&images)?;
        self.execute(&commands);

        let index = SubmissionIndex(self.next_submission);
        self.next_submission += 1;
        let record = SubmissionRecord {
            index,
            stream: commands,
            images,
        };
        if self.history_depth > 0 {
            if self.history.len() == self.history_depth {
                self.history.pop_front();
            }
            self.history.push_back(record.clone());
        }
        self.in_flight.push(record);

        // Presentation paces the queue to FRAMES_IN_FLIGHT submissions.
        if self.in_flight.len() > FRAMES_IN_FLIGHT {
            let oldest = self.in_flight[self.in_flight.len() - FRAMES_IN_FLIGHT - 1].index;
            self.retire_through(oldest);
        }

        if let Some(fence) = fence {
            fence.arm(index);
        }
        Ok(())
    }

    fn wait_fence(&mut self, fence: &mut Fence, _timeout: Option<Duration>) -> RenderResult<()> {
        if let Some(index) = fence.pending() {
            self.retire_through(index);
        }
        fence.signal();
        Ok(())
    }

    fn wait_idle(&mut self) -> RenderResult<()> {
        self.in_flight.clear();
        self.idle_waits += 1;
        Ok(())
    }

    fn read_pixels(&mut self, image: ImageId) -> RenderResult<Pixmap> {
        let state = self.images.get(&image).ok_or(RenderError::UnknownImage(image))?;
        let Extent2d { width, height } = state.desc.extent;
        let len = width as usize * height as usize * state.desc.format.bytes_per_pixel() as usize;
        let data = state.content.to_le_bytes().into_iter().cycle().take(len).collect();
        Ok(Pixmap {
            width,
            height,
            format: state.desc.format,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::shaders::PipelineId;

    fn color_target(device: &mut HeadlessDevice) -> ImageId {
        device
            .create_image(&ImageDesc::attachment(
                "target",
                TextureFormat::Rgba8,
                Extent2d::new(4, 2),
            ))
            .unwrap()
    }

    #[test]
    fn destroying_an_image_in_flight_is_rejected() {
        let mut device = HeadlessDevice::new();
        let target = color_target(&mut device);
        let mut cmd = CommandStream::new(0);
        cmd.set_framebuffer(Framebuffer::color(target, AttachmentOp::Discard));
        device.submit(cmd, None).unwrap();

        assert!(matches!(
            device.destroy_image(target),
            Err(RenderError::ResourceInFlight(_))
        ));
        device.wait_idle().unwrap();
        device.destroy_image(target).unwrap();
    }

    #[test]
    fn submitting_a_destroyed_image_is_a_stale_binding() {
        let mut device = HeadlessDevice::new();
        let target = color_target(&mut device);
        device.destroy_image(target).unwrap();

        let mut cmd = CommandStream::new(0);
        cmd.set_framebuffer(Framebuffer::color(target, AttachmentOp::Discard));
        assert!(matches!(
            device.submit(cmd, None),
            Err(RenderError::StaleBinding(_))
        ));
        assert_eq!(device.submission_count(), 0);
    }

    #[test]
    fn fence_wait_retires_its_submission() {
        let mut device = HeadlessDevice::new();
        let target = color_target(&mut device);
        let mut fence = Fence::new();
        let mut cmd = CommandStream::new(0);
        cmd.set_framebuffer(Framebuffer::color(target, AttachmentOp::Discard));
        device.submit(cmd, Some(&mut fence)).unwrap();
        assert!(!fence.is_signaled());
        device.wait_fence(&mut fence, None).unwrap();
        assert!(fence.is_signaled());
        assert_eq!(device.in_flight(), 0);
    }

    #[test]
    fn same_work_gives_same_pixels() {
        let mut device = HeadlessDevice::new();
        let target = color_target(&mut device);
        let record = |clear: f32| {
            let mut cmd = CommandStream::new(0);
            cmd.set_framebuffer(Framebuffer::color(
                target,
                AttachmentOp::clear_color([clear, 0.0, 0.0, 1.0]),
            ));
            cmd.set_pipeline(Pipeline::graphics(PipelineId(7)));
            cmd.draw_fullscreen();
            cmd
        };

        device.submit(record(0.0), None).unwrap();
        let a = device.read_pixels(target).unwrap();
        device.submit(record(0.0), None).unwrap();
        let b = device.read_pixels(target).unwrap();
        device.submit(record(1.0), None).unwrap();
        let c = device.read_pixels(target).unwrap();

        assert_eq!(a.data.len(), 4 * 2 * 4);
        assert_eq!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), c.checksum());
    }

    #[test]
    fn null_pipeline_draws_are_skipped() {
        let mut device = HeadlessDevice::new();
        let target = color_target(&mut device);
        let mut cmd = CommandStream::new(0);
        cmd.set_framebuffer(Framebuffer::color(target, AttachmentOp::clear_color([0.0; 4])));
        device.submit(cmd.clone(), None).unwrap();
        let cleared = device.content_of(target);

        cmd.set_pipeline(Pipeline::NULL);
        cmd.draw_fullscreen();
        device.submit(cmd, None).unwrap();
        assert_eq!(device.content_of(target), cleared);
    }

    #[test]
    fn queue_depth_is_bounded_by_frames_in_flight() {
        let mut device = HeadlessDevice::new();
        for frame in 0..8 {
            device.submit(CommandStream::new(frame), None).unwrap();
        }
        assert_eq!(device.in_flight(), FRAMES_IN_FLIGHT);
        assert_eq!(device.submission_count(), 8);
    }

    #[test]
    fn history_keeps_only_the_most_recent_submissions() {
        let mut device = HeadlessDevice::new();
        for frame in 0..(DEFAULT_HISTORY_DEPTH as u64 + 40) {
            device.submit(CommandStream::new((frame % 2) as u8), None).unwrap();
        }
        assert_eq!(device.submission_count(), DEFAULT_HISTORY_DEPTH);
        let last = device.last_submission().unwrap().index;
        assert_eq!(last, SubmissionIndex(DEFAULT_HISTORY_DEPTH as u64 + 40));
        let first = device.submissions().next().unwrap().index;
        assert_eq!(first, SubmissionIndex(41));

        device.set_history_depth(0);
        device.submit(CommandStream::new(0), None).unwrap();
        assert_eq!(device.submission_count(), 0);
        assert!(device.last_submission().is_none());
    }

    #[test]
    fn destroyed_and_unknown_images_are_told_apart() {
        let mut device = HeadlessDevice::new();
        let destroyed = color_target(&mut device);
        device.destroy_image(destroyed).unwrap();
        for _ in 0..16 {
            let image = color_target(&mut device);
            device.destroy_image(image).unwrap();
        }
        let buffer = device.create_buffer("globals", 16).unwrap();

        let submit = |device: &mut HeadlessDevice, image| {
            let mut cmd = CommandStream::new(0);
            cmd.set_framebuffer(Framebuffer::color(image, AttachmentOp::Discard));
            device.submit(cmd, None)
        };
        assert!(matches!(
            submit(&mut device, destroyed),
            Err(RenderError::StaleBinding(image)) if image == destroyed
        ));
        // buffer ids do not share the image id space
        assert!(matches!(
            submit(&mut device, ImageId(buffer.0 + 100)),
            Err(RenderError::UnknownImage(_))
        ));
    }
}
