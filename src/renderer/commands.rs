// renderer/commands.rs
// Framebuffer bindings declare per attachment how previous contents are
// treated, so CommandStream::validate can reject illegal transitions early.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytemuck::Pod;

use crate::renderer::bindings::{Binding, DescriptorSet};
use crate::renderer::device::ImageId;
use crate::renderer::error::TransitionViolation;
use crate::renderer::shaders::Pipeline;
use crate::renderer::FRAMES_IN_FLIGHT;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    Depth(f32),
}

/// Load/store contract of one attachment in a framebuffer binding.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AttachmentOp {
    /// Previous contents are undefined; the pass must rewrite every texel.
    Discard,
    /// Like `Discard`, with a defined initial value.
    Clear(ClearValue),
    /// Previous contents carried over; may be blended or read.
    Preserve,
    /// Bound for depth testing / sampling only. Writing it is a defect.
    Readonly,
}

impl AttachmentOp {
    pub const fn clear_color(rgba: [f32; 4]) -> Self {
        AttachmentOp::Clear(ClearValue::Color(rgba))
    }

    pub const fn clear_depth(depth: f32) -> Self {
        AttachmentOp::Clear(ClearValue::Depth(depth))
    }

    pub fn is_writable(self) -> bool {
        !matches!(self, AttachmentOp::Readonly)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AttachmentBinding {
    pub image: ImageId,
    pub op: AttachmentOp,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Framebuffer {
    pub colors: Vec<AttachmentBinding>,
    pub depth: Option<AttachmentBinding>,
}

impl Framebuffer {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn color(image: ImageId, op: AttachmentOp) -> Self {
        Self::none().with_color(image, op)
    }

    pub fn depth_only(image: ImageId, op: AttachmentOp) -> Self {
        Self::none().with_depth(image, op)
    }

    pub fn with_color(mut self, image: ImageId, op: AttachmentOp) -> Self {
        self.colors.push(AttachmentBinding { image, op });
        self
    }

    pub fn with_depth(mut self, image: ImageId, op: AttachmentOp) -> Self {
        self.depth = Some(AttachmentBinding { image, op });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty() && self.depth.is_none()
    }

    pub fn attachments(&self) -> impl Iterator<Item = &AttachmentBinding> {
        self.colors.iter().chain(self.depth.iter())
    }

    pub fn binding_of(&self, image: ImageId) -> Option<&AttachmentBinding> {
        self.attachments().find(|binding| binding.image == image)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawKind {
    /// One fullscreen triangle.
    Fullscreen,
    Vertices { vertex_count: u32, instance_count: u32 },
    /// Mesh-shader dispatch covering `x * y` threads.
    MeshThreads { x: u32, y: u32 },
}

#[derive(Clone, Debug)]
pub enum Command {
    SetFramebuffer(Framebuffer),
    DebugMarker(String),
    SetUniforms {
        pipeline: Pipeline,
        descriptors: Option<Arc<DescriptorSet>>,
        push: Vec<u8>,
    },
    Draw(DrawKind),
    /// Workgroup counts.
    Dispatch { x: u32, y: u32, z: u32 },
    /// Thread counts; the backend derives workgroups.
    DispatchThreads { x: u32, y: u32, z: u32 },
}

#[derive(Clone, Debug)]
pub struct CommandStream {
    frame: u8,
    commands: Vec<Command>,
}

impl CommandStream {
    pub fn new(frame: u8) -> Self {
        Self {
            frame,
            commands: Vec::with_capacity(128),
        }
    }

    pub fn frame(&self) -> u8 {
        self.frame
    }

    /// Slot of the frame-buffered global uniforms this stream reads.
    pub fn frame_slot(&self) -> usize {
        self.frame as usize % FRAMES_IN_FLIGHT
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn set_framebuffer(&mut self, framebuffer: Framebuffer) {
        self.commands.push(Command::SetFramebuffer(framebuffer));
    }

    pub fn set_debug_marker(&mut self, name: impl Into<String>) {
        self.commands.push(Command::DebugMarker(name.into()));
    }

    /// Binds a pipeline that carries no descriptor set of ours.
    pub fn set_pipeline(&mut self, pipeline: Pipeline) {
        self.commands.push(Command::SetUniforms {
            pipeline,
            descriptors: None,
            push: Vec::new(),
        });
    }

    pub fn set_uniforms(&mut self, pipeline: Pipeline, descriptors: &Arc<DescriptorSet>) {
        self.commands.push(Command::SetUniforms {
            pipeline,
            descriptors: Some(Arc::clone(descriptors)),
            push: Vec::new(),
        });
    }

    pub fn set_uniforms_with_push<T: Pod>(
        &mut self,
        pipeline: Pipeline,
        descriptors: &Arc<DescriptorSet>,
        push: &T,
    ) {
        self.commands.push(Command::SetUniforms {
            pipeline,
            descriptors: Some(Arc::clone(descriptors)),
            push: bytemuck::bytes_of(push).to_vec(),
        });
    }

    pub fn draw_fullscreen(&mut self) {
        self.commands.push(Command::Draw(DrawKind::Fullscreen));
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.commands.push(Command::Draw(DrawKind::Vertices {
            vertex_count,
            instance_count,
        }));
    }

    pub fn dispatch_mesh_threads(&mut self, x: u32, y: u32) {
        self.commands.push(Command::Draw(DrawKind::MeshThreads { x, y }));
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(Command::Dispatch { x, y, z });
    }

    pub fn dispatch_threads(&mut self, x: u32, y: u32) {
        self.commands.push(Command::DispatchThreads {
            x: x.max(1),
            y: y.max(1),
            z: 1,
        });
    }

    pub fn markers(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().filter_map(|command| match command {
            Command::DebugMarker(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Every image touched by an attachment binding or a descriptor set.
    pub fn referenced_images(&self) -> BTreeSet<ImageId> {
        let mut images = BTreeSet::new();
        for command in &self.commands {
            match command {
                Command::SetFramebuffer(framebuffer) => {
                    images.extend(framebuffer.attachments().map(|binding| binding.image));
                }
                Command::SetUniforms {
                    descriptors: Some(set),
                    ..
                } => images.extend(set.images()),
                _ => {}
            }
        }
        images
    }

    /// Checks every draw and dispatch against the framebuffer bound at the
    /// time it was recorded.
    pub fn validate(&self) -> Result<(), TransitionViolation> {
        let mut framebuffer = Framebuffer::none();
        let mut pass = String::new();
        let mut bound: Option<(Pipeline, Option<&Arc<DescriptorSet>>)> = None;

        for command in &self.commands {
            match command {
                Command::SetFramebuffer(next) => framebuffer = next.clone(),
                Command::DebugMarker(name) => pass.clone_from(name),
                Command::SetUniforms {
                    pipeline,
                    descriptors,
                    ..
                } => bound = Some((*pipeline, descriptors.as_ref())),
                Command::Draw(_) => {
                    if let Some((pipeline, descriptors)) = bound {
                        check_writes(&framebuffer, &pipeline, &pass)?;
                        if let Some(set) = descriptors {
                            check_reads(&framebuffer, set, &pass)?;
                        }
                    }
                }
                Command::Dispatch { .. } | Command::DispatchThreads { .. } => {
                    if let Some((_, Some(set))) = bound {
                        check_reads(&framebuffer, set, &pass)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_writes(
    framebuffer: &Framebuffer,
    pipeline: &Pipeline,
    pass: &str,
) -> Result<(), TransitionViolation> {
    if pipeline.writes_depth {
        if let Some(depth) = framebuffer.depth.filter(|d| !d.op.is_writable()) {
            return Err(TransitionViolation::DepthWriteToReadonly {
                pass: pass.to_owned(),
                image: depth.image,
            });
        }
    }
    if pipeline.writes_color {
        if let Some(color) = framebuffer.colors.iter().find(|c| !c.op.is_writable()) {
            return Err(TransitionViolation::ColorWriteToReadonly {
                pass: pass.to_owned(),
                image: color.image,
            });
        }
    }
    Ok(())
}

fn check_reads(
    framebuffer: &Framebuffer,
    set: &DescriptorSet,
    pass: &str,
) -> Result<(), TransitionViolation> {
    for binding in set.bindings() {
        match binding {
            Binding::Sampled { image, .. } => {
                if let Some(attached) = framebuffer.binding_of(*image) {
                    if attached.op.is_writable() {
                        return Err(TransitionViolation::SampledWhileWritable {
                            pass: pass.to_owned(),
                            image: *image,
                        });
                    }
                }
            }
            Binding::Storage { image, .. } => {
                if framebuffer.binding_of(*image).is_some() {
                    return Err(TransitionViolation::StorageWhileAttached {
                        pass: pass.to_owned(),
                        image: *image,
                    });
                }
            }
            _ => {}
        }
    }
    Ok(())
}
