pub mod attachments;
pub mod bindings;
pub mod capture;
pub mod commands;
pub mod device;
pub mod error;
pub mod format;
pub mod frustum;
pub mod headless;
pub mod hiz;
mod internal;
pub mod orchestrator;
pub mod overlay;
pub mod shaders;
pub mod uniforms;
pub mod variants;
pub mod world;

/// Shadow cascades drawn per frame.
pub const CASCADE_COUNT: usize = 2;

/// Frames the CPU may record ahead of the GPU; also the number of slots in
/// the per-frame uniform buffer.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Shadow cascades are skipped while the light's y direction is below this.
pub const MIN_SHADOW_ELEVATION: f32 = 0.0;

pub use attachments::{Attachment, AttachmentConfig, AttachmentSet};
pub use bindings::{Binding, BoundSets, DescriptorSet, SamplerKind, UniformBinder};
pub use capture::CaptureService;
pub use commands::{AttachmentOp, ClearValue, CommandStream, Framebuffer};
pub use device::{DeviceFeatures, DeviceInfo, Extent2d, Fence, GpuDevice, ImageDesc, ImageId, Pixmap};
pub use error::{RenderError, RenderResult, TransitionViolation};
pub use format::TextureFormat;
pub use headless::HeadlessDevice;
pub use internal::wgpu_device::WgpuDevice;
pub use orchestrator::{FrameOrchestrator, SettingsOutcome};
pub use overlay::{DebugTile, InventoryLayer, OverlayLayer, Overlays, VideoLayer};
pub use shaders::{Pipeline, PipelineId, ShaderKind, Shaders};
pub use variants::{select_variants, VariantInputs, VariantSelection};
pub use world::{Camera, CameraState, DirectionalLight, FrameResources, SceneBindings, SceneInput, WorldView};
