// Scripted world and camera. Every hook records its name and draws with its
// own pipeline so it shows up in image contents.

#![allow(dead_code)]

use deferred_renderer::renderer::commands::{AttachmentOp, Framebuffer};
use deferred_renderer::renderer::device::ImageDesc;
use deferred_renderer::renderer::frustum::{Frustum, FRUSTUM_COUNT};
use deferred_renderer::renderer::{
    Camera, CommandStream, DirectionalLight, Extent2d, FrameOrchestrator, FrameResources,
    GpuDevice, HeadlessDevice, ImageId, Pipeline, PipelineId, SceneBindings, Shaders,
    TextureFormat, WorldView,
};
use deferred_renderer::{DebugConfig, RenderSettings};
use glam::{Mat4, Vec3};

pub const EXTENT: Extent2d = Extent2d::new(320, 180);

pub struct MockWorld {
    pub light: DirectionalLight,
    pub bindings: SceneBindings,
    pub calls: Vec<&'static str>,
    pub shadow_layers: Vec<usize>,
    pub visibility_passes: usize,
    pub resources: Vec<FrameResources>,
    pub translucent_writes_depth: bool,
}

impl MockWorld {
    /// Allocates the world-owned lookup images on `device`.
    pub fn new(device: &mut dyn GpuDevice) -> Self {
        let mut image = |label| {
            device
                .create_image(&ImageDesc::attachment(label, TextureFormat::Rgba16, Extent2d::new(64, 64)))
                .unwrap()
        };
        let bindings = SceneBindings {
            sky_lut: image("sky lut"),
            clouds_day: [image("clouds day 0"), image("clouds day 1")],
            clouds_night: [image("clouds night 0"), image("clouds night 1")],
            ray_tracing: None,
        };
        Self {
            light: DirectionalLight {
                direction: Vec3::new(0.3, 0.8, 0.2).normalize(),
                ..DirectionalLight::default()
            },
            bindings,
            calls: Vec::new(),
            shadow_layers: Vec::new(),
            visibility_passes: 0,
            resources: Vec::new(),
            translucent_writes_depth: false,
        }
    }

    pub fn sky_lut(&self) -> ImageId {
        self.bindings.sky_lut
    }

    fn record(&mut self, cmd: &mut CommandStream, call: &'static str, pipeline: Pipeline) {
        self.calls.push(call);
        cmd.set_pipeline(pipeline);
        cmd.draw(36, 1);
    }
}

fn world_pipeline(id: u32) -> Pipeline {
    Pipeline::graphics(PipelineId(100 + id))
}

fn world_depth_pipeline(id: u32) -> Pipeline {
    Pipeline::depth_writing(PipelineId(100 + id))
}

impl WorldView for MockWorld {
    fn main_light(&self) -> DirectionalLight {
        self.light
    }

    fn ambient_light(&self) -> Vec3 {
        Vec3::splat(0.2)
    }

    fn auto_exposure(&self) -> f32 {
        1.0
    }

    fn scene_bindings(&self) -> SceneBindings {
        self.bindings.clone()
    }

    fn bind_frame_resources(&mut self, resources: &FrameResources) {
        self.resources.push(resources.clone());
    }

    fn visibility_pass(&mut self, _frustums: &[Frustum; FRUSTUM_COUNT]) {
        self.visibility_passes += 1;
    }

    fn draw_hiz_occluders(&mut self, cmd: &mut CommandStream, _frame: u8) {
        self.record(cmd, "hiz_occluders", world_depth_pipeline(1));
    }

    fn prepare_sky(&mut self, cmd: &mut CommandStream, _frame: u8) {
        cmd.set_framebuffer(Framebuffer::color(self.bindings.sky_lut, AttachmentOp::Discard));
        self.record(cmd, "sky_lut", world_pipeline(2));
    }

    fn draw_gbuffer(&mut self, cmd: &mut CommandStream, _frame: u8) {
        self.record(cmd, "gbuffer", world_depth_pipeline(3));
    }

    fn draw_shadow(&mut self, cmd: &mut CommandStream, _frame: u8, layer: usize) {
        self.shadow_layers.push(layer);
        self.record(cmd, "shadow", world_depth_pipeline(4));
    }

    fn prepare_fog(&mut self, _cmd: &mut CommandStream, _frame: u8) {
        self.calls.push("fog_lut");
    }

    fn draw_lights(&mut self, cmd: &mut CommandStream, _frame: u8) {
        self.record(cmd, "lights", world_pipeline(5));
    }

    fn draw_sky(&mut self, cmd: &mut CommandStream, _frame: u8) {
        self.record(cmd, "sky", world_pipeline(6));
    }

    fn draw_water(&mut self, cmd: &mut CommandStream, _frame: u8) {
        self.record(cmd, "water", world_depth_pipeline(7));
    }

    fn draw_sun_moon(&mut self, cmd: &mut CommandStream, _frame: u8) {
        self.record(cmd, "sun_moon", world_pipeline(8));
    }

    fn draw_translucent(&mut self, cmd: &mut CommandStream, _frame: u8) {
        let pipeline = if self.translucent_writes_depth {
            world_depth_pipeline(9)
        } else {
            world_pipeline(9)
        };
        self.record(cmd, "translucent", pipeline);
    }

    fn draw_fog(&mut self, cmd: &mut CommandStream, _frame: u8) {
        self.record(cmd, "fog", world_pipeline(10));
    }
}

#[derive(Clone, Debug)]
pub struct MockCamera {
    pub eye: Vec3,
    pub in_water: bool,
}

impl Default for MockCamera {
    fn default() -> Self {
        Self {
            eye: Vec3::new(0.0, 5.0, 10.0),
            in_water: false,
        }
    }
}

impl MockCamera {
    fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye, Vec3::ZERO, Vec3::Y)
    }
}

impl Camera for MockCamera {
    fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, self.z_near(), self.z_far())
    }

    fn view_proj(&self) -> Mat4 {
        self.projection() * self.view()
    }

    fn view_proj_lwc(&self) -> Mat4 {
        self.projection() * Mat4::look_to_rh(Vec3::ZERO, -self.eye.normalize(), Vec3::Y)
    }

    fn view_shadow(&self, light_dir: Vec3, layer: usize) -> Mat4 {
        let half = 20.0 * (layer as f32 + 1.0);
        let proj = Mat4::orthographic_rh(-half, half, -half, half, 0.0, 200.0);
        proj * Mat4::look_at_rh(light_dir * 100.0, Vec3::ZERO, Vec3::Z)
    }

    fn z_near(&self) -> f32 {
        0.1
    }

    fn z_far(&self) -> f32 {
        500.0
    }

    fn is_in_water(&self) -> bool {
        self.in_water
    }
}

pub fn strict_debug() -> DebugConfig {
    DebugConfig {
        validate_transitions: true,
        ..DebugConfig::default()
    }
}

/// Headless device with a world and a swapchain-sized target already on it.
pub fn setup(settings: RenderSettings) -> (FrameOrchestrator<HeadlessDevice>, MockWorld, ImageId) {
    setup_on(HeadlessDevice::new(), settings)
}

pub fn setup_on(
    mut device: HeadlessDevice,
    settings: RenderSettings,
) -> (FrameOrchestrator<HeadlessDevice>, MockWorld, ImageId) {
    let world = MockWorld::new(&mut device);
    let target = swapchain_image(&mut device, EXTENT);
    let orchestrator =
        FrameOrchestrator::new(device, Shaders::enumerated(), EXTENT, settings, strict_debug()).unwrap();
    (orchestrator, world, target)
}

pub fn swapchain_image(device: &mut dyn GpuDevice, extent: Extent2d) -> ImageId {
    device
        .create_image(&ImageDesc::attachment("swapchain", TextureFormat::Bgra8, extent))
        .unwrap()
}
