// renderer/world.rs

use glam::{Mat4, Vec3};

use crate::renderer::commands::CommandStream;
use crate::renderer::device::{AccelId, BindlessId, BufferId, ImageId};
use crate::renderer::frustum::{Frustum, FRUSTUM_COUNT};
use crate::renderer::CASCADE_COUNT;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DirectionalLight {
    /// Normalised direction towards the light.
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::Y,
            color: Vec3::ONE,
            intensity: 1.0,
        }
    }
}

/// Bindless scene bundle required by ray-query shadows.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RayTracingScene {
    pub tlas: AccelId,
    pub textures: BindlessId,
    pub vertices: BindlessId,
    pub indices: BindlessId,
    pub index_offsets: BufferId,
}

/// World-owned images the core pipelines sample.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SceneBindings {
    pub sky_lut: ImageId,
    pub clouds_day: [ImageId; 2],
    pub clouds_night: [ImageId; 2],
    pub ray_tracing: Option<RayTracingScene>,
}

/// Core-owned targets the world's own pipelines bind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameResources {
    pub gbuf_diffuse: ImageId,
    pub gbuf_normal: ImageId,
    pub zbuffer: ImageId,
    pub scene_opaque: ImageId,
    pub scene_depth: ImageId,
    pub shadow_maps: Vec<ImageId>,
    pub hiz: Option<ImageId>,
}

pub trait Camera {
    fn projection(&self) -> Mat4;
    fn view_proj(&self) -> Mat4;
    /// View-projection relative to the camera position (large world coordinates).
    fn view_proj_lwc(&self) -> Mat4;
    fn view_shadow(&self, light_dir: Vec3, layer: usize) -> Mat4;
    fn z_near(&self) -> f32;
    fn z_far(&self) -> f32;
    fn is_in_water(&self) -> bool;
}

/// Snapshot of everything the frame reads from the camera.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraState {
    pub projection: Mat4,
    pub view_proj: Mat4,
    pub view_proj_lwc: Mat4,
    pub shadow: [Mat4; CASCADE_COUNT],
    /// `(near * far, near - far, far)`, for linearising depth.
    pub clip_info: Vec3,
    pub in_water: bool,
}

impl CameraState {
    pub fn capture(camera: &dyn Camera, light_dir: Vec3) -> Self {
        let near = camera.z_near();
        let far = camera.z_far();
        Self {
            projection: camera.projection(),
            view_proj: camera.view_proj(),
            view_proj_lwc: camera.view_proj_lwc(),
            shadow: std::array::from_fn(|layer| camera.view_shadow(light_dir, layer)),
            clip_info: Vec3::new(near * far, near - far, far),
            in_water: camera.is_in_water(),
        }
    }
}

/// The scene as the renderer sees it.
///
/// `draw_*` hooks record into the framebuffer the orchestrator bound before
/// calling them and must not rebind it. `prepare_*` hooks render into
/// world-owned lookup tables and bind their own targets.
pub trait WorldView {
    fn main_light(&self) -> DirectionalLight;
    fn ambient_light(&self) -> Vec3;
    fn auto_exposure(&self) -> f32;

    /// Advances sun and moon. Called once per frame before the camera is read.
    fn update_light(&mut self) {}

    fn scene_bindings(&self) -> SceneBindings;

    /// Called after every descriptor rebuild with the current targets.
    fn bind_frame_resources(&mut self, resources: &FrameResources);

    fn visibility_pass(&mut self, frustums: &[Frustum; FRUSTUM_COUNT]);

    fn pre_frame_update(&mut self, _frame: u8) {}

    fn draw_hiz_occluders(&mut self, cmd: &mut CommandStream, frame: u8);
    fn prepare_sky(&mut self, cmd: &mut CommandStream, frame: u8);
    fn draw_gbuffer(&mut self, cmd: &mut CommandStream, frame: u8);
    fn draw_shadow(&mut self, cmd: &mut CommandStream, frame: u8, layer: usize);
    fn prepare_fog(&mut self, cmd: &mut CommandStream, frame: u8);
    fn draw_lights(&mut self, cmd: &mut CommandStream, frame: u8);
    fn draw_sky(&mut self, cmd: &mut CommandStream, frame: u8);
    fn draw_water(&mut self, cmd: &mut CommandStream, frame: u8);
    fn draw_sun_moon(&mut self, cmd: &mut CommandStream, frame: u8);
    fn draw_translucent(&mut self, cmd: &mut CommandStream, frame: u8);
    fn draw_fog(&mut self, cmd: &mut CommandStream, frame: u8);
}

/// World and camera for one frame. A frame without one draws blank.
pub struct SceneInput<'a> {
    pub world: &'a mut dyn WorldView,
    pub camera: &'a dyn Camera,
}

impl<'a> SceneInput<'a> {
    pub fn new(world: &'a mut dyn WorldView, camera: &'a dyn Camera) -> Self {
        Self { world, camera }
    }
}
