// renderer/orchestrator.rs
// Fifteen steps per frame, always in the same order. Variants only change
// what a step binds.

use glam::Vec3;

use crate::renderer::attachments::{AttachmentConfig, AttachmentSet};
use crate::renderer::bindings::{BindingInputs, BoundSets, UniformBinder};
use crate::renderer::capture::CaptureService;
use crate::renderer::commands::{AttachmentOp, CommandStream, Framebuffer};
use crate::renderer::device::{DeviceFeatures, Extent2d, Fence, GpuDevice, ImageId};
use crate::renderer::error::RenderResult;
use crate::renderer::frustum::{cascade_view, Frustum, FRUSTUM_COUNT, MAIN_VIEW};
use crate::renderer::hiz::HiZBuilder;
use crate::renderer::overlay::{debug_tile_layout, DebugTile, Overlays};
use crate::renderer::shaders::{ShaderKind, Shaders};
use crate::renderer::uniforms::{AmbientPush, GlobalUniforms, SceneGlobalsUniform, SsaoPush, TonemappingPush};
use crate::renderer::variants::{select_variants, ChangedAxes, VariantInputs, VariantSelection};
use crate::renderer::world::{Camera, CameraState, SceneBindings, SceneInput, WorldView};
use crate::renderer::MIN_SHADOW_ELEVATION;
use crate::settings::{DebugConfig, RenderSettings};

const BLANK: [f32; 4] = [0.0, 0.0, 0.0, 0.0];

/// Shadow cascades are drawn only while the light is at or above the
/// minimum elevation.
pub fn cascades_visible(light_dir: Vec3) -> bool {
    light_dir.y >= MIN_SHADOW_ELEVATION
}

/// What [`FrameOrchestrator::apply_settings`] had to redo.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SettingsOutcome {
    pub changed: ChangedAxes,
    pub reallocated: bool,
    pub rebuilt: bool,
}

pub struct FrameOrchestrator<D: GpuDevice> {
    pub(super) device: D,
    shaders: Shaders,
    settings: RenderSettings,
    debug: DebugConfig,
    variants: VariantSelection,
    pub(super) attachments: AttachmentSet,
    globals: GlobalUniforms,
    binder: UniformBinder,
    pub(super) capture: CaptureService,
    scene: Option<SceneBindings>,
    resources_pending: bool,
    camera: Option<CameraState>,
    frustums: [Frustum; FRUSTUM_COUNT],
    visibility_dirty: bool,
}

impl<D: GpuDevice> FrameOrchestrator<D> {
    /// Selects formats and variants, allocates every target at `extent`.
    ///
    /// Fails when the device lacks a usable depth, shadow, Hi-Z or AO format.
    pub fn new(
        mut device: D,
        shaders: Shaders,
        extent: Extent2d,
        settings: RenderSettings,
        debug: DebugConfig,
    ) -> RenderResult<Self> {
        let settings = settings.validate();
        let features = device.info().features;
        let variants = select_variants(&VariantInputs::new(features, &settings));
        let config = AttachmentConfig {
            shadow_resolution: settings.shadow_resolution,
            hiz: features.contains(DeviceFeatures::MESH_SHADING),
        };
        let attachments = AttachmentSet::new(&mut device, extent, config)?;
        let globals = GlobalUniforms::new(&mut device)?;

        log::info!(
            "Frame orchestrator on {}: {:?} shadows, {:?} ambient, {:?} reflections",
            device.info().name,
            variants.shadow,
            variants.ambient,
            variants.reflections
        );

        let mut orchestrator = Self {
            device,
            shaders,
            settings,
            debug,
            variants,
            attachments,
            globals,
            binder: UniformBinder::new(),
            capture: CaptureService::new(),
            scene: None,
            resources_pending: false,
            camera: None,
            frustums: std::array::from_fn(|_| Frustum::empty()),
            visibility_dirty: true,
        };
        orchestrator.rebind()?;
        Ok(orchestrator)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn extent(&self) -> Extent2d {
        self.attachments.extent()
    }

    pub fn attachments(&self) -> &AttachmentSet {
        &self.attachments
    }

    pub fn bound_sets(&self) -> &BoundSets {
        self.binder.sets()
    }

    pub fn rebuild_count(&self) -> u64 {
        self.binder.rebuild_count()
    }

    pub fn variants(&self) -> VariantSelection {
        self.variants
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn debug(&self) -> DebugConfig {
        self.debug
    }

    pub fn set_debug(&mut self, debug: DebugConfig) {
        self.debug = debug;
    }

    pub fn frustums(&self) -> &[Frustum; FRUSTUM_COUNT] {
        &self.frustums
    }

    pub fn globals(&self) -> &GlobalUniforms {
        &self.globals
    }

    fn mesh_shading(&self) -> bool {
        self.device.info().features.contains(DeviceFeatures::MESH_SHADING)
    }

    /// Blocks until the device is idle, then reallocates the size-dependent
    /// targets and rebuilds bindings. Zero or unchanged sizes do nothing.
    pub fn resize(&mut self, width: u32, height: u32) -> RenderResult<()> {
        if self.attachments.resize(&mut self.device, width, height)? {
            self.visibility_dirty = true;
            self.rebind()?;
        }
        Ok(())
    }

    /// Settings-changed entry point. Re-selects variants and reallocates or
    /// rebinds only what the new settings actually change.
    pub fn apply_settings(&mut self, settings: RenderSettings) -> RenderResult<SettingsOutcome> {
        let settings = settings.validate();
        let features = self.device.info().features;
        let selection = select_variants(&VariantInputs::new(features, &settings));
        let changed = selection.changed_since(&self.variants);
        if !changed.is_empty() {
            log::info!(
                "Pipeline variants changed ({:?}): {:?} shadows, {:?} ambient, {:?} reflections",
                changed,
                selection.shadow,
                selection.ambient,
                selection.reflections
            );
        }

        let config = AttachmentConfig {
            shadow_resolution: settings.shadow_resolution,
            hiz: self.mesh_shading(),
        };
        let reallocated = self.attachments.reconfigure(&mut self.device, config)?;
        if reallocated {
            self.visibility_dirty = true;
        }

        self.settings = settings;
        self.variants = selection;
        let rebuilt = self.rebind()?;
        Ok(SettingsOutcome {
            changed,
            reallocated,
            rebuilt,
        })
    }

    /// The world was replaced or unloaded.
    pub fn on_world_changed(&mut self, world: Option<&mut dyn WorldView>) -> RenderResult<()> {
        self.scene = world.as_ref().map(|w| w.scene_bindings());
        self.binder.invalidate();
        self.visibility_dirty = true;
        self.rebind()?;
        if let Some(world) = world {
            self.bind_pending(world);
        }
        Ok(())
    }

    /// The world rebuilt its ray-tracing scene; bindless handles may differ.
    pub fn on_acceleration_structure_changed(&mut self, world: &mut dyn WorldView) -> RenderResult<()> {
        self.scene = Some(world.scene_bindings());
        self.binder.invalidate();
        self.rebind()?;
        self.bind_pending(world);
        Ok(())
    }

    /// Snapshots camera matrices; culling volumes are recomputed on the next
    /// frame only if the view or the shadow projections moved.
    pub fn update_camera(&mut self, camera: &dyn Camera, light_dir: Vec3) {
        let state = CameraState::capture(camera, light_dir);
        let moved = match &self.camera {
            None => true,
            Some(prev) => {
                !prev.view_proj.abs_diff_eq(state.view_proj, 1e-6)
                    || prev
                        .shadow
                        .iter()
                        .zip(&state.shadow)
                        .any(|(a, b)| !a.abs_diff_eq(*b, 1e-6))
            }
        };
        if moved {
            self.visibility_dirty = true;
        }
        self.camera = Some(state);
    }

    /// Records and queues one frame into `target`. Never blocks.
    pub fn draw(
        &mut self,
        target: ImageId,
        frame: u8,
        scene: Option<SceneInput<'_>>,
        overlays: &mut Overlays<'_>,
    ) -> RenderResult<()> {
        let cmd = self.record_frame(target, frame, scene, overlays)?;
        self.submit(cmd, None)
    }

    pub(super) fn submit(&mut self, cmd: CommandStream, fence: Option<&mut Fence>) -> RenderResult<()> {
        if self.debug.validate_transitions {
            cmd.validate()?;
        }
        self.device.submit(cmd, fence)
    }

    /// Tiles for the debug texture overlay; empty unless enabled.
    pub fn debug_tiles(&self) -> Vec<DebugTile> {
        if !self.debug.hiz_overlay {
            return Vec::new();
        }
        let targets = self.attachments.targets();
        let mut textures = Vec::new();
        if let Some(hiz) = &targets.hiz {
            textures.push((hiz.image, hiz.layout.base));
        }
        textures.extend(targets.shadow_maps.iter().map(|map| (map.image, map.extent)));
        debug_tile_layout(&textures)
    }

    fn rebind(&mut self) -> RenderResult<bool> {
        let inputs = BindingInputs {
            attachments: &self.attachments,
            variants: self.variants,
            globals: &self.globals,
            scene: self.scene.clone(),
        };
        if self.binder.is_current(&inputs) {
            return Ok(false);
        }
        self.device.wait_idle()?;
        self.binder.rebuild(&inputs);
        self.resources_pending = self.scene.is_some();
        Ok(true)
    }

    fn bind_pending(&mut self, world: &mut dyn WorldView) {
        if self.resources_pending {
            world.bind_frame_resources(&self.attachments.frame_resources());
            self.resources_pending = false;
        }
    }

    pub(super) fn record_frame(
        &mut self,
        target: ImageId,
        frame: u8,
        scene: Option<SceneInput<'_>>,
        overlays: &mut Overlays<'_>,
    ) -> RenderResult<CommandStream> {
        let mut cmd = CommandStream::new(frame);
        match scene {
            _ if overlays.video_active() => {
                cmd.set_framebuffer(Framebuffer::color(target, AttachmentOp::clear_color(BLANK)));
            }
            Some(SceneInput { world, camera }) => {
                world.update_light();
                let light = world.main_light();
                self.update_camera(camera, light.direction);
                self.scene = Some(world.scene_bindings());
                self.rebind()?;
                self.bind_pending(world);
                self.record_scene(&mut cmd, target, frame, world)?;
            }
            None => {
                log::debug!("No world or camera; drawing a blank frame");
                cmd.set_framebuffer(Framebuffer::color(target, AttachmentOp::clear_color(BLANK)));
            }
        }
        self.record_overlays(&mut cmd, target, overlays);
        Ok(cmd)
    }

    fn update_visibility(&mut self, world: &mut dyn WorldView, light_dir: Vec3, state: &CameraState) {
        if !self.visibility_dirty || !self.debug.refresh_visibility {
            return;
        }
        let targets = self.attachments.targets();
        for (layer, map) in targets.shadow_maps.iter().enumerate() {
            let frustum = &mut self.frustums[cascade_view(layer)];
            if cascades_visible(light_dir) {
                *frustum = Frustum::make(state.shadow[layer], map.extent.width, map.extent.height);
            } else {
                frustum.clear();
            }
        }
        if targets.shadow_maps.is_empty() {
            for frustum in &mut self.frustums[cascade_view(0)..] {
                frustum.clear();
            }
        }
        let extent = self.attachments.extent();
        self.frustums[MAIN_VIEW] = Frustum::make(state.view_proj, extent.width, extent.height);
        world.visibility_pass(&self.frustums);
        self.visibility_dirty = false;
    }

    fn record_scene(
        &mut self,
        cmd: &mut CommandStream,
        target: ImageId,
        frame: u8,
        world: &mut dyn WorldView,
    ) -> RenderResult<()> {
        let Some(state) = self.camera.clone() else {
            cmd.set_framebuffer(Framebuffer::color(target, AttachmentOp::clear_color(BLANK)));
            return Ok(());
        };
        let light = world.main_light();

        // 1. visibility
        self.update_visibility(world, light.direction, &state);

        // 2. per-frame globals
        world.pre_frame_update(frame);
        let exposure = world.auto_exposure();
        let ambient = world.ambient_light();
        let globals = SceneGlobalsUniform::new(
            &state,
            light.direction,
            light.color * light.intensity,
            ambient,
            exposure,
            frame,
        );
        self.globals.upload(&mut self.device, frame, &globals)?;

        let mesh_shading = self.mesh_shading();
        let shaders = &self.shaders;
        let sets = self.binder.sets();
        let targets = self.attachments.targets();
        let extent = self.attachments.extent();
        let zbuffer = targets.zbuffer.image;
        let scene_linear = targets.scene_linear.image;

        // 3. hi-z
        if let (Some(hiz), Some(pot)) = (&targets.hiz, &sets.hiz_pot) {
            let builder = HiZBuilder {
                layout: &hiz.layout,
                zbuffer,
                pot,
                mips: &sets.hiz_mips,
            };
            cmd.set_framebuffer(builder.occluder_framebuffer());
            cmd.set_debug_marker("HiZ-occluders");
            world.draw_hiz_occluders(cmd, frame);
            builder.record_reduction(cmd, shaders);
        }

        // 4. sky LUT
        cmd.set_debug_marker("Sky LUT");
        world.prepare_sky(cmd, frame);

        // 5. g-buffer
        let (diffuse_op, depth_op) = if mesh_shading {
            (AttachmentOp::clear_color(BLANK), AttachmentOp::Preserve)
        } else {
            (AttachmentOp::Discard, AttachmentOp::clear_depth(1.0))
        };
        cmd.set_framebuffer(
            Framebuffer::color(targets.gbuf_diffuse.image, diffuse_op)
                .with_color(targets.gbuf_normal.image, AttachmentOp::Discard)
                .with_depth(zbuffer, depth_op),
        );
        cmd.set_debug_marker("GBuffer");
        world.draw_gbuffer(cmd, frame);

        // 6. shadow cascades
        for (layer, map) in targets.shadow_maps.iter().enumerate() {
            cmd.set_framebuffer(Framebuffer::depth_only(map.image, AttachmentOp::clear_depth(0.0)));
            cmd.set_debug_marker(format!("ShadowMap #{}", layer));
            if cascades_visible(light.direction) {
                world.draw_shadow(cmd, frame, layer);
            }
        }

        // 7. ssao
        if let Some(ssao) = &sets.ssao {
            cmd.set_framebuffer(Framebuffer::none());
            cmd.set_debug_marker("SSAO");
            cmd.set_uniforms_with_push(shaders.get(ShaderKind::Ssao), ssao, &SsaoPush::new(state.view_proj_lwc));
            cmd.dispatch_threads(targets.ssao.extent.width, targets.ssao.extent.height);
        }

        // 8. fog and irradiance LUTs
        cmd.set_debug_marker("Fog LUTs");
        world.prepare_fog(cmd, frame);
        if let Some(irradiance) = &sets.irradiance {
            cmd.set_framebuffer(Framebuffer::none());
            cmd.set_debug_marker("Irradiance");
            cmd.set_uniforms(shaders.get(ShaderKind::Irradiance), irradiance);
            let lut = targets.irradiance_lut.extent;
            cmd.dispatch_threads(lut.width, lut.height);
        }

        // 9. direct sunlight
        cmd.set_framebuffer(
            Framebuffer::color(scene_linear, AttachmentOp::Discard).with_depth(zbuffer, AttachmentOp::Readonly),
        );
        if let Some(resolve) = sets.shadow_resolve.as_ref().filter(|_| self.debug.shadow_resolve) {
            cmd.set_debug_marker("DirectSunLight");
            cmd.set_uniforms(shaders.get(resolve.layout()), resolve);
            cmd.draw_fullscreen();
        }

        // 10. ambient, point lights, sky
        if let Some(ambient_set) = &sets.ambient_compose {
            cmd.set_debug_marker("AmbientLight");
            let push = AmbientPush::new(ambient, exposure, light.direction, state.clip_info);
            cmd.set_uniforms_with_push(shaders.get(ambient_set.layout()), ambient_set, &push);
            cmd.draw_fullscreen();
        }
        cmd.set_debug_marker("Point lights");
        world.draw_lights(cmd, frame);
        cmd.set_debug_marker("Sky");
        world.draw_sky(cmd, frame);

        // 11. stash opaque colour and depth
        if let Some(stash) = &sets.stash {
            cmd.set_framebuffer(
                Framebuffer::color(targets.scene_opaque.image, AttachmentOp::Discard)
                    .with_color(targets.scene_depth.image, AttachmentOp::Discard),
            );
            cmd.set_debug_marker("Stash");
            cmd.set_uniforms(shaders.get(ShaderKind::Stash), stash);
            cmd.draw_fullscreen();
        }

        // 12. water, sun and moon, translucent
        cmd.set_framebuffer(
            Framebuffer::color(scene_linear, AttachmentOp::Preserve)
                .with_color(targets.gbuf_diffuse.image, AttachmentOp::clear_color(BLANK))
                .with_color(targets.gbuf_normal.image, AttachmentOp::Preserve)
                .with_depth(zbuffer, AttachmentOp::Preserve),
        );
        cmd.set_debug_marker("Water");
        world.draw_water(cmd, frame);

        cmd.set_framebuffer(
            Framebuffer::color(scene_linear, AttachmentOp::Preserve).with_depth(zbuffer, AttachmentOp::Readonly),
        );
        cmd.set_debug_marker("Sun&Moon");
        world.draw_sun_moon(cmd, frame);
        cmd.set_debug_marker("Translucent");
        world.draw_translucent(cmd, frame);

        // 13. reflections
        cmd.set_framebuffer(Framebuffer::color(scene_linear, AttachmentOp::Preserve));
        if let Some(water) = &sets.water_reflection {
            cmd.set_debug_marker("Reflections");
            cmd.set_uniforms(shaders.get(water.layout()), water);
            if mesh_shading {
                cmd.dispatch_mesh_threads(extent.width, extent.height);
            } else {
                cmd.draw_fullscreen();
            }
        }

        // 14. exactly one of underwater or fog
        if state.in_water {
            cmd.set_debug_marker("Underwater");
            if let Some(underwater) = &sets.underwater {
                cmd.set_uniforms(shaders.get(ShaderKind::UnderwaterTop), underwater);
                cmd.draw_fullscreen();
                cmd.set_uniforms(shaders.get(ShaderKind::UnderwaterSurface), underwater);
                cmd.draw_fullscreen();
            }
        } else {
            cmd.set_debug_marker("Fog");
            world.draw_fog(cmd, frame);
        }

        // 15. tonemapping
        cmd.set_framebuffer(Framebuffer::color(target, AttachmentOp::Discard));
        cmd.set_debug_marker("Tonemapping");
        if let Some(tonemapping) = &sets.tonemapping {
            let push = TonemappingPush::new(&self.settings, exposure);
            cmd.set_uniforms_with_push(shaders.get(ShaderKind::Tonemapping), tonemapping, &push);
            cmd.draw_fullscreen();
        }
        Ok(())
    }

    fn record_overlays(&self, cmd: &mut CommandStream, target: ImageId, overlays: &mut Overlays<'_>) {
        if let Some(ui) = overlays.ui.as_deref_mut() {
            cmd.set_framebuffer(Framebuffer::color(target, AttachmentOp::Preserve));
            cmd.set_debug_marker("UI");
            ui.draw(cmd, &self.debug_tiles());
        }

        if let Some(inventory) = overlays.inventory.as_deref_mut() {
            if inventory.is_open() {
                let zbuffer = self.attachments.targets().zbuffer.image;
                cmd.set_framebuffer(
                    Framebuffer::color(target, AttachmentOp::Preserve)
                        .with_depth(zbuffer, AttachmentOp::clear_depth(1.0)),
                );
                cmd.set_debug_marker("Inventory");
                inventory.draw(cmd);

                cmd.set_framebuffer(Framebuffer::color(target, AttachmentOp::Preserve));
                cmd.set_debug_marker("Inventory-counters");
                inventory.draw_counters(cmd);
            }
        }
    }
}
