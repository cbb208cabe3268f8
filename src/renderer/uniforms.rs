// renderer/uniforms.rs
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::renderer::bindings::Binding;
use crate::renderer::device::{BufferId, GpuDevice};
use crate::renderer::error::RenderResult;
use crate::renderer::world::CameraState;
use crate::renderer::{CASCADE_COUNT, FRAMES_IN_FLIGHT};
use crate::settings::RenderSettings;

/// Uniform buffer offsets must be multiples of this on every backend we target.
const UNIFORM_SLOT_ALIGNMENT: u64 = 256;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct SceneGlobalsUniform {
    pub view_proj: [[f32; 4]; 4],
    pub inverse_view_proj: [[f32; 4]; 4],
    pub view_proj_lwc: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub shadow_view_proj: [[[f32; 4]; 4]; CASCADE_COUNT],
    pub light_dir: [f32; 4],
    pub light_color: [f32; 4],
    /// xyz ambient, w exposure.
    pub ambient: [f32; 4],
    /// xyz clip info, w frame id.
    pub clip_info: [f32; 4],
}

impl SceneGlobalsUniform {
    pub fn new(
        camera: &CameraState,
        light_dir: Vec3,
        light_color: Vec3,
        ambient: Vec3,
        exposure: f32,
        frame: u8,
    ) -> Self {
        let mut shadow_view_proj = [[[0.0; 4]; 4]; CASCADE_COUNT];
        for (dst, src) in shadow_view_proj.iter_mut().zip(&camera.shadow) {
            *dst = src.to_cols_array_2d();
        }
        Self {
            view_proj: camera.view_proj.to_cols_array_2d(),
            inverse_view_proj: camera.view_proj.inverse().to_cols_array_2d(),
            view_proj_lwc: camera.view_proj_lwc.to_cols_array_2d(),
            projection: camera.projection.to_cols_array_2d(),
            shadow_view_proj,
            light_dir: light_dir.extend(0.0).to_array(),
            light_color: light_color.extend(1.0).to_array(),
            ambient: ambient.extend(exposure).to_array(),
            clip_info: camera.clip_info.extend(f32::from(frame)).to_array(),
        }
    }
}

/// One uniform buffer holding a [`SceneGlobalsUniform`] per frame in flight.
///
/// Frame `n` writes slot `n % FRAMES_IN_FLIGHT`, so the upload for frame `n`
/// never lands in the slot frame `n - 1` is still reading.
#[derive(Debug)]
pub struct GlobalUniforms {
    buffer: BufferId,
    slot_size: u64,
}

impl GlobalUniforms {
    pub fn new(device: &mut dyn GpuDevice) -> RenderResult<Self> {
        let slot_size = Self::slot_size();
        let buffer = device.create_buffer("SceneGlobals", slot_size * FRAMES_IN_FLIGHT as u64)?;
        Ok(Self { buffer, slot_size })
    }

    pub fn slot_size() -> u64 {
        let raw = std::mem::size_of::<SceneGlobalsUniform>() as u64;
        raw.div_ceil(UNIFORM_SLOT_ALIGNMENT) * UNIFORM_SLOT_ALIGNMENT
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn slot_offset(&self, frame: u8) -> u64 {
        (frame as usize % FRAMES_IN_FLIGHT) as u64 * self.slot_size
    }

    pub fn upload(
        &self,
        device: &mut dyn GpuDevice,
        frame: u8,
        globals: &SceneGlobalsUniform,
    ) -> RenderResult<()> {
        device.write_buffer(self.buffer, self.slot_offset(frame), bytemuck::bytes_of(globals))
    }

    pub fn binding(&self) -> Binding {
        Binding::FrameUniform {
            buffer: self.buffer,
            slot_size: self.slot_size,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct TonemappingPush {
    pub exposure: f32,
    pub brightness: f32,
    pub contrast: f32,
    pub gamma: f32,
}

impl TonemappingPush {
    pub fn new(settings: &RenderSettings, exposure: f32) -> Self {
        Self {
            exposure,
            brightness: (settings.brightness - 0.5) * 0.1,
            contrast: (1.5 - settings.contrast).max(0.01),
            gamma: (1.0 / 2.2) / (2.0 * settings.gamma).max(0.01),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct AmbientPush {
    pub ambient: [f32; 3],
    pub exposure: f32,
    pub light_dir: [f32; 3],
    pub _padding0: f32,
    pub clip_info: [f32; 3],
    pub _padding1: f32,
}

impl AmbientPush {
    pub fn new(ambient: Vec3, exposure: f32, light_dir: Vec3, clip_info: Vec3) -> Self {
        Self {
            ambient: ambient.to_array(),
            exposure,
            light_dir: light_dir.to_array(),
            _padding0: 0.0,
            clip_info: clip_info.to_array(),
            _padding1: 0.0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct SsaoPush {
    pub mvp: [[f32; 4]; 4],
    pub mvp_inverse: [[f32; 4]; 4],
}

impl SsaoPush {
    pub fn new(view_proj_lwc: Mat4) -> Self {
        Self {
            mvp: view_proj_lwc.to_cols_array_2d(),
            mvp_inverse: view_proj_lwc.inverse().to_cols_array_2d(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_blocks_have_shader_sizes() {
        assert_eq!(std::mem::size_of::<TonemappingPush>(), 16);
        // vec3+f32 three times
        assert_eq!(std::mem::size_of::<AmbientPush>(), 48);
        assert_eq!(std::mem::size_of::<SsaoPush>(), 128);
    }

    #[test]
    fn global_slots_are_aligned_and_large_enough() {
        let slot = GlobalUniforms::slot_size();
        assert_eq!(slot % UNIFORM_SLOT_ALIGNMENT, 0);
        assert!(slot >= std::mem::size_of::<SceneGlobalsUniform>() as u64);
    }

    #[test]
    fn tonemapping_defaults_map_to_neutral_curve() {
        let settings = RenderSettings::default();
        let push = TonemappingPush::new(&settings, 1.0);
        assert_eq!(push.brightness, 0.0);
        assert!((push.contrast - 1.0).abs() < 1e-6);
        assert!((push.gamma - 1.0 / 2.2).abs() < 1e-6);
    }

    #[test]
    fn tonemapping_clamps_degenerate_inputs() {
        let settings = RenderSettings {
            brightness: 1.0,
            contrast: 2.0,
            gamma: 0.0,
            ..RenderSettings::default()
        };
        let push = TonemappingPush::new(&settings, 0.5);
        assert!((push.brightness - 0.05).abs() < 1e-6);
        assert_eq!(push.contrast, 0.01);
        assert!((push.gamma - (1.0 / 2.2) / 0.01).abs() < 1e-3);
        assert_eq!(push.exposure, 0.5);
    }

    #[test]
    fn ssao_push_carries_inverse() {
        let m = Mat4::from_scale(Vec3::new(2.0, 4.0, 8.0));
        let push = SsaoPush::new(m);
        let inv = Mat4::from_cols_array_2d(&push.mvp_inverse);
        assert!((inv * m).abs_diff_eq(Mat4::IDENTITY, 1e-6));
    }
}
