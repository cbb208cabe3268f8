// renderer/hiz.rs

use std::sync::Arc;

use crate::renderer::bindings::DescriptorSet;
use crate::renderer::commands::{AttachmentOp, CommandStream, Framebuffer};
use crate::renderer::device::{Extent2d, ImageId};
use crate::renderer::shaders::{ShaderKind, Shaders};

/// Both base-level dimensions end up at or below this.
pub const HIZ_BASE_LIMIT: u32 = 64;

/// Size of the shadow-frustum pyramid, when it exists.
pub const SHADOW_HIZ_SIZE: u32 = 64;

pub fn next_pot(x: u32) -> u32 {
    x.max(1).next_power_of_two()
}

/// Pads to powers of two, then halves until both sides fit the limit.
pub fn base_extent(width: u32, height: u32) -> Extent2d {
    let mut w = next_pot(width);
    let mut h = next_pot(height);
    while w > HIZ_BASE_LIMIT || h > HIZ_BASE_LIMIT {
        w = (w / 2).max(1);
        h = (h / 2).max(1);
    }
    Extent2d::new(w, h)
}

/// Levels below `base`, each halved (floor, min 1), ending at 1×1.
pub fn mip_chain(base: Extent2d) -> Vec<Extent2d> {
    let mut levels = Vec::new();
    let (mut w, mut h) = (base.width, base.height);
    while w > 1 || h > 1 {
        w = (w / 2).max(1);
        h = (h / 2).max(1);
        levels.push(Extent2d::new(w, h));
    }
    levels
}

/// Occlusion pyramid for the shadow frustum, reprojected from scene depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShadowOcclusion {
    /// Mesh-shading culling or shadows are off.
    Disabled,
    /// Would need a 64×64 pyramid reprojected into light space; not built.
    NotImplemented { extent: Extent2d },
}

impl ShadowOcclusion {
    pub fn for_config(mesh_shading: bool, shadow_resolution: u32) -> Self {
        if mesh_shading && shadow_resolution > 0 {
            ShadowOcclusion::NotImplemented {
                extent: Extent2d::new(SHADOW_HIZ_SIZE, SHADOW_HIZ_SIZE),
            }
        } else {
            ShadowOcclusion::Disabled
        }
    }
}

/// Layout of one pyramid image: the base level plus its mip chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HiZLayout {
    pub base: Extent2d,
    pub mips: Vec<Extent2d>,
}

impl HiZLayout {
    pub fn for_viewport(width: u32, height: u32) -> Self {
        let base = base_extent(width, height);
        Self {
            base,
            mips: mip_chain(base),
        }
    }

    pub fn level_count(&self) -> u32 {
        self.mips.len() as u32 + 1
    }
}

/// Records the pyramid build: occluder depth from the world, the padded
/// base reduction, then one dispatch per mip.
pub struct HiZBuilder<'a> {
    pub layout: &'a HiZLayout,
    pub zbuffer: ImageId,
    pub pot: &'a Arc<DescriptorSet>,
    pub mips: &'a [Arc<DescriptorSet>],
}

impl HiZBuilder<'_> {
    pub fn record_reduction(&self, cmd: &mut CommandStream, shaders: &Shaders) {
        cmd.set_debug_marker("HiZ-mip");
        cmd.set_framebuffer(Framebuffer::none());
        cmd.set_uniforms(shaders.get(ShaderKind::HiZPot), self.pot);
        cmd.dispatch(self.layout.base.width, self.layout.base.height, 1);

        let mip_pipeline = shaders.get(ShaderKind::HiZMip);
        for (set, extent) in self.mips.iter().zip(&self.layout.mips) {
            cmd.set_uniforms(mip_pipeline, set);
            cmd.dispatch_threads(extent.width, extent.height);
        }
    }

    pub fn occluder_framebuffer(&self) -> Framebuffer {
        Framebuffer::depth_only(self.zbuffer, AttachmentOp::clear_depth(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_pot_rounds_up() {
        assert_eq!(next_pot(0), 1);
        assert_eq!(next_pot(1), 1);
        assert_eq!(next_pot(3), 4);
        assert_eq!(next_pot(64), 64);
        assert_eq!(next_pot(1080), 2048);
    }

    #[test]
    fn base_level_fits_limit_and_preserves_aspect_steps() {
        assert_eq!(base_extent(1920, 1080), Extent2d::new(64, 64));
        assert_eq!(base_extent(1280, 500), Extent2d::new(64, 16));
        assert_eq!(base_extent(800, 600), Extent2d::new(64, 64));
        assert_eq!(base_extent(40, 20), Extent2d::new(64, 32));
        assert_eq!(base_extent(4096, 16), Extent2d::new(64, 1));
        assert_eq!(base_extent(1, 1), Extent2d::new(1, 1));
    }

    #[test]
    fn mip_chain_halves_and_terminates_at_one() {
        for (w, h) in [
            (1920, 1080),
            (1280, 720),
            (7, 3),
            (1, 1),
            (4096, 16),
            (16, 4096),
            (333, 777),
        ] {
            let base = base_extent(w, h);
            assert!(base.width <= HIZ_BASE_LIMIT && base.height <= HIZ_BASE_LIMIT);

            let chain = mip_chain(base);
            let mut prev = base;
            for level in &chain {
                assert_eq!(level.width, (prev.width / 2).max(1));
                assert_eq!(level.height, (prev.height / 2).max(1));
                prev = *level;
            }
            if base == Extent2d::new(1, 1) {
                assert!(chain.is_empty());
            } else {
                assert_eq!(chain.last(), Some(&Extent2d::new(1, 1)));
                assert_eq!(
                    chain.iter().filter(|e| **e == Extent2d::new(1, 1)).count(),
                    1
                );
            }
        }
    }

    #[test]
    fn layout_counts_base_plus_mips() {
        let layout = HiZLayout::for_viewport(1280, 500);
        // 64x16 -> 32x8 -> 16x4 -> 8x2 -> 4x1 -> 2x1 -> 1x1
        assert_eq!(layout.base, Extent2d::new(64, 16));
        assert_eq!(layout.mips.len(), 6);
        assert_eq!(layout.level_count(), 7);
    }

    #[test]
    fn shadow_occlusion_is_explicitly_unimplemented() {
        assert_eq!(ShadowOcclusion::for_config(false, 2048), ShadowOcclusion::Disabled);
        assert_eq!(ShadowOcclusion::for_config(true, 0), ShadowOcclusion::Disabled);
        assert_eq!(
            ShadowOcclusion::for_config(true, 1024),
            ShadowOcclusion::NotImplemented {
                extent: Extent2d::new(64, 64)
            }
        );
    }
}
