// renderer/attachments.rs
// The whole set is recreated at once; descriptor sets key off generation().

use crate::renderer::device::{Extent2d, GpuDevice, ImageDesc, ImageId};
use crate::renderer::error::RenderResult;
use crate::renderer::format::{AttachmentFormats, TextureFormat};
use crate::renderer::hiz::{HiZLayout, ShadowOcclusion};
use crate::renderer::world::FrameResources;
use crate::renderer::CASCADE_COUNT;

pub const SCENE_COLOR_FORMAT: TextureFormat = TextureFormat::R11G11B10UF;
pub const SCENE_DEPTH_COPY_FORMAT: TextureFormat = TextureFormat::R32F;
pub const GBUF_DIFFUSE_FORMAT: TextureFormat = TextureFormat::Rgba8;
pub const GBUF_NORMAL_FORMAT: TextureFormat = TextureFormat::R11G11B10UF;
pub const IRRADIANCE_FORMAT: TextureFormat = TextureFormat::Rgba32F;
pub const IRRADIANCE_EXTENT: Extent2d = Extent2d::new(3, 2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub image: ImageId,
    pub format: TextureFormat,
    pub extent: Extent2d,
    pub mip_levels: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HiZPyramid {
    pub image: ImageId,
    pub format: TextureFormat,
    pub layout: HiZLayout,
    pub shadow: ShadowOcclusion,
}

/// Settings-derived inputs that change what gets allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentConfig {
    /// 0 disables the shadow cascades.
    pub shadow_resolution: u32,
    /// Mesh-shading occlusion culling, which needs the Hi-Z pyramid.
    pub hiz: bool,
}

#[derive(Clone, Debug)]
pub struct Targets {
    pub scene_linear: Attachment,
    pub zbuffer: Attachment,
    pub scene_opaque: Attachment,
    pub scene_depth: Attachment,
    pub gbuf_diffuse: Attachment,
    pub gbuf_normal: Attachment,
    pub ssao: Attachment,
    pub irradiance_lut: Attachment,
    pub shadow_maps: Vec<Attachment>,
    pub hiz: Option<HiZPyramid>,
}

impl Targets {
    fn images(&self) -> Vec<ImageId> {
        let mut images = vec![
            self.scene_linear.image,
            self.zbuffer.image,
            self.scene_opaque.image,
            self.scene_depth.image,
            self.gbuf_diffuse.image,
            self.gbuf_normal.image,
            self.ssao.image,
            self.irradiance_lut.image,
        ];
        images.extend(self.shadow_maps.iter().map(|a| a.image));
        images.extend(self.hiz.as_ref().map(|h| h.image));
        images
    }
}

pub struct AttachmentSet {
    formats: AttachmentFormats,
    config: AttachmentConfig,
    extent: Extent2d,
    generation: u64,
    targets: Targets,
}

impl AttachmentSet {
    /// Picks formats and allocates the first generation.
    ///
    /// Fails when any preference list has no supported format.
    pub fn new(
        device: &mut dyn GpuDevice,
        extent: Extent2d,
        config: AttachmentConfig,
    ) -> RenderResult<Self> {
        let formats = AttachmentFormats::select(|format| device.format_support(format))?;
        log::info!(
            "Attachment formats: depth {}, shadow {}, hi-z {}, ao {}",
            formats.scene_depth.name(),
            formats.shadow_depth.name(),
            formats.hiz.name(),
            formats.ao.name()
        );
        let extent = Extent2d::new(extent.width.max(1), extent.height.max(1));
        let targets = allocate(device, &formats, extent, &config)?;
        Ok(Self {
            formats,
            config,
            extent,
            generation: 0,
            targets,
        })
    }

    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn formats(&self) -> &AttachmentFormats {
        &self.formats
    }

    pub fn config(&self) -> AttachmentConfig {
        self.config
    }

    pub fn targets(&self) -> &Targets {
        &self.targets
    }

    /// Returns whether anything was reallocated. Zero-sized requests
    /// (minimised window) and same-size requests leave the set untouched.
    pub fn resize(&mut self, device: &mut dyn GpuDevice, width: u32, height: u32) -> RenderResult<bool> {
        if width == 0 || height == 0 {
            log::info!("Ignoring resize to {}x{}", width, height);
            return Ok(false);
        }
        let extent = Extent2d::new(width, height);
        if extent == self.extent {
            return Ok(false);
        }
        self.rebuild(device, extent, self.config)?;
        Ok(true)
    }

    /// Reallocates when the shadow resolution or culling mode changed.
    pub fn reconfigure(&mut self, device: &mut dyn GpuDevice, config: AttachmentConfig) -> RenderResult<bool> {
        if config == self.config {
            return Ok(false);
        }
        self.rebuild(device, self.extent, config)?;
        Ok(true)
    }

    /// Allocates the next generation before releasing the current one, so a
    /// failed allocation leaves the set exactly as it was.
    fn rebuild(
        &mut self,
        device: &mut dyn GpuDevice,
        extent: Extent2d,
        config: AttachmentConfig,
    ) -> RenderResult<()> {
        device.wait_idle()?;
        let targets = allocate(device, &self.formats, extent, &config)?;
        let previous = std::mem::replace(&mut self.targets, targets);
        self.extent = extent;
        self.config = config;
        self.generation += 1;
        log::debug!(
            "Attachments rebuilt: {}x{}, shadow {}, hi-z {} (generation {})",
            extent.width,
            extent.height,
            config.shadow_resolution,
            config.hiz,
            self.generation
        );
        for image in previous.images() {
            device.destroy_image(image)?;
        }
        Ok(())
    }

    /// Every attachment whose size follows the swapchain.
    pub fn size_dependent(&self) -> [&Attachment; 7] {
        let t = &self.targets;
        [
            &t.scene_linear,
            &t.zbuffer,
            &t.scene_opaque,
            &t.scene_depth,
            &t.gbuf_diffuse,
            &t.gbuf_normal,
            &t.ssao,
        ]
    }

    pub fn frame_resources(&self) -> FrameResources {
        let t = &self.targets;
        FrameResources {
            gbuf_diffuse: t.gbuf_diffuse.image,
            gbuf_normal: t.gbuf_normal.image,
            zbuffer: t.zbuffer.image,
            scene_opaque: t.scene_opaque.image,
            scene_depth: t.scene_depth.image,
            shadow_maps: t.shadow_maps.iter().map(|a| a.image).collect(),
            hiz: t.hiz.as_ref().map(|h| h.image),
        }
    }

    /// Releases every image. The set must not be used afterwards.
    pub fn destroy(&mut self, device: &mut dyn GpuDevice) -> RenderResult<()> {
        device.wait_idle()?;
        for image in self.targets.images() {
            device.destroy_image(image)?;
        }
        Ok(())
    }
}

fn create(device: &mut dyn GpuDevice, created: &mut Vec<ImageId>, desc: ImageDesc) -> RenderResult<Attachment> {
    let image = device.create_image(&desc)?;
    created.push(image);
    Ok(Attachment {
        image,
        format: desc.format,
        extent: desc.extent,
        mip_levels: desc.mip_levels,
    })
}

/// Allocates a full set of targets. On failure every image created so far
/// is released again.
fn allocate(
    device: &mut dyn GpuDevice,
    formats: &AttachmentFormats,
    extent: Extent2d,
    config: &AttachmentConfig,
) -> RenderResult<Targets> {
    let mut created = Vec::new();
    let result = allocate_targets(device, &mut created, formats, extent, config);
    if let Err(err) = &result {
        log::warn!("Attachment allocation failed, releasing {} images: {}", created.len(), err);
        for image in created {
            if let Err(err) = device.destroy_image(image) {
                log::warn!("Could not release {:?}: {}", image, err);
            }
        }
    }
    result
}

fn allocate_targets(
    device: &mut dyn GpuDevice,
    created: &mut Vec<ImageId>,
    formats: &AttachmentFormats,
    extent: Extent2d,
    config: &AttachmentConfig,
) -> RenderResult<Targets> {
    let scene_linear = create(device, created, ImageDesc::attachment("scene_linear", SCENE_COLOR_FORMAT, extent))?;
    let zbuffer = create(device, created, ImageDesc::attachment("zbuffer", formats.scene_depth, extent))?;
    let scene_opaque = create(device, created, ImageDesc::attachment("scene_opaque", SCENE_COLOR_FORMAT, extent))?;
    let scene_depth = create(
        device,
        created,
        ImageDesc::attachment("scene_depth", SCENE_DEPTH_COPY_FORMAT, extent),
    )?;
    let gbuf_diffuse = create(device, created, ImageDesc::attachment("gbuf_diffuse", GBUF_DIFFUSE_FORMAT, extent))?;
    let gbuf_normal = create(device, created, ImageDesc::attachment("gbuf_normal", GBUF_NORMAL_FORMAT, extent))?;
    let ssao = create(device, created, ImageDesc::storage("ssao", formats.ao, extent, 1))?;
    let irradiance_lut = create(
        device,
        created,
        ImageDesc::storage("irradiance_lut", IRRADIANCE_FORMAT, IRRADIANCE_EXTENT, 1),
    )?;

    let mut shadow_maps = Vec::new();
    if config.shadow_resolution > 0 {
        let res = config.shadow_resolution;
        for _ in 0..CASCADE_COUNT {
            shadow_maps.push(create(
                device,
                created,
                ImageDesc::attachment("shadow_map", formats.shadow_depth, Extent2d::new(res, res)),
            )?);
        }
    }

    let hiz = if config.hiz {
        let layout = HiZLayout::for_viewport(extent.width, extent.height);
        let desc = ImageDesc::storage("hiz", formats.hiz, layout.base, layout.level_count());
        let image = create(device, created, desc)?.image;
        Some(HiZPyramid {
            image,
            format: formats.hiz,
            layout,
            shadow: ShadowOcclusion::for_config(config.hiz, config.shadow_resolution),
        })
    } else {
        None
    };

    Ok(Targets {
        scene_linear,
        zbuffer,
        scene_opaque,
        scene_depth,
        gbuf_diffuse,
        gbuf_normal,
        ssao,
        irradiance_lut,
        shadow_maps,
        hiz,
    })
}
