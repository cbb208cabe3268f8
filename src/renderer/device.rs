use std::path::Path;
use std::time::Duration;

use bitflags::bitflags;

use crate::renderer::commands::CommandStream;
use crate::renderer::error::{RenderError, RenderResult};
use crate::renderer::format::{FormatSupport, TextureFormat};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

/// Ray-tracing top-level acceleration structure owned by the world view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AccelId(pub u32);

/// A bindless resource array (textures or buffers) owned by the world view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindlessId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Extent2d {
    pub width: u32,
    pub height: u32,
}

impl Extent2d {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const ATTACHMENT = 1 << 0;
        const SAMPLED    = 1 << 1;
        const STORAGE    = 1 << 2;
        const COPY_SRC   = 1 << 3;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub label: &'static str,
    pub format: TextureFormat,
    pub extent: Extent2d,
    pub mip_levels: u32,
    pub usage: ImageUsage,
}

impl ImageDesc {
    pub fn attachment(label: &'static str, format: TextureFormat, extent: Extent2d) -> Self {
        Self {
            label,
            format,
            extent,
            mip_levels: 1,
            usage: ImageUsage::ATTACHMENT | ImageUsage::SAMPLED,
        }
    }

    pub fn storage(label: &'static str, format: TextureFormat, extent: Extent2d, mips: u32) -> Self {
        Self {
            label,
            format,
            extent,
            mip_levels: mips.max(1),
            usage: ImageUsage::STORAGE | ImageUsage::SAMPLED,
        }
    }
}

bitflags! {
    /// Optional device capabilities that gate shading strategies.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DeviceFeatures: u32 {
        const RAY_QUERY            = 1 << 0;
        const BINDLESS_NON_UNIFORM = 1 << 1;
        const MESH_SHADING         = 1 << 2;
    }
}

#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub features: DeviceFeatures,
}

/// Position of a submission on the GPU timeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubmissionIndex(pub u64);

/// Host-side synchronisation primitive signalled when a submission retires.
#[derive(Debug, Default)]
pub struct Fence {
    pending: Option<SubmissionIndex>,
}

impl Fence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, submission: SubmissionIndex) {
        self.pending = Some(submission);
    }

    pub fn pending(&self) -> Option<SubmissionIndex> {
        self.pending
    }

    pub fn signal(&mut self) {
        self.pending = None;
    }

    pub fn is_signaled(&self) -> bool {
        self.pending.is_none()
    }
}

/// Tightly packed pixels read back from an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pixmap {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub data: Vec<u8>,
}

impl Pixmap {
    /// FNV-1a over the pixel bytes.
    pub fn checksum(&self) -> u64 {
        self.data.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
            (hash ^ u64::from(*byte)).wrapping_mul(0x0000_0100_0000_01b3)
        })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> RenderResult<()> {
        let rgba = match self.format {
            TextureFormat::Rgba8 => self.data.clone(),
            TextureFormat::Bgra8 => self
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[2], px[1], px[0], px[3]])
                .collect(),
            other => {
                return Err(RenderError::readback(format!(
                    "cannot encode {} pixels",
                    other.name()
                )))
            }
        };
        let image = image::RgbaImage::from_raw(self.width, self.height, rgba)
            .ok_or_else(|| RenderError::readback("pixel buffer does not match its extent"))?;
        image
            .save(path.as_ref())
            .map_err(|err| RenderError::readback(err))?;
        log::info!("Saved {}x{} capture to {:?}", self.width, self.height, path.as_ref());
        Ok(())
    }
}

/// The GPU as seen by the orchestrator: resources, submission and fences.
///
/// Every method is called from the single control thread. Submissions run
/// asynchronously; only [`GpuDevice::wait_fence`] and [`GpuDevice::wait_idle`]
/// block.
pub trait GpuDevice {
    fn info(&self) -> &DeviceInfo;

    fn format_support(&self, format: TextureFormat) -> FormatSupport;

    fn create_image(&mut self, desc: &ImageDesc) -> RenderResult<ImageId>;

    /// Fails with [`RenderError::ResourceInFlight`] when queued work still
    /// references the image.
    fn destroy_image(&mut self, image: ImageId) -> RenderResult<()>;

    fn image_extent(&self, image: ImageId) -> Option<Extent2d>;

    fn create_buffer(&mut self, label: &'static str, size: u64) -> RenderResult<BufferId>;

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> RenderResult<()>;

    /// Queues `commands`; arms `fence` with the resulting submission.
    fn submit(&mut self, commands: CommandStream, fence: Option<&mut Fence>) -> RenderResult<()>;

    fn wait_fence(&mut self, fence: &mut Fence, timeout: Option<Duration>) -> RenderResult<()>;

    fn wait_idle(&mut self) -> RenderResult<()>;

    fn read_pixels(&mut self, image: ImageId) -> RenderResult<Pixmap>;
}
