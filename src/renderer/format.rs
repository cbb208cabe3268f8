use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::renderer::error::RenderError;

/// Closed set of image formats the orchestrator allocates or presents into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    R8,
    R16,
    R32F,
    Rgba8,
    Bgra8,
    Rgba16,
    Rgba32F,
    R11G11B10UF,
    Depth16,
    Depth24x8,
    Depth32F,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            TextureFormat::Depth16 | TextureFormat::Depth24x8 | TextureFormat::Depth32F
        )
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::R8 => 1,
            TextureFormat::R16 | TextureFormat::Depth16 => 2,
            TextureFormat::R32F
            | TextureFormat::Rgba8
            | TextureFormat::Bgra8
            | TextureFormat::R11G11B10UF
            | TextureFormat::Depth24x8
            | TextureFormat::Depth32F => 4,
            TextureFormat::Rgba16 => 8,
            TextureFormat::Rgba32F => 16,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TextureFormat::R8 => "R8",
            TextureFormat::R16 => "R16",
            TextureFormat::R32F => "R32F",
            TextureFormat::Rgba8 => "RGBA8",
            TextureFormat::Bgra8 => "BGRA8",
            TextureFormat::Rgba16 => "RGBA16",
            TextureFormat::Rgba32F => "RGBA32F",
            TextureFormat::R11G11B10UF => "R11G11B10UF",
            TextureFormat::Depth16 => "Depth16",
            TextureFormat::Depth24x8 => "Depth24x8",
            TextureFormat::Depth32F => "Depth32F",
        }
    }
}

bitflags! {
    /// What the device can do with a format.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FormatSupport: u32 {
        const ATTACHMENT = 1 << 0;
        const SAMPLED    = 1 << 1;
        const STORAGE    = 1 << 2;
    }
}

/// Main depth buffer candidates, precision first.
pub const SCENE_DEPTH_FORMATS: [TextureFormat; 3] = [
    TextureFormat::Depth32F,
    TextureFormat::Depth24x8,
    TextureFormat::Depth16,
];

/// Shadow map candidates, compactness first.
pub const SHADOW_DEPTH_FORMATS: [TextureFormat; 3] = [
    TextureFormat::Depth16,
    TextureFormat::Depth24x8,
    TextureFormat::Depth32F,
];

pub const HIZ_FORMATS: [TextureFormat; 2] = [TextureFormat::R16, TextureFormat::R32F];

pub const AO_FORMATS: [TextureFormat; 3] =
    [TextureFormat::R8, TextureFormat::R16, TextureFormat::R32F];

pub const DEPTH_USAGE: FormatSupport = FormatSupport::ATTACHMENT.union(FormatSupport::SAMPLED);
pub const COMPUTE_USAGE: FormatSupport = FormatSupport::SAMPLED.union(FormatSupport::STORAGE);

/// Scans `candidates` in order and returns the first format whose support
/// covers `required`.
pub fn pick_format(
    role: &'static str,
    candidates: &[TextureFormat],
    required: FormatSupport,
    support: impl Fn(TextureFormat) -> FormatSupport,
) -> Result<TextureFormat, RenderError> {
    candidates
        .iter()
        .copied()
        .find(|&format| support(format).contains(required))
        .ok_or_else(|| RenderError::UnsupportedFormat {
            role,
            required: describe(required),
            candidates: candidates.to_vec(),
        })
}

fn describe(required: FormatSupport) -> &'static str {
    if required == DEPTH_USAGE {
        "depth rendering and sampling"
    } else if required == COMPUTE_USAGE {
        "sampling and storage writes"
    } else {
        "the requested usage"
    }
}

/// Formats chosen once per device, reused by every rebuild.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentFormats {
    pub scene_depth: TextureFormat,
    pub shadow_depth: TextureFormat,
    pub hiz: TextureFormat,
    pub ao: TextureFormat,
}

impl AttachmentFormats {
    pub fn select(support: impl Fn(TextureFormat) -> FormatSupport) -> Result<Self, RenderError> {
        Ok(Self {
            scene_depth: pick_format("scene depth", &SCENE_DEPTH_FORMATS, DEPTH_USAGE, &support)?,
            shadow_depth: pick_format("shadow depth", &SHADOW_DEPTH_FORMATS, DEPTH_USAGE, &support)?,
            hiz: pick_format("hi-z", &HIZ_FORMATS, COMPUTE_USAGE, &support)?,
            ao: pick_format("ambient occlusion", &AO_FORMATS, COMPUTE_USAGE, &support)?,
        })
    }
}
