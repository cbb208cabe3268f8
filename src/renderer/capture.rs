// renderer/capture.rs

use std::time::Duration;

use crate::renderer::device::{Fence, GpuDevice, ImageDesc, ImageId, ImageUsage, Pixmap};
use crate::renderer::error::{RenderError, RenderResult};
use crate::renderer::format::TextureFormat;
use crate::renderer::orchestrator::FrameOrchestrator;
use crate::renderer::overlay::Overlays;
use crate::renderer::world::SceneInput;

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the fence captures wait on, separate from the swapchain's.
#[derive(Debug, Default)]
pub struct CaptureService {
    fence: Fence,
    captures: u64,
}

impl CaptureService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captures(&self) -> u64 {
        self.captures
    }
}

impl<D: GpuDevice> FrameOrchestrator<D> {
    /// Renders one full frame into `target` and blocks until its pixels are
    /// back. The device is idle before and after, so no live frame overlaps.
    ///
    /// `target` must match the swapchain size.
    pub fn capture_into(
        &mut self,
        target: ImageId,
        frame: u8,
        scene: Option<SceneInput<'_>>,
        overlays: &mut Overlays<'_>,
    ) -> RenderResult<Pixmap> {
        let expected = self.attachments.extent();
        let actual = self
            .device
            .image_extent(target)
            .ok_or(RenderError::UnknownImage(target))?;
        if actual != expected {
            return Err(RenderError::CaptureExtent { expected, actual });
        }

        self.device.wait_idle()?;
        let cmd = self.record_frame(target, frame, scene, overlays)?;

        let mut fence = std::mem::take(&mut self.capture.fence);
        let waited = self
            .submit(cmd, Some(&mut fence))
            .and_then(|()| self.device.wait_fence(&mut fence, Some(CAPTURE_TIMEOUT)));
        self.capture.fence = fence;
        waited?;

        let pixels = self.device.read_pixels(target)?;
        self.device.wait_idle()?;
        self.capture.captures += 1;
        log::info!(
            "Captured frame {} ({}x{}, checksum {:016x})",
            frame,
            pixels.width,
            pixels.height,
            pixels.checksum()
        );
        Ok(pixels)
    }

    /// Captures into a temporary RGBA8 target at the swapchain size.
    pub fn screenshot(
        &mut self,
        frame: u8,
        scene: Option<SceneInput<'_>>,
        overlays: &mut Overlays<'_>,
    ) -> RenderResult<Pixmap> {
        let desc = ImageDesc {
            label: "screenshot",
            format: TextureFormat::Rgba8,
            extent: self.attachments.extent(),
            mip_levels: 1,
            usage: ImageUsage::ATTACHMENT | ImageUsage::SAMPLED | ImageUsage::COPY_SRC,
        };
        let target = self.device.create_image(&desc)?;
        let result = self.capture_into(target, frame, scene, overlays);
        if result.is_err() {
            self.device.wait_idle()?;
        }
        self.device.destroy_image(target)?;
        result
    }
}
