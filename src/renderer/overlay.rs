use crate::renderer::commands::CommandStream;
use crate::renderer::device::{Extent2d, ImageId};

/// Screen rectangle for one debug texture, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebugTile {
    pub image: ImageId,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

pub trait OverlayLayer {
    /// `debug_tiles` is empty unless the Hi-Z overlay is enabled.
    fn draw(&mut self, cmd: &mut CommandStream, debug_tiles: &[DebugTile]);
}

pub trait InventoryLayer {
    fn is_open(&self) -> bool;
    fn draw(&mut self, cmd: &mut CommandStream);
    fn draw_counters(&mut self, cmd: &mut CommandStream);
}

pub trait VideoLayer {
    /// While a video plays the scene is not drawn at all.
    fn is_active(&self) -> bool;
}

/// Optional layers for one [`draw`](crate::renderer::FrameOrchestrator::draw) call.
#[derive(Default)]
pub struct Overlays<'a> {
    pub ui: Option<&'a mut dyn OverlayLayer>,
    pub inventory: Option<&'a mut dyn InventoryLayer>,
    pub video: Option<&'a dyn VideoLayer>,
}

impl Overlays<'_> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn video_active(&self) -> bool {
        self.video.is_some_and(|video| video.is_active())
    }

    pub fn inventory_open(&self) -> bool {
        self.inventory.as_ref().is_some_and(|inventory| inventory.is_open())
    }
}

const TILE_MIN: u32 = 200;
const TILE_GAP: u32 = 10;
const TILE_TOP: u32 = 50;

/// Scales each texture by powers of two into roughly 200..400 pixels and
/// places them left to right. Empty textures are skipped.
pub fn debug_tile_layout(textures: &[(ImageId, Extent2d)]) -> Vec<DebugTile> {
    let mut tiles = Vec::with_capacity(textures.len());
    let mut left = TILE_GAP;
    for (image, extent) in textures {
        let (mut w, mut h) = (extent.width, extent.height);
        if w == 0 || h == 0 {
            continue;
        }
        while w < TILE_MIN && h < TILE_MIN {
            w *= 2;
            h *= 2;
        }
        while w > TILE_MIN * 2 || h > TILE_MIN * 2 {
            w = (w + 1) / 2;
            h = (h + 1) / 2;
        }
        tiles.push(DebugTile {
            image: *image,
            x: left,
            y: TILE_TOP,
            width: w,
            height: h,
        });
        left += w + TILE_GAP;
    }
    tiles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_textures_grow_and_large_ones_shrink() {
        let tiles = debug_tile_layout(&[
            (ImageId(1), Extent2d::new(64, 16)),
            (ImageId(2), Extent2d::new(2048, 2048)),
            (ImageId(3), Extent2d::new(0, 5)),
            (ImageId(4), Extent2d::new(300, 100)),
        ]);
        assert_eq!(tiles.len(), 3);

        assert_eq!((tiles[0].width, tiles[0].height), (256, 64));
        assert_eq!((tiles[0].x, tiles[0].y), (10, 50));

        assert_eq!((tiles[1].width, tiles[1].height), (256, 256));
        assert_eq!(tiles[1].x, 10 + 256 + 10);

        // already inside the band
        assert_eq!((tiles[2].width, tiles[2].height), (300, 100));
        assert_eq!(tiles[2].image, ImageId(4));
    }

    #[test]
    fn shrinking_rounds_up() {
        let tiles = debug_tile_layout(&[(ImageId(1), Extent2d::new(801, 3))]);
        assert_eq!((tiles[0].width, tiles[0].height), (401 / 2 + 1, 1));
    }

    struct Video(bool);

    impl VideoLayer for Video {
        fn is_active(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn missing_layers_are_inactive() {
        let overlays = Overlays::none();
        assert!(!overlays.video_active());
        assert!(!overlays.inventory_open());

        let playing = Video(true);
        let overlays = Overlays {
            video: Some(&playing),
            ..Overlays::none()
        };
        assert!(overlays.video_active());
    }
}
