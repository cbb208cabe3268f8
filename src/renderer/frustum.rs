use glam::{Mat4, Vec3, Vec4};

use crate::renderer::device::Extent2d;
use crate::renderer::CASCADE_COUNT;

/// Main view followed by one volume per shadow cascade.
pub const FRUSTUM_COUNT: usize = 1 + CASCADE_COUNT;

pub const MAIN_VIEW: usize = 0;

pub fn cascade_view(layer: usize) -> usize {
    1 + layer
}

#[derive(Clone, Debug, PartialEq)]
pub struct Frustum {
    /// left, right, bottom, top, near, far; normals point inwards.
    planes: [Vec4; 6],
    viewport: Extent2d,
    empty: bool,
}

impl Default for Frustum {
    fn default() -> Self {
        Self::empty()
    }
}

impl Frustum {
    /// Extracts the six planes of `view_proj` (wgpu clip space, z in 0..1).
    /// `width`/`height` is the target the volume is rendered into.
    pub fn make(view_proj: Mat4, width: u32, height: u32) -> Self {
        let m = view_proj.transpose();
        let planes = [
            m.w_axis + m.x_axis,
            m.w_axis - m.x_axis,
            m.w_axis + m.y_axis,
            m.w_axis - m.y_axis,
            m.z_axis,
            m.w_axis - m.z_axis,
        ]
        .map(normalize_plane);
        Self {
            planes,
            viewport: Extent2d::new(width, height),
            empty: false,
        }
    }

    /// A volume that contains nothing.
    pub fn empty() -> Self {
        Self {
            planes: [Vec4::ZERO; 6],
            viewport: Extent2d::new(0, 0),
            empty: true,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::empty();
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn viewport(&self) -> Extent2d {
        self.viewport
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        self.contains_sphere(p, 0.0)
    }

    pub fn contains_sphere(&self, center: Vec3, radius: f32) -> bool {
        if self.empty {
            return false;
        }
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(center) + plane.w >= -radius)
    }

    /// Conservative: true unless the box is fully behind one plane.
    pub fn contains_aabb(&self, min: Vec3, max: Vec3) -> bool {
        if self.empty {
            return false;
        }
        self.planes.iter().all(|plane| {
            let n = plane.truncate();
            let positive = Vec3::select(n.cmpge(Vec3::ZERO), max, min);
            n.dot(positive) + plane.w >= 0.0
        })
    }
}

fn normalize_plane(plane: Vec4) -> Vec4 {
    let len = plane.truncate().length();
    if len > f32::EPSILON {
        plane / len
    } else {
        plane
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> Mat4 {
        let proj = Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        proj * view
    }

    #[test]
    fn points_in_front_are_inside() {
        let frustum = Frustum::make(camera(), 1920, 1080);
        assert!(frustum.contains_point(Vec3::new(0.0, 0.0, -10.0)));
        assert!(!frustum.contains_point(Vec3::new(0.0, 0.0, 10.0)));
        assert!(!frustum.contains_point(Vec3::new(0.0, 0.0, -200.0)));
        assert_eq!(frustum.viewport(), Extent2d::new(1920, 1080));
    }

    #[test]
    fn spheres_straddling_a_plane_are_kept() {
        let frustum = Frustum::make(camera(), 64, 64);
        assert!(frustum.contains_sphere(Vec3::new(0.0, 0.0, 1.0), 2.0));
        assert!(!frustum.contains_sphere(Vec3::new(0.0, 0.0, 5.0), 2.0));
    }

    #[test]
    fn aabb_test_is_conservative() {
        let frustum = Frustum::make(camera(), 64, 64);
        assert!(frustum.contains_aabb(Vec3::new(-1.0, -1.0, -6.0), Vec3::new(1.0, 1.0, -4.0)));
        assert!(frustum.contains_aabb(Vec3::new(-50.0, -1.0, -6.0), Vec3::new(50.0, 1.0, -4.0)));
        assert!(!frustum.contains_aabb(Vec3::new(-1.0, -1.0, 4.0), Vec3::new(1.0, 1.0, 6.0)));
    }

    #[test]
    fn cleared_frustum_rejects_everything() {
        let mut frustum = Frustum::make(camera(), 64, 64);
        frustum.clear();
        assert!(frustum.is_empty());
        assert!(!frustum.contains_sphere(Vec3::new(0.0, 0.0, -10.0), 1000.0));
    }
}
