// renderer/bindings.rs

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::renderer::attachments::{AttachmentSet, Targets};
use crate::renderer::device::{AccelId, BindlessId, BufferId, ImageId};
use crate::renderer::shaders::ShaderKind;
use crate::renderer::uniforms::GlobalUniforms;
use crate::renderer::variants::{AmbientCompose, ShadowResolve, VariantSelection};
use crate::renderer::world::SceneBindings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SamplerKind {
    Nearest,
    NearestClamp,
    Bilinear,
    BilinearMirrored,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Binding {
    Sampled {
        image: ImageId,
        sampler: SamplerKind,
        /// A single mip level, or the whole chain.
        mip: Option<u32>,
    },
    Storage {
        image: ImageId,
        mip: Option<u32>,
    },
    /// Frame-slotted uniform buffer; the slot comes from the frame id of
    /// the stream the set is used in.
    FrameUniform {
        buffer: BufferId,
        slot_size: u64,
    },
    Sampler(SamplerKind),
    AccelerationStructure(AccelId),
    TextureArray(BindlessId),
    BufferArray(BindlessId),
    Buffer(BufferId),
}

impl Binding {
    pub fn sampled(image: ImageId, sampler: SamplerKind) -> Self {
        Binding::Sampled {
            image,
            sampler,
            mip: None,
        }
    }

    pub fn storage(image: ImageId, mip: Option<u32>) -> Self {
        Binding::Storage { image, mip }
    }

    pub fn image(&self) -> Option<ImageId> {
        match self {
            Binding::Sampled { image, .. } | Binding::Storage { image, .. } => Some(*image),
            _ => None,
        }
    }
}

static NEXT_SET_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed-arity slot list for one [`ShaderKind`] layout.
///
/// Sets are immutable once shared; a rebuild produces new sets with new ids.
#[derive(Debug, PartialEq, Eq)]
pub struct DescriptorSet {
    id: u64,
    layout: ShaderKind,
    slots: Vec<Option<Binding>>,
}

impl DescriptorSet {
    pub fn new(layout: ShaderKind) -> Self {
        Self {
            id: NEXT_SET_ID.fetch_add(1, Ordering::Relaxed),
            layout,
            slots: vec![None; layout.slot_count()],
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn layout(&self) -> ShaderKind {
        self.layout
    }

    pub fn set(&mut self, slot: usize, binding: Binding) -> &mut Self {
        match self.slots.get_mut(slot) {
            Some(entry) => *entry = Some(binding),
            None => log::error!(
                "Slot {} out of range for {} ({} slots)",
                slot,
                self.layout.label(),
                self.slots.len()
            ),
        }
        self
    }

    pub fn get(&self, slot: usize) -> Option<&Binding> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn slots(&self) -> &[Option<Binding>] {
        &self.slots
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    pub fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.slots.iter().flatten()
    }

    pub fn images(&self) -> impl Iterator<Item = ImageId> + '_ {
        self.bindings().filter_map(Binding::image)
    }

    pub fn references(&self, image: ImageId) -> bool {
        self.images().any(|bound| bound == image)
    }
}

/// Every set the orchestrator binds, from one rebuild.
#[derive(Clone, Debug, Default)]
pub struct BoundSets {
    pub stash: Option<Arc<DescriptorSet>>,
    pub shadow_resolve: Option<Arc<DescriptorSet>>,
    pub underwater: Option<Arc<DescriptorSet>>,
    pub ssao: Option<Arc<DescriptorSet>>,
    pub ambient_compose: Option<Arc<DescriptorSet>>,
    pub tonemapping: Option<Arc<DescriptorSet>>,
    pub irradiance: Option<Arc<DescriptorSet>>,
    pub water_reflection: Option<Arc<DescriptorSet>>,
    pub hiz_pot: Option<Arc<DescriptorSet>>,
    pub hiz_mips: Vec<Arc<DescriptorSet>>,
}

impl BoundSets {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<DescriptorSet>> {
        [
            &self.stash,
            &self.shadow_resolve,
            &self.underwater,
            &self.ssao,
            &self.ambient_compose,
            &self.tonemapping,
            &self.irradiance,
            &self.water_reflection,
            &self.hiz_pot,
        ]
        .into_iter()
        .flatten()
        .chain(self.hiz_mips.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// Everything a rebuild reads.
pub struct BindingInputs<'a> {
    pub attachments: &'a AttachmentSet,
    pub variants: VariantSelection,
    pub globals: &'a GlobalUniforms,
    /// `None` while no world is loaded.
    pub scene: Option<SceneBindings>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct BinderKey {
    generation: u64,
    variants: VariantSelection,
    globals: BufferId,
    scene: Option<SceneBindings>,
}

impl BinderKey {
    fn of(inputs: &BindingInputs<'_>) -> Self {
        Self {
            generation: inputs.attachments.generation(),
            variants: inputs.variants,
            globals: inputs.globals.buffer(),
            scene: inputs.scene.clone(),
        }
    }
}

/// Single owner of "what is bound to what".
///
/// [`UniformBinder::rebuild`] replaces every set at once, and only when its
/// inputs differ from the last rebuild. Callers must idle the device first
/// whenever [`UniformBinder::is_current`] is false.
#[derive(Debug, Default)]
pub struct UniformBinder {
    key: Option<BinderKey>,
    sets: BoundSets,
    rebuilds: u64,
}

impl UniformBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_current(&self, inputs: &BindingInputs<'_>) -> bool {
        self.key.as_ref() == Some(&BinderKey::of(inputs))
    }

    /// Returns whether the sets were replaced.
    pub fn rebuild(&mut self, inputs: &BindingInputs<'_>) -> bool {
        let key = BinderKey::of(inputs);
        if self.key.as_ref() == Some(&key) {
            return false;
        }
        self.sets = match &inputs.scene {
            Some(scene) => build_sets(inputs, scene),
            None => BoundSets::default(),
        };
        self.key = Some(key);
        self.rebuilds += 1;
        log::debug!(
            "Descriptor sets rebuilt ({} sets, rebuild #{})",
            self.sets.iter().count(),
            self.rebuilds
        );
        true
    }

    /// Forces the next [`UniformBinder::rebuild`] to run.
    pub fn invalidate(&mut self) {
        self.key = None;
    }

    pub fn clear(&mut self) {
        self.key = None;
        self.sets = BoundSets::default();
    }

    pub fn sets(&self) -> &BoundSets {
        &self.sets
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }
}

fn sampled(image: ImageId) -> Binding {
    Binding::sampled(image, SamplerKind::Nearest)
}

fn build_sets(inputs: &BindingInputs<'_>, scene: &SceneBindings) -> BoundSets {
    let t: &Targets = inputs.attachments.targets();
    let globals = inputs.globals.binding();
    let mut sets = BoundSets::default();

    let mut stash = DescriptorSet::new(ShaderKind::Stash);
    stash
        .set(0, sampled(t.scene_linear.image))
        .set(1, sampled(t.zbuffer.image));
    sets.stash = Some(Arc::new(stash));

    sets.shadow_resolve = Some(Arc::new(shadow_resolve_set(inputs, scene, &globals)));

    let mut underwater = DescriptorSet::new(ShaderKind::UnderwaterTop);
    underwater
        .set(0, globals.clone())
        .set(1, sampled(t.zbuffer.image));
    sets.underwater = Some(Arc::new(underwater));

    let with_ssao = inputs.variants.ambient == AmbientCompose::Ssao;
    if with_ssao {
        let mut ssao = DescriptorSet::new(ShaderKind::Ssao);
        ssao.set(0, Binding::storage(t.ssao.image, None))
            .set(1, sampled(t.gbuf_diffuse.image))
            .set(2, sampled(t.gbuf_normal.image))
            .set(3, sampled(t.zbuffer.image))
            .set(4, globals.clone());
        sets.ssao = Some(Arc::new(ssao));
    }

    let mut ambient = DescriptorSet::new(inputs.variants.ambient.shader());
    ambient
        .set(0, sampled(t.gbuf_diffuse.image))
        .set(1, sampled(t.gbuf_normal.image))
        .set(2, sampled(t.zbuffer.image))
        .set(3, Binding::sampled(t.irradiance_lut.image, SamplerKind::Bilinear));
    if with_ssao {
        ambient.set(4, sampled(t.ssao.image));
    }
    sets.ambient_compose = Some(Arc::new(ambient));

    let mut tonemapping = DescriptorSet::new(ShaderKind::Tonemapping);
    tonemapping.set(0, sampled(t.scene_linear.image));
    sets.tonemapping = Some(Arc::new(tonemapping));

    let mut irradiance = DescriptorSet::new(ShaderKind::Irradiance);
    irradiance
        .set(0, Binding::storage(t.irradiance_lut.image, None))
        .set(1, globals.clone())
        .set(2, Binding::sampled(scene.sky_lut, SamplerKind::Bilinear));
    sets.irradiance = Some(Arc::new(irradiance));

    let mut water = DescriptorSet::new(inputs.variants.reflections.shader());
    water
        .set(0, globals)
        .set(1, sampled(t.scene_opaque.image))
        .set(2, sampled(t.gbuf_diffuse.image))
        .set(3, sampled(t.gbuf_normal.image))
        .set(4, sampled(t.zbuffer.image))
        .set(5, sampled(t.scene_depth.image))
        .set(6, Binding::sampled(scene.sky_lut, SamplerKind::Bilinear))
        .set(7, Binding::sampled(scene.clouds_day[0], SamplerKind::BilinearMirrored))
        .set(8, Binding::sampled(scene.clouds_day[1], SamplerKind::BilinearMirrored))
        .set(9, Binding::sampled(scene.clouds_night[0], SamplerKind::BilinearMirrored))
        .set(10, Binding::sampled(scene.clouds_night[1], SamplerKind::BilinearMirrored));
    sets.water_reflection = Some(Arc::new(water));

    if let Some(hiz) = &t.hiz {
        let mut pot = DescriptorSet::new(ShaderKind::HiZPot);
        pot.set(0, sampled(t.zbuffer.image))
            .set(1, Binding::storage(hiz.image, Some(0)));
        sets.hiz_pot = Some(Arc::new(pot));

        for level in 0..hiz.layout.mips.len() as u32 {
            let mut mip = DescriptorSet::new(ShaderKind::HiZMip);
            mip.set(
                0,
                Binding::Sampled {
                    image: hiz.image,
                    sampler: SamplerKind::Nearest,
                    mip: Some(level),
                },
            )
            .set(1, Binding::storage(hiz.image, Some(level + 1)));
            sets.hiz_mips.push(Arc::new(mip));
        }
    }

    sets
}

/// Falls back to the shadow-map layout when ray queries were selected but
/// the world has no ray-tracing scene yet; the orchestrator picks the
/// pipeline from the set's layout.
fn shadow_resolve_set(
    inputs: &BindingInputs<'_>,
    scene: &SceneBindings,
    globals: &Binding,
) -> DescriptorSet {
    let t = inputs.attachments.targets();
    let mut variant = inputs.variants.shadow;
    if variant == ShadowResolve::RayQuery && scene.ray_tracing.is_none() {
        log::warn!("Ray-query shadows selected without a ray-tracing scene; using shadow maps");
        variant = ShadowResolve::ShadowMap;
    }

    let mut set = DescriptorSet::new(variant.shader());
    set.set(0, globals.clone())
        .set(1, sampled(t.gbuf_diffuse.image))
        .set(2, sampled(t.gbuf_normal.image))
        .set(3, sampled(t.zbuffer.image));
    if variant == ShadowResolve::Unshadowed {
        return set;
    }

    for (layer, map) in t.shadow_maps.iter().enumerate() {
        set.set(4 + layer, Binding::sampled(map.image, SamplerKind::NearestClamp));
    }
    if let (ShadowResolve::RayQuery, Some(rt)) = (variant, &scene.ray_tracing) {
        let base = 4 + t.shadow_maps.len();
        set.set(base, Binding::AccelerationStructure(rt.tlas))
            .set(base + 1, Binding::Sampler(SamplerKind::Bilinear))
            .set(base + 2, Binding::TextureArray(rt.textures))
            .set(base + 3, Binding::BufferArray(rt.vertices))
            .set(base + 4, Binding::BufferArray(rt.indices))
            .set(base + 5, Binding::Buffer(rt.index_offsets));
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::attachments::AttachmentConfig;
    use crate::renderer::device::{Extent2d, GpuDevice};
    use crate::renderer::headless::HeadlessDevice;
    use crate::renderer::variants::{select_variants, VariantInputs};
    use crate::renderer::world::RayTracingScene;

    fn scene() -> SceneBindings {
        SceneBindings {
            sky_lut: ImageId(9001),
            clouds_day: [ImageId(9002), ImageId(9003)],
            clouds_night: [ImageId(9004), ImageId(9005)],
            ray_tracing: None,
        }
    }

    fn inputs(shadows: bool, cloud: bool, ray_query: bool) -> VariantSelection {
        select_variants(&VariantInputs {
            ray_query,
            bindless_non_uniform: ray_query,
            shadows_enabled: shadows,
            env_mapping: false,
            cloud_shadow_scale: cloud,
        })
    }

    struct Fixture {
        device: HeadlessDevice,
        attachments: AttachmentSet,
        globals: GlobalUniforms,
    }

    fn fixture() -> Fixture {
        let mut device = HeadlessDevice::new();
        let attachments = AttachmentSet::new(
            &mut device,
            Extent2d::new(320, 240),
            AttachmentConfig {
                shadow_resolution: 512,
                hiz: true,
            },
        )
        .unwrap();
        let globals = GlobalUniforms::new(&mut device).unwrap();
        Fixture {
            device,
            attachments,
            globals,
        }
    }

    #[test]
    fn every_set_matches_its_layout_arity() {
        let f = fixture();
        let mut binder = UniformBinder::new();
        binder.rebuild(&BindingInputs {
            attachments: &f.attachments,
            variants: inputs(true, true, false),
            globals: &f.globals,
            scene: Some(scene()),
        });
        for set in binder.sets().iter() {
            assert!(set.is_complete(), "{} incomplete", set.layout().label());
        }
        assert!(binder.sets().ssao.is_some());
        assert_eq!(
            binder.sets().hiz_mips.len(),
            f.attachments.targets().hiz.as_ref().unwrap().layout.mips.len()
        );
    }

    #[test]
    fn unchanged_inputs_do_not_rebuild() {
        let f = fixture();
        let mut binder = UniformBinder::new();
        let bind = BindingInputs {
            attachments: &f.attachments,
            variants: inputs(true, false, false),
            globals: &f.globals,
            scene: Some(scene()),
        };
        assert!(binder.rebuild(&bind));
        let first = binder.sets().tonemapping.clone().unwrap();
        assert!(!binder.rebuild(&bind));
        assert!(binder.is_current(&bind));
        assert_eq!(binder.rebuild_count(), 1);
        assert!(Arc::ptr_eq(&first, binder.sets().tonemapping.as_ref().unwrap()));

        binder.invalidate();
        assert!(binder.rebuild(&bind));
        assert!(!Arc::ptr_eq(&first, binder.sets().tonemapping.as_ref().unwrap()));
    }

    #[test]
    fn rebuild_after_resize_drops_stale_images() {
        let mut f = fixture();
        let mut binder = UniformBinder::new();
        let variants = inputs(true, true, false);
        binder.rebuild(&BindingInputs {
            attachments: &f.attachments,
            variants,
            globals: &f.globals,
            scene: Some(scene()),
        });
        let old: Vec<ImageId> = binder.sets().iter().flat_map(|s| s.images()).collect();

        f.attachments.resize(&mut f.device, 640, 360).unwrap();
        let bind = BindingInputs {
            attachments: &f.attachments,
            variants,
            globals: &f.globals,
            scene: Some(scene()),
        };
        assert!(!binder.is_current(&bind));
        binder.rebuild(&bind);
        for set in binder.sets().iter() {
            for image in set.images() {
                assert!(
                    f.device.image_extent(image).is_some() || image.0 > 9000,
                    "{} still binds {:?}",
                    set.layout().label(),
                    image
                );
            }
        }
        assert!(old.iter().any(|i| f.device.image_extent(*i).is_none()));
    }

    #[test]
    fn no_world_binds_nothing() {
        let f = fixture();
        let mut binder = UniformBinder::new();
        binder.rebuild(&BindingInputs {
            attachments: &f.attachments,
            variants: inputs(true, true, false),
            globals: &f.globals,
            scene: None,
        });
        assert!(binder.sets().is_empty());
    }

    #[test]
    fn ray_query_layout_needs_a_ray_tracing_scene() {
        let f = fixture();
        let mut binder = UniformBinder::new();
        let variants = inputs(true, false, true);
        assert_eq!(variants.shadow, ShadowResolve::RayQuery);

        binder.rebuild(&BindingInputs {
            attachments: &f.attachments,
            variants,
            globals: &f.globals,
            scene: Some(scene()),
        });
        let set = binder.sets().shadow_resolve.clone().unwrap();
        assert_eq!(set.layout(), ShaderKind::ShadowResolveShadowMap);

        let mut rt_scene = scene();
        rt_scene.ray_tracing = Some(RayTracingScene {
            tlas: AccelId(1),
            textures: BindlessId(2),
            vertices: BindlessId(3),
            indices: BindlessId(4),
            index_offsets: BufferId(5),
        });
        assert!(binder.rebuild(&BindingInputs {
            attachments: &f.attachments,
            variants,
            globals: &f.globals,
            scene: Some(rt_scene),
        }));
        let set = binder.sets().shadow_resolve.clone().unwrap();
        assert_eq!(set.layout(), ShaderKind::ShadowResolveRayQuery);
        assert!(set.is_complete());
    }

    #[test]
    fn out_of_range_slot_is_ignored() {
        let mut set = DescriptorSet::new(ShaderKind::Tonemapping);
        set.set(3, Binding::Sampler(SamplerKind::Bilinear));
        assert_eq!(set.slots().len(), 1);
        assert!(set.get(0).is_none());
    }
}
