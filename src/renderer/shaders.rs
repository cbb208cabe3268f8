use std::collections::HashMap;

use crate::renderer::CASCADE_COUNT;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(pub u32);

impl PipelineId {
    pub const NULL: PipelineId = PipelineId(0);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Graphics,
    Compute,
}

/// A pipeline handle together with what it writes, so recorded streams can
/// be validated without asking the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Pipeline {
    pub id: PipelineId,
    pub stage: PipelineStage,
    pub writes_color: bool,
    pub writes_depth: bool,
}

impl Pipeline {
    pub const NULL: Pipeline = Pipeline {
        id: PipelineId::NULL,
        stage: PipelineStage::Graphics,
        writes_color: false,
        writes_depth: false,
    };

    pub fn graphics(id: PipelineId) -> Self {
        Self {
            id,
            stage: PipelineStage::Graphics,
            writes_color: true,
            writes_depth: false,
        }
    }

    pub fn depth_writing(id: PipelineId) -> Self {
        Self {
            writes_depth: true,
            ..Self::graphics(id)
        }
    }

    pub fn compute(id: PipelineId) -> Self {
        Self {
            id,
            stage: PipelineStage::Compute,
            writes_color: false,
            writes_depth: false,
        }
    }

    pub fn is_null(&self) -> bool {
        self.id == PipelineId::NULL
    }
}

/// Every pipeline the orchestrator binds itself. World-side pipelines
/// (g-buffer, sky, water...) belong to the world view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderKind {
    HiZPot,
    HiZMip,
    Stash,
    ShadowResolve,
    ShadowResolveShadowMap,
    ShadowResolveRayQuery,
    AmbientCompose,
    AmbientComposeSsao,
    WaterReflection,
    WaterReflectionSsr,
    UnderwaterTop,
    UnderwaterSurface,
    Ssao,
    Irradiance,
    Tonemapping,
}

impl ShaderKind {
    pub const ALL: [ShaderKind; 15] = [
        ShaderKind::HiZPot,
        ShaderKind::HiZMip,
        ShaderKind::Stash,
        ShaderKind::ShadowResolve,
        ShaderKind::ShadowResolveShadowMap,
        ShaderKind::ShadowResolveRayQuery,
        ShaderKind::AmbientCompose,
        ShaderKind::AmbientComposeSsao,
        ShaderKind::WaterReflection,
        ShaderKind::WaterReflectionSsr,
        ShaderKind::UnderwaterTop,
        ShaderKind::UnderwaterSurface,
        ShaderKind::Ssao,
        ShaderKind::Irradiance,
        ShaderKind::Tonemapping,
    ];

    pub fn stage(self) -> PipelineStage {
        match self {
            ShaderKind::HiZPot | ShaderKind::HiZMip | ShaderKind::Ssao | ShaderKind::Irradiance => {
                PipelineStage::Compute
            }
            _ => PipelineStage::Graphics,
        }
    }

    /// Number of descriptor slots in this pipeline's layout.
    pub fn slot_count(self) -> usize {
        match self {
            ShaderKind::HiZPot | ShaderKind::HiZMip | ShaderKind::Stash => 2,
            ShaderKind::ShadowResolve => 4,
            ShaderKind::ShadowResolveShadowMap => 4 + CASCADE_COUNT,
            ShaderKind::ShadowResolveRayQuery => 4 + CASCADE_COUNT + 6,
            ShaderKind::AmbientCompose => 4,
            ShaderKind::AmbientComposeSsao => 5,
            ShaderKind::WaterReflection | ShaderKind::WaterReflectionSsr => 11,
            ShaderKind::UnderwaterTop | ShaderKind::UnderwaterSurface => 2,
            ShaderKind::Ssao => 5,
            ShaderKind::Irradiance => 3,
            ShaderKind::Tonemapping => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ShaderKind::HiZPot => "hiz_pot",
            ShaderKind::HiZMip => "hiz_mip",
            ShaderKind::Stash => "stash",
            ShaderKind::ShadowResolve => "shadow_resolve",
            ShaderKind::ShadowResolveShadowMap => "shadow_resolve_sm",
            ShaderKind::ShadowResolveRayQuery => "shadow_resolve_rq",
            ShaderKind::AmbientCompose => "ambient_compose",
            ShaderKind::AmbientComposeSsao => "ambient_compose_ssao",
            ShaderKind::WaterReflection => "water_reflection",
            ShaderKind::WaterReflectionSsr => "water_reflection_ssr",
            ShaderKind::UnderwaterTop => "underwater_t",
            ShaderKind::UnderwaterSurface => "underwater_s",
            ShaderKind::Ssao => "ssao",
            ShaderKind::Irradiance => "irradiance",
            ShaderKind::Tonemapping => "tonemapping",
        }
    }
}

/// Pipeline table for [`ShaderKind`]s, filled by whoever compiled them.
#[derive(Clone, Debug, Default)]
pub struct Shaders {
    pipelines: HashMap<ShaderKind, Pipeline>,
}

impl Shaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns every kind a stable id (`1 + position in ShaderKind::ALL`),
    /// for devices that execute pipelines symbolically.
    pub fn enumerated() -> Self {
        let mut shaders = Self::new();
        for (index, kind) in ShaderKind::ALL.iter().enumerate() {
            let id = PipelineId(index as u32 + 1);
            let pipeline = match kind.stage() {
                PipelineStage::Compute => Pipeline::compute(id),
                PipelineStage::Graphics => Pipeline::graphics(id),
            };
            shaders.insert(*kind, pipeline);
        }
        shaders
    }

    pub fn insert(&mut self, kind: ShaderKind, pipeline: Pipeline) -> &mut Self {
        self.pipelines.insert(kind, pipeline);
        self
    }

    /// Missing kinds resolve to [`Pipeline::NULL`], which backends skip.
    pub fn get(&self, kind: ShaderKind) -> Pipeline {
        match self.pipelines.get(&kind) {
            Some(pipeline) => *pipeline,
            None => {
                log::warn!("No pipeline registered for {}", kind.label());
                Pipeline::NULL
            }
        }
    }

    pub fn contains(&self, kind: ShaderKind) -> bool {
        self.pipelines.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerated_ids_are_unique_and_non_null() {
        let shaders = Shaders::enumerated();
        let mut ids: Vec<_> = ShaderKind::ALL.iter().map(|k| shaders.get(*k).id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), ShaderKind::ALL.len());
        assert!(!ids.contains(&PipelineId::NULL));
    }

    #[test]
    fn unknown_kind_resolves_to_null_pipeline() {
        let shaders = Shaders::new();
        assert!(shaders.get(ShaderKind::Tonemapping).is_null());
    }

    #[test]
    fn compute_kinds_never_write_attachments() {
        let shaders = Shaders::enumerated();
        for kind in ShaderKind::ALL {
            let pipeline = shaders.get(kind);
            if kind.stage() == PipelineStage::Compute {
                assert!(!pipeline.writes_color && !pipeline.writes_depth);
            }
        }
    }
}
