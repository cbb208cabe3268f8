use bitflags::bitflags;

use crate::renderer::device::DeviceFeatures;
use crate::renderer::shaders::ShaderKind;
use crate::settings::RenderSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShadowResolve {
    RayQuery,
    ShadowMap,
    Unshadowed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AmbientCompose {
    Ssao,
    Plain,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reflections {
    ScreenSpace,
    Cheap,
}

impl ShadowResolve {
    pub fn shader(self) -> ShaderKind {
        match self {
            ShadowResolve::RayQuery => ShaderKind::ShadowResolveRayQuery,
            ShadowResolve::ShadowMap => ShaderKind::ShadowResolveShadowMap,
            ShadowResolve::Unshadowed => ShaderKind::ShadowResolve,
        }
    }
}

impl AmbientCompose {
    pub fn shader(self) -> ShaderKind {
        match self {
            AmbientCompose::Ssao => ShaderKind::AmbientComposeSsao,
            AmbientCompose::Plain => ShaderKind::AmbientCompose,
        }
    }
}

impl Reflections {
    pub fn shader(self) -> ShaderKind {
        match self {
            Reflections::ScreenSpace => ShaderKind::WaterReflectionSsr,
            Reflections::Cheap => ShaderKind::WaterReflection,
        }
    }
}

/// Everything the selection depends on, and nothing else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VariantInputs {
    pub ray_query: bool,
    pub bindless_non_uniform: bool,
    pub shadows_enabled: bool,
    pub env_mapping: bool,
    pub cloud_shadow_scale: bool,
}

impl VariantInputs {
    pub fn new(features: DeviceFeatures, settings: &RenderSettings) -> Self {
        Self {
            ray_query: features.contains(DeviceFeatures::RAY_QUERY),
            bindless_non_uniform: features.contains(DeviceFeatures::BINDLESS_NON_UNIFORM),
            shadows_enabled: settings.shadow_resolution > 0,
            env_mapping: settings.env_mapping,
            cloud_shadow_scale: settings.cloud_shadow_scale,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VariantSelection {
    pub shadow: ShadowResolve,
    pub ambient: AmbientCompose,
    pub reflections: Reflections,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ChangedAxes: u8 {
        const SHADOW      = 1 << 0;
        const AMBIENT     = 1 << 1;
        const REFLECTIONS = 1 << 2;
    }
}

impl VariantSelection {
    /// Axes whose variant tag differs between `self` and `previous`.
    pub fn changed_since(&self, previous: &VariantSelection) -> ChangedAxes {
        let mut changed = ChangedAxes::empty();
        changed.set(ChangedAxes::SHADOW, self.shadow != previous.shadow);
        changed.set(ChangedAxes::AMBIENT, self.ambient != previous.ambient);
        changed.set(
            ChangedAxes::REFLECTIONS,
            self.reflections != previous.reflections,
        );
        changed
    }
}

pub fn select_variants(inputs: &VariantInputs) -> VariantSelection {
    let shadow = if inputs.ray_query && inputs.bindless_non_uniform && inputs.shadows_enabled {
        ShadowResolve::RayQuery
    } else if inputs.shadows_enabled {
        ShadowResolve::ShadowMap
    } else {
        ShadowResolve::Unshadowed
    };

    let ambient = if inputs.cloud_shadow_scale {
        AmbientCompose::Ssao
    } else {
        AmbientCompose::Plain
    };

    let reflections = if inputs.env_mapping {
        Reflections::ScreenSpace
    } else {
        Reflections::Cheap
    };

    VariantSelection {
        shadow,
        ambient,
        reflections,
    }
}
