pub mod renderer;
pub mod settings;

pub use renderer::{
    Camera, FrameOrchestrator, GpuDevice, HeadlessDevice, Overlays, RenderError, RenderResult,
    SceneInput, WgpuDevice, WorldView,
};
pub use settings::{DebugConfig, KeyValueSettings, RenderSettings, SettingsStore};

/// Routes `log` output to stderr at info level unless `RUST_LOG` says
/// otherwise. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init();
}
