pub mod config;
pub mod credits;
pub mod dispatch;
pub mod engine;
pub mod gallery;
pub mod metadata;
pub mod pool;
pub mod prompt;
pub mod providers;
pub mod session;
pub mod text;
pub mod video;

mod util;

pub use config::EngineConfig;
pub use engine::{DukyEngine, PlanPreview};
