mod registry;
mod selectors;
mod version;

pub use registry::{ModelRegistry, ModelSpec};
pub use selectors::{ModelSelection, ModelSelector};
pub use version::ModelVersion;
