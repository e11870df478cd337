//! Compilation of generated source into cached, loadable modules.

mod build;
mod load;

pub use build::{ArtifactCache, ArtifactMeta, CompiledArtifact};
pub use load::NativeModule;
