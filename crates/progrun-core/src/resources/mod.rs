//! Question resources and the contexts they are mounted for.

mod context;
mod fetch;

pub use context::{ContextFile, ContextStore, DEFAULT_CONTEXT};
pub use fetch::{DirectoryFetcher, ResourceFetcher};
