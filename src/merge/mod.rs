pub mod orchestrator;
pub mod serializer;

pub use orchestrator::{MergeOrchestrator, MergeReport};
pub use serializer::BufferMergeSerializer;
