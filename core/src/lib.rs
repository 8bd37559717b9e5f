pub mod ai;
pub mod archive;
pub mod backup;
pub mod config;
pub mod formats;
pub mod job;
pub mod jobs;
pub mod langmap;
pub mod pipeline;
pub mod prompts;
pub mod repair;
pub mod retriever;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use ai::{ChatMessage, Embedder, Generator, GeneratorError, OpenAiClient, OpenAiSettings};
pub use config::{ConfigError, TranslatorConfig};
pub use job::{BatchCoordinator, BatchFailure, Progress, ProgressSink, ResultSet, StdoutProgress};
pub use pipeline::{PipelineError, PipelineJob, PipelineOptions, TranslationPipeline, UnitMap};
pub use prompts::PromptSet;
pub use repair::RepairError;
pub use retriever::Retriever;
pub use store::{StoreError, TermDocument, TermStore};
