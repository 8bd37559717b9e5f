use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};

use super::{chunk_units, Progress, ProgressSink, ResultSet};
use crate::backup::{write_atomic, BackupError};
use crate::pipeline::{PipelineError, TranslationPipeline, UnitMap};

pub const DEFAULT_CHUNK_SIZE: usize = 100;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_DOCUMENT_WORKERS: usize = 12;

type ChunkTasks = JoinSet<(usize, Result<UnitMap, PipelineError>)>;
type DocumentTasks = JoinSet<(String, Result<(), DocumentError>)>;

/// The first failing chunk of a batch. `partial` holds every chunk merged
/// before the failure surfaced.
#[derive(Debug, Error)]
#[error("chunk {chunk_index} failed: {error}")]
pub struct BatchFailure {
    pub chunk_index: usize,
    #[source]
    pub error: PipelineError,
    pub partial: ResultSet,
}

#[derive(Debug, Clone)]
pub struct DocumentJob {
    /// Display name used in progress output.
    pub label: String,
    pub source: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentReport {
    pub translated: usize,
    pub skipped_existing: usize,
    pub total: usize,
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("failed to write translation: {0}")]
    Write(#[from] BackupError),
}

#[derive(Debug, Error)]
#[error("document {label} failed: {error}")]
pub struct DocumentFailure {
    pub label: String,
    #[source]
    pub error: DocumentError,
    pub report: DocumentReport,
}

/// Runs chunks through a bounded pool of workers. Results are merged by the
/// draining loop alone, in completion order.
#[derive(Debug, Clone, Copy)]
pub struct BatchCoordinator {
    pub chunk_size: usize,
    pub workers: usize,
}

impl Default for BatchCoordinator {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: DEFAULT_WORKERS,
        }
    }
}

impl BatchCoordinator {
    pub fn new(chunk_size: usize, workers: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            workers: workers.max(1),
        }
    }

    /// Plain key/value translation of `units`.
    pub async fn run(
        &self,
        pipeline: Arc<TranslationPipeline>,
        units: &UnitMap,
        sink: &mut dyn ProgressSink,
    ) -> Result<ResultSet, BatchFailure> {
        self.run_with(units, sink, move |chunk| {
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.translate_map(chunk).await }
        })
        .await
    }

    /// Structured translation; list values keep their length.
    pub async fn run_structured(
        &self,
        pipeline: Arc<TranslationPipeline>,
        units: &UnitMap,
        sink: &mut dyn ProgressSink,
    ) -> Result<ResultSet, BatchFailure> {
        self.run_with(units, sink, move |chunk| {
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.translate_structured(chunk).await }
        })
        .await
    }

    pub async fn run_with<F, Fut>(
        &self,
        units: &UnitMap,
        sink: &mut dyn ProgressSink,
        work: F,
    ) -> Result<ResultSet, BatchFailure>
    where
        F: Fn(UnitMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<UnitMap, PipelineError>> + Send + 'static,
    {
        let total = units.len();
        let chunks = chunk_units(units, self.chunk_size);
        let chunk_count = chunks.len();
        info!(
            "translating {total} units in {chunk_count} chunks with {} workers",
            self.workers
        );

        let work = Arc::new(work);
        let mut pending = chunks.into_iter().enumerate();
        let mut in_flight = ChunkTasks::new();
        let spawn = |in_flight: &mut ChunkTasks, (index, chunk): (usize, UnitMap)| {
            let work = Arc::clone(&work);
            in_flight.spawn(async move { (index, work(chunk).await) });
        };

        for next in pending.by_ref().take(self.workers.max(1)) {
            spawn(&mut in_flight, next);
        }

        let mut aggregate = ResultSet::new();
        while let Some(joined) = in_flight.join_next().await {
            let Some((index, result)) = settle(joined) else {
                continue;
            };
            match result {
                Ok(chunk) => {
                    for (key, value) in &chunk {
                        aggregate.insert(key.clone(), value.clone());
                    }
                    sink.chunk_completed(
                        &chunk,
                        Progress {
                            processed: aggregate.len(),
                            total,
                        },
                    );
                    if let Some(next) = pending.next() {
                        spawn(&mut in_flight, next);
                    }
                }
                Err(error) => {
                    in_flight.abort_all();
                    warn!(
                        "chunk {index} failed, aborting batch with {} of {total} units done: {error}",
                        aggregate.len()
                    );
                    return Err(BatchFailure {
                        chunk_index: index,
                        error,
                        partial: aggregate,
                    });
                }
            }
        }

        sink.finished(&aggregate);
        Ok(aggregate)
    }

    /// Translates free-text documents, writing each output as soon as it is
    /// ready. Jobs whose target already exists count as finished.
    pub async fn run_documents(
        &self,
        pipeline: Arc<TranslationPipeline>,
        jobs: Vec<DocumentJob>,
        sink: &mut dyn ProgressSink,
    ) -> Result<DocumentReport, DocumentFailure> {
        let mut report = DocumentReport {
            total: jobs.len(),
            ..DocumentReport::default()
        };

        let mut pending = Vec::new();
        for job in jobs {
            if job.target.exists() {
                report.skipped_existing += 1;
            } else {
                pending.push(job);
            }
        }
        info!(
            "translating {} documents ({} already done)",
            pending.len(),
            report.skipped_existing
        );

        let mut pending = pending.into_iter();
        let mut in_flight = DocumentTasks::new();
        let spawn = |in_flight: &mut DocumentTasks, job: DocumentJob| {
            let pipeline = Arc::clone(&pipeline);
            in_flight.spawn(async move {
                let result = translate_document_file(&pipeline, &job).await;
                (job.label, result)
            });
        };

        for job in pending.by_ref().take(self.workers.max(1)) {
            spawn(&mut in_flight, job);
        }

        while let Some(joined) = in_flight.join_next().await {
            let Some((label, result)) = settle(joined) else {
                continue;
            };
            match result {
                Ok(()) => {
                    report.translated += 1;
                    sink.document_completed(
                        &label,
                        Progress {
                            processed: report.translated + report.skipped_existing,
                            total: report.total,
                        },
                    );
                    if let Some(job) = pending.next() {
                        spawn(&mut in_flight, job);
                    }
                }
                Err(error) => {
                    in_flight.abort_all();
                    return Err(DocumentFailure {
                        label,
                        error,
                        report,
                    });
                }
            }
        }

        Ok(report)
    }
}

async fn translate_document_file(
    pipeline: &TranslationPipeline,
    job: &DocumentJob,
) -> Result<(), DocumentError> {
    let document = tokio::fs::read_to_string(&job.source)
        .await
        .map_err(|source| DocumentError::Read {
            path: job.source.clone(),
            source,
        })?;
    let translated = pipeline.translate_document(document).await?;
    write_atomic(&job.target, translated.as_bytes())?;
    Ok(())
}

/// Unwraps a finished task. Worker panics are re-raised on the caller.
fn settle<T>(joined: Result<T, JoinError>) -> Option<T> {
    match joined {
        Ok(value) => Some(value),
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(_) => None,
    }
}
