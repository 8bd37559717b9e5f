//! End-to-end workflows over a work directory: extraction, merging, indexing
//! and the three translation jobs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use serde_json::Value;

use crate::ai::{Embedder, Generator, OpenAiClient};
use crate::archive::{self, ExtractOptions, ExtractSummary, GuideSummary};
use crate::config::TranslatorConfig;
use crate::formats::{self, json};
use crate::job::{BatchCoordinator, DocumentJob, DocumentReport, ProgressSink, ResultSet};
use crate::langmap::{self, LangMapSummary, MergeSummary};
use crate::pipeline::{PipelineOptions, TranslationPipeline, UnitMap};
use crate::prompts::PromptSet;
use crate::retriever::Retriever;
use crate::store::{RebuildSummary, StoreError, TermStore};

/// Model capabilities used by the workflows.
#[derive(Clone)]
pub struct Services {
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
}

impl Services {
    /// OpenAI-compatible clients for the configured endpoints.
    pub fn from_config(config: &TranslatorConfig) -> Result<Self> {
        let embedder = OpenAiClient::new(config.provider.embedding_settings())
            .context("failed to create embedding client")?;
        let generator = OpenAiClient::new(config.provider.generation_settings())
            .context("failed to create generation client")?;
        Ok(Self {
            embedder: Arc::new(embedder),
            generator: Arc::new(generator),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrepareReport {
    pub extract: ExtractSummary,
    pub merged_source: MergeSummary,
    pub merged_target: MergeSummary,
    pub map: LangMapSummary,
    pub index: RebuildSummary,
}

pub fn extract(config: &TranslatorConfig, legacy_lang: bool) -> Result<ExtractSummary> {
    let paths = &config.paths;
    let options = ExtractOptions {
        source_lang: config.languages.source.clone(),
        target_lang: config.languages.target.clone(),
        legacy_lang,
    };
    archive::extract_mod_langs(
        &paths.mods_dir,
        &paths.source_lang_dir(),
        &paths.target_lang_dir(),
        &options,
    )
    .with_context(|| format!("failed to extract language files from {}", paths.mods_dir.display()))
}

/// Merges the extracted source and target directories.
pub fn merge(config: &TranslatorConfig) -> Result<(MergeSummary, MergeSummary)> {
    let paths = &config.paths;
    let target = langmap::merge_lang_dir(&paths.target_lang_dir(), &paths.merged_target_file())
        .context("failed to merge target language files")?;
    let source = langmap::merge_lang_dir(&paths.source_lang_dir(), &paths.merged_source_file())
        .context("failed to merge source language files")?;
    Ok((source, target))
}

pub fn generate_map(config: &TranslatorConfig) -> Result<LangMapSummary> {
    let paths = &config.paths;
    let extra = paths.exist_translated_file();
    langmap::write_lang_map(
        &paths.merged_source_file(),
        &paths.merged_target_file(),
        &paths.map_file(),
        &paths.untranslated_file(),
        Some(&extra),
    )
    .context("failed to generate the curated translation map")
}

/// Indexes the curated map into the term store. Without `fresh` the existing
/// store (if any) is updated in place.
pub async fn build_index(
    config: &TranslatorConfig,
    embedder: &dyn Embedder,
    map_file: &Path,
    fresh: bool,
) -> Result<RebuildSummary> {
    let curated = json::read_object(map_file)
        .with_context(|| format!("failed to read curated map {}", map_file.display()))?;

    let db_dir = &config.paths.db_dir;
    let mut store = if fresh {
        TermStore::new()
    } else {
        match TermStore::load(db_dir) {
            Ok(store) => store,
            Err(StoreError::Unavailable { reason, .. }) => {
                info!("starting a new term store ({reason})");
                TermStore::new()
            }
            Err(err) => return Err(err).context("failed to open term store"),
        }
    };

    let pairs: Vec<(String, String)> = curated
        .into_iter()
        .filter_map(|(source, target)| match target {
            Value::String(target) => Some((source, target)),
            other => {
                warn!("skipping curated entry '{source}': value is not a string ({other})");
                None
            }
        })
        .collect();

    let summary = store
        .rebuild(pairs, embedder, config.store.upsert_batch_size)
        .await
        .context("failed to index curated map")?;
    store
        .persist(db_dir)
        .with_context(|| format!("failed to persist term store to {}", db_dir.display()))?;
    Ok(summary)
}

/// extract -> merge -> curated map -> index
pub async fn prepare(config: &TranslatorConfig, embedder: &dyn Embedder, legacy_lang: bool) -> Result<PrepareReport> {
    let extract = extract(config, legacy_lang)?;
    let (merged_source, merged_target) = merge(config)?;
    let map = generate_map(config)?;
    let index = build_index(config, embedder, &config.paths.map_file(), false).await?;
    Ok(PrepareReport {
        extract,
        merged_source,
        merged_target,
        map,
        index,
    })
}

/// Opens the term store and builds the pipeline described by `config`.
pub fn open_pipeline(config: &TranslatorConfig, services: &Services) -> Result<Arc<TranslationPipeline>> {
    let pipeline = TranslationPipeline::open(
        &config.paths.db_dir,
        Arc::clone(&services.embedder),
        Arc::clone(&services.generator),
        config.store.relevance_floor,
    )
    .context("term store is not available; run `index` or `prepare` first")?
    .with_prompts(PromptSet::new(config.languages.target_name.clone()).with_minecraft_rules())
    .with_options(PipelineOptions {
        stream: config.provider.stream,
        ..PipelineOptions::default()
    });
    Ok(Arc::new(pipeline))
}

/// Translates a JSON object of untranslated strings. The output file is
/// written, sorted by key, only when every chunk succeeded.
pub async fn translate_json(
    pipeline: Arc<TranslationPipeline>,
    coordinator: BatchCoordinator,
    input: &Path,
    output: &Path,
    sink: &mut dyn ProgressSink,
) -> Result<usize> {
    let units = json::read_object(input)
        .with_context(|| format!("failed to read untranslated units from {}", input.display()))?;

    let translated = match coordinator.run(pipeline, &units, sink).await {
        Ok(translated) => translated,
        Err(failure) => {
            let done = failure.partial.len();
            return Err(failure).with_context(|| {
                format!(
                    "batch aborted after {done} of {} units; {} was not written",
                    units.len(),
                    output.display()
                )
            });
        }
    };

    json::write_pretty(output, &translated)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!("wrote {} translations to {}", translated.len(), output.display());
    let missing = units.len().saturating_sub(translated.len());
    if missing > 0 {
        warn!("{missing} units were left out by the model; run again to translate them");
    }
    Ok(translated.len())
}

/// Extracts guide documents from the mods directory (unless `skip_extract`)
/// and translates each into `<ns>/ae2guide/_<target>/<path>`.
pub async fn translate_guides(
    config: &TranslatorConfig,
    pipeline: Arc<TranslationPipeline>,
    skip_extract: bool,
    sink: &mut dyn ProgressSink,
) -> Result<DocumentReport> {
    let paths = &config.paths;
    let source_dir = paths.guide_source_dir();
    if !skip_extract {
        let summary: GuideSummary = archive::extract_guide_markdown(&paths.mods_dir, &source_dir)
            .context("failed to extract guide documents")?;
        info!("{} guide documents extracted", summary.documents);
    }

    let jobs = guide_jobs(&source_dir, &paths.guide_target_dir(), &config.languages.target)?;
    let coordinator = BatchCoordinator::new(1, config.batch.document_workers);
    coordinator
        .run_documents(pipeline, jobs, sink)
        .await
        .context("guide translation aborted")
}

/// Maps every `<ns>/ae2guide/<path>` document below `source_dir` to
/// `target_dir/<ns>/ae2guide/_<lang>/<path>`.
pub fn guide_jobs(source_dir: &Path, target_dir: &Path, target_lang: &str) -> Result<Vec<DocumentJob>> {
    let mut jobs = Vec::new();
    for source in collect_files(source_dir, "md")? {
        let relative = relative_slash_path(&source, source_dir)?;
        let Some((namespace, rest)) = relative.split_once('/') else {
            warn!("skipping guide document outside a namespace: {relative}");
            continue;
        };
        let guide_path = rest.strip_prefix("ae2guide/").unwrap_or(rest);
        let target = target_dir
            .join(namespace)
            .join("ae2guide")
            .join(format!("_{target_lang}"))
            .join(guide_path);
        jobs.push(DocumentJob {
            label: relative,
            source,
            target,
        });
    }
    Ok(jobs)
}

/// Translates every quest language file (`.snbt`) that has no output yet.
/// Returns the number of files written.
pub async fn translate_quests(
    config: &TranslatorConfig,
    pipeline: Arc<TranslationPipeline>,
    input_dir: &Path,
    output_dir: &Path,
    sink: &mut dyn ProgressSink,
) -> Result<usize> {
    let coordinator = BatchCoordinator::new(config.batch.quest_chunk_size, config.batch.workers);
    let mut written = 0;
    for source in collect_files(input_dir, "snbt")? {
        let relative = relative_slash_path(&source, input_dir)?;
        let target = output_dir.join(&relative);
        if target.exists() {
            info!("skipping {relative}: translation exists");
            continue;
        }

        let units = formats::read_units(&source)
            .with_context(|| format!("failed to read quest file {}", source.display()))?;
        let translated = coordinator
            .run_structured(Arc::clone(&pipeline), &units, sink)
            .await
            .with_context(|| format!("failed to translate {relative}"))?;

        let ordered = complete_in_source_order(&units, &translated);
        formats::write_units(&target, &ordered)
            .with_context(|| format!("failed to write {}", target.display()))?;
        info!("translated {relative}");
        written += 1;
    }
    Ok(written)
}

/// A quest file must stay complete: units the model left out keep their
/// source text. Output follows the source key order.
fn complete_in_source_order(units: &UnitMap, translated: &ResultSet) -> UnitMap {
    let mut ordered = UnitMap::new();
    for (key, source) in units {
        let value = match translated.get(key) {
            Some(value) => value.clone(),
            None => {
                warn!("'{key}' was not translated, keeping source text");
                source.clone()
            }
        };
        ordered.insert(key.clone(), value);
    }
    ordered
}

/// Looks up the `k` curated entries closest to `query`, as `source=target`.
pub async fn search(config: &TranslatorConfig, embedder: Arc<dyn Embedder>, query: &str, k: usize) -> Result<Vec<String>> {
    let store = TermStore::load(&config.paths.db_dir).context("failed to open term store")?;
    let retriever = Retriever::new(Arc::new(store), embedder, config.store.relevance_floor);
    retriever
        .search(query, k)
        .await
        .with_context(|| format!("failed to search for '{query}'"))
}

/// Files with `extension` below `dir`, sorted.
fn collect_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("directory {} does not exist", dir.display());
    }

    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = fs::read_dir(&current).with_context(|| format!("failed to list {}", current.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == extension) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn relative_slash_path(path: &Path, base: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(base)
        .with_context(|| format!("{} is not below {}", path.display(), base.display()))?;
    let parts: Vec<String> = relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}
