//! End-to-end tests over a temporary work directory:
//! curated map -> term store -> batch translation -> output file.
//! Model calls are served by the deterministic stand-ins in `testing`.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use modlang_core::ai::GeneratorError;
use modlang_core::formats::json;
use modlang_core::job::{BatchCoordinator, Progress, ProgressSink, ResultSet};
use modlang_core::jobs::{self, Services};
use modlang_core::testing::{user_text, HashingEmbedder, ScriptedGenerator};
use modlang_core::{TermStore, TranslatorConfig, UnitMap};
use tempfile::TempDir;

#[derive(Default)]
struct RecordingSink {
    chunks: Vec<Progress>,
    finished: Option<usize>,
}

impl ProgressSink for RecordingSink {
    fn chunk_completed(&mut self, _chunk: &UnitMap, progress: Progress) {
        self.chunks.push(progress);
    }

    fn finished(&mut self, aggregate: &ResultSet) {
        self.finished = Some(aggregate.len());
    }
}

fn workspace() -> (TempDir, TranslatorConfig) {
    let dir = TempDir::new().unwrap();
    let mut config = TranslatorConfig::default();
    config.paths.work_dir = dir.path().join("work");
    config.paths.db_dir = dir.path().join("work/db");

    let merged = config.paths.merged_source_file();
    fs::create_dir_all(merged.parent().unwrap()).unwrap();
    fs::write(
        &merged,
        r#"{
            "item.mod.pearl": "A magical Ender Pearl.",
            "item.mod.charger": "Charger",
            "item.ender_pearl": "Ender Pearl",
            "item.iron": "Iron Ingot"
        }"#,
    )
    .unwrap();
    fs::write(
        config.paths.merged_target_file(),
        r#"{
            "item.ender_pearl": "末影珍珠",
            "item.iron": "铁锭",
            "item.mod.charger": "Charger"
        }"#,
    )
    .unwrap();
    (dir, config)
}

fn services(generator: ScriptedGenerator) -> (Services, Arc<ScriptedGenerator>) {
    let generator = Arc::new(generator);
    let services = Services {
        embedder: Arc::new(HashingEmbedder::default()),
        generator: generator.clone(),
    };
    (services, generator)
}

fn translator() -> ScriptedGenerator {
    ScriptedGenerator::new(|messages| {
        let prompt = user_text(messages);
        if prompt.contains("item.mod.pearl") {
            Ok("```json\n{\"item.mod.pearl\": \"一颗神奇的末影珍珠。\"}\n```".into())
        } else {
            Ok(r#"{"item.mod.charger": "充能器"}"#.into())
        }
    })
}

#[tokio::test]
async fn test_e2e_curated_map_to_translated_file() {
    let (_dir, mut config) = workspace();
    config.provider.stream = true;
    let (services, generator) = services(translator());

    let map = jobs::generate_map(&config).unwrap();
    assert_eq!((map.curated, map.untranslated), (2, 2));

    let summary = jobs::build_index(&config, services.embedder.as_ref(), &config.paths.map_file(), false)
        .await
        .unwrap();
    assert_eq!(summary.inserted, 2);

    let pipeline = jobs::open_pipeline(&config, &services).unwrap();
    let output = config.paths.translated_file();
    let mut sink = RecordingSink::default();
    let written = jobs::translate_json(
        pipeline,
        BatchCoordinator::new(1, 2),
        &config.paths.untranslated_file(),
        &output,
        &mut sink,
    )
    .await
    .unwrap();

    assert_eq!(written, 2);
    assert_eq!(sink.chunks.len(), 2);
    assert_eq!(sink.chunks.last().unwrap().processed, 2);
    assert_eq!(sink.finished, Some(2));

    let translated = json::read_object(&output).unwrap();
    let keys: Vec<&str> = translated.keys().map(String::as_str).collect();
    assert_eq!(keys, ["item.mod.charger", "item.mod.pearl"]);
    assert_eq!(translated["item.mod.pearl"], "一颗神奇的末影珍珠。");
    assert_eq!(translated["item.mod.charger"], "充能器");

    let pearl_prompt = generator
        .prompts()
        .into_iter()
        .find(|prompt| user_text(prompt).contains("item.mod.pearl"))
        .unwrap();
    assert!(user_text(&pearl_prompt).contains("Ender Pearl=末影珍珠"));
}

#[tokio::test]
async fn test_e2e_failed_batch_writes_nothing() {
    let (_dir, config) = workspace();
    let (services, _) = services(ScriptedGenerator::new(|messages| {
        if user_text(messages).contains("item.mod.charger") {
            Err(GeneratorError::InvalidResponse("model unavailable".into()))
        } else {
            Ok(r#"{"item.mod.pearl": "末影珍珠"}"#.into())
        }
    }));

    jobs::generate_map(&config).unwrap();
    jobs::build_index(&config, services.embedder.as_ref(), &config.paths.map_file(), true)
        .await
        .unwrap();

    let pipeline = jobs::open_pipeline(&config, &services).unwrap();
    let output = config.paths.translated_file();
    let result = jobs::translate_json(
        pipeline,
        BatchCoordinator::new(1, 1),
        &config.paths.untranslated_file(),
        &output,
        &mut RecordingSink::default(),
    )
    .await;

    assert!(result.is_err());
    assert!(!output.exists());
}

#[test]
fn test_e2e_rebuilding_the_index_is_idempotent() {
    let (_dir, config) = workspace();
    jobs::generate_map(&config).unwrap();
    let embedder = HashingEmbedder::default();
    let map = config.paths.map_file();

    let index = |fresh: bool| tokio_test::block_on(jobs::build_index(&config, &embedder, &map, fresh)).unwrap();
    let queries = ["Ender Pearl", "Iron Ingot", "A magical Ender Pearl."];
    let lookup = || -> Vec<Vec<String>> {
        queries
            .iter()
            .map(|query| {
                let embedder = Arc::new(HashingEmbedder::default());
                tokio_test::block_on(jobs::search(&config, embedder, query, 3)).unwrap()
            })
            .collect()
    };

    let first = index(false);
    let after_first = lookup();
    let second = index(false);
    let after_second = lookup();
    assert_eq!((first.inserted, first.replaced), (2, 0));
    assert_eq!((second.inserted, second.replaced), (0, 2));
    assert_eq!(after_first[0][0], "Ender Pearl=末影珍珠");
    assert_eq!(after_first[1][0], "Iron Ingot=铁锭");
    assert_eq!(after_first, after_second);

    let store = TermStore::load(&config.paths.db_dir).unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(store.get("Ender Pearl").unwrap().content, "Ender Pearl=末影珍珠");

    let fresh = index(true);
    assert_eq!((fresh.inserted, fresh.replaced), (2, 0));
    assert_eq!(lookup(), after_first);
}

#[test]
fn test_e2e_missing_store_is_reported() {
    let (_dir, config) = workspace();
    let (services, _) = services(translator());
    assert!(!Path::new(&config.paths.db_dir).exists());
    assert!(jobs::open_pipeline(&config, &services).is_err());
}
