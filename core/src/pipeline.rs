//! Retrieval-augmented translation pipeline.
//!
//! A job moves through `extract_keywords -> retrieve -> generate` and is then
//! finished into a [`PipelineOutput`]. Each variant carries its own state
//! record; the stage functions take the job by value and hand it back with
//! the next fields filled in.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::ai::{collect_stream, ChatMessage, Embedder, Generator, GeneratorError};
use crate::prompts::PromptSet;
use crate::repair::{self, RepairError};
use crate::retriever::Retriever;
use crate::store::{StoreError, TermStore};

/// Translation units keyed by opaque identifiers, in source order.
pub type UnitMap = Map<String, Value>;

static MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(?:@[^{}]*|image:[^{}]*)\}").expect("valid marker regex"));

static LIST_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[-*•]|\d+[.)])\s+").expect("valid list marker regex"));

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("generator call failed: {0}")]
    Generator(#[from] GeneratorError),
    #[error(transparent)]
    Output(#[from] RepairError),
    #[error("failed to serialize pipeline input: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Retrieval depth per variant and the generation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub map_k: usize,
    pub document_k: usize,
    pub structured_unit_k: usize,
    pub structured_keyword_k: usize,
    /// Consume the generator's fragment stream instead of a single answer.
    pub stream: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            map_k: 3,
            document_k: 5,
            structured_unit_k: 3,
            structured_keyword_k: 5,
            stream: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapState {
    pub question: UnitMap,
    pub words_to_search: Vec<String>,
    pub context: BTreeSet<String>,
    pub answer: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentState {
    pub document: String,
    pub words_to_search: Vec<String>,
    pub context: BTreeSet<String>,
    pub answer: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredState {
    pub input: UnitMap,
    /// Terms named by the extraction call; unit strings are queried separately.
    pub words_to_search: Vec<String>,
    pub context: BTreeSet<String>,
    pub answer: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineJob {
    PlainMap(MapState),
    Document(DocumentState),
    Structured(StructuredState),
}

impl PipelineJob {
    pub fn plain_map(question: UnitMap) -> Self {
        PipelineJob::PlainMap(MapState {
            question,
            ..MapState::default()
        })
    }

    pub fn document(document: impl Into<String>) -> Self {
        PipelineJob::Document(DocumentState {
            document: document.into(),
            ..DocumentState::default()
        })
    }

    pub fn structured(input: UnitMap) -> Self {
        PipelineJob::Structured(StructuredState {
            input,
            ..StructuredState::default()
        })
    }

    fn is_empty(&self) -> bool {
        match self {
            PipelineJob::PlainMap(state) => state.question.is_empty(),
            PipelineJob::Document(state) => state.document.trim().is_empty(),
            PipelineJob::Structured(state) => state.input.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutput {
    Map(UnitMap),
    Document(String),
}

pub struct TranslationPipeline {
    retriever: Retriever,
    generator: Arc<dyn Generator>,
    prompts: PromptSet,
    options: PipelineOptions,
}

impl TranslationPipeline {
    pub fn new(retriever: Retriever, generator: Arc<dyn Generator>) -> Self {
        Self {
            retriever,
            generator,
            prompts: PromptSet::default(),
            options: PipelineOptions::default(),
        }
    }

    /// Loads the persisted term store from `db_dir` and wires it up.
    pub fn open(
        db_dir: &Path,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        relevance_floor: f32,
    ) -> Result<Self, PipelineError> {
        let store = TermStore::load(db_dir)?;
        let retriever = Retriever::new(Arc::new(store), embedder, relevance_floor);
        Ok(Self::new(retriever, generator))
    }

    pub fn with_prompts(mut self, prompts: PromptSet) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn run(&self, job: PipelineJob) -> Result<PipelineOutput, PipelineError> {
        if job.is_empty() {
            return Ok(match job {
                PipelineJob::PlainMap(state) => PipelineOutput::Map(state.question),
                PipelineJob::Document(state) => PipelineOutput::Document(state.document),
                PipelineJob::Structured(state) => PipelineOutput::Map(state.input),
            });
        }

        let job = self.extract_keywords(job).await?;
        let job = self.retrieve(job).await?;
        let job = self.generate(job).await?;
        finish(job)
    }

    pub async fn translate_map(&self, units: UnitMap) -> Result<UnitMap, PipelineError> {
        match self.run(PipelineJob::plain_map(units)).await? {
            PipelineOutput::Map(map) => Ok(map),
            PipelineOutput::Document(text) => Err(unexpected_document(&text)),
        }
    }

    pub async fn translate_structured(&self, units: UnitMap) -> Result<UnitMap, PipelineError> {
        match self.run(PipelineJob::structured(units)).await? {
            PipelineOutput::Map(map) => Ok(map),
            PipelineOutput::Document(text) => Err(unexpected_document(&text)),
        }
    }

    pub async fn translate_document(&self, document: String) -> Result<String, PipelineError> {
        match self.run(PipelineJob::document(document)).await? {
            PipelineOutput::Document(text) => Ok(text),
            PipelineOutput::Map(map) => Ok(Value::Object(map).to_string()),
        }
    }

    /// Asks the model for the salient terms of the input. The plain-map
    /// variant has no extraction step; its values are the queries.
    pub async fn extract_keywords(&self, job: PipelineJob) -> Result<PipelineJob, PipelineError> {
        match job {
            PipelineJob::PlainMap(mut state) => {
                state.words_to_search = unit_strings(&state.question);
                Ok(PipelineJob::PlainMap(state))
            }
            PipelineJob::Document(mut state) => {
                let messages = self.prompts.keyword_extraction(&state.document);
                state.words_to_search = parse_keywords(&self.call(&messages).await?);
                debug!("extracted {} keywords from document", state.words_to_search.len());
                Ok(PipelineJob::Document(state))
            }
            PipelineJob::Structured(mut state) => {
                let document = unit_strings(&state.input).join("\n");
                let messages = self.prompts.keyword_extraction(&document);
                state.words_to_search = parse_keywords(&self.call(&messages).await?);
                debug!("extracted {} keywords from structured unit", state.words_to_search.len());
                Ok(PipelineJob::Structured(state))
            }
        }
    }

    pub async fn retrieve(&self, job: PipelineJob) -> Result<PipelineJob, PipelineError> {
        let options = self.options;
        match job {
            PipelineJob::PlainMap(mut state) => {
                state.context = self
                    .retriever
                    .search_many(&state.words_to_search, options.map_k)
                    .await?;
                Ok(PipelineJob::PlainMap(state))
            }
            PipelineJob::Document(mut state) => {
                let mut context = self
                    .retriever
                    .search(&state.document, options.document_k)
                    .await?
                    .into_iter()
                    .collect::<BTreeSet<_>>();
                context.extend(
                    self.retriever
                        .search_many(&state.words_to_search, options.document_k)
                        .await?,
                );
                state.context = context;
                Ok(PipelineJob::Document(state))
            }
            PipelineJob::Structured(mut state) => {
                let mut context = self
                    .retriever
                    .search_many(unit_strings(&state.input), options.structured_unit_k)
                    .await?;
                context.extend(
                    self.retriever
                        .search_many(&state.words_to_search, options.structured_keyword_k)
                        .await?,
                );
                state.context = context;
                Ok(PipelineJob::Structured(state))
            }
        }
    }

    pub async fn generate(&self, job: PipelineJob) -> Result<PipelineJob, PipelineError> {
        match job {
            PipelineJob::PlainMap(mut state) => {
                let question = serde_json::to_string_pretty(&state.question)?;
                let messages = self.prompts.translate_map(&question, &state.context);
                state.answer = Some(self.call(&messages).await?);
                Ok(PipelineJob::PlainMap(state))
            }
            PipelineJob::Document(mut state) => {
                let messages = self.prompts.translate_document(&state.document, &state.context);
                state.answer = Some(self.call(&messages).await?);
                Ok(PipelineJob::Document(state))
            }
            PipelineJob::Structured(mut state) => {
                let question = serde_json::to_string_pretty(&state.input)?;
                let messages = self.prompts.translate_structured(&question, &state.context);
                state.answer = Some(self.call(&messages).await?);
                Ok(PipelineJob::Structured(state))
            }
        }
    }

    async fn call(&self, messages: &[ChatMessage]) -> Result<String, GeneratorError> {
        debug!(
            "calling {} with {} prompt characters",
            self.generator.name(),
            messages.iter().map(|message| message.content.len()).sum::<usize>()
        );
        if self.options.stream {
            let stream = self.generator.generate_stream(messages).await?;
            collect_stream(stream).await
        } else {
            self.generator.generate(messages).await
        }
    }
}

/// Turns a generated job into its output.
pub fn finish(job: PipelineJob) -> Result<PipelineOutput, PipelineError> {
    match job {
        PipelineJob::PlainMap(state) => {
            let answer = state.answer.unwrap_or_default();
            let parsed = repair::parse(&answer)?;
            Ok(PipelineOutput::Map(reconcile(&state.question, parsed, &answer)?))
        }
        PipelineJob::Document(state) => {
            let answer = state.answer.unwrap_or_default();
            Ok(PipelineOutput::Document(repair::strip_code_fence(&answer).to_string()))
        }
        PipelineJob::Structured(state) => {
            let answer = state.answer.unwrap_or_default();
            let parsed = repair::parse(&answer)?;
            Ok(PipelineOutput::Map(reconcile(&state.input, parsed, &answer)?))
        }
    }
}

/// Re-keys a parsed answer against the input, in input order. Unknown keys
/// are dropped and keys the model omitted stay absent, so a later run picks
/// them up again. Values whose shape changed, or whose marker-only list
/// elements moved, keep the source value.
pub fn reconcile(input: &UnitMap, parsed: Value, answer: &str) -> Result<UnitMap, RepairError> {
    let Value::Object(mut translated) = parsed else {
        return Err(RepairError::unrecoverable("answer is not a JSON object", answer));
    };
    if !input.is_empty() && !input.keys().any(|key| translated.contains_key(key)) {
        return Err(RepairError::unrecoverable("answer shares no key with the input", answer));
    }

    let mut output = UnitMap::new();
    let mut omitted = Vec::new();
    for (key, source) in input {
        let value = match translated.remove(key) {
            Some(value) if same_shape(source, &value) => value,
            Some(value) => {
                if &value != source {
                    warn!("'{key}': translated value changed shape or moved markers, keeping source text");
                }
                source.clone()
            }
            None => {
                omitted.push(key.as_str());
                continue;
            }
        };
        output.insert(key.clone(), value);
    }

    if !omitted.is_empty() {
        warn!("{} keys missing from model answer, left untranslated: {:?}", omitted.len(), omitted);
    }
    if !translated.is_empty() {
        let invented: Vec<&str> = translated.keys().map(String::as_str).collect();
        warn!("dropping {} keys not present in the input: {:?}", invented.len(), invented);
    }
    Ok(output)
}

fn same_shape(source: &Value, translated: &Value) -> bool {
    match (source, translated) {
        (Value::String(source), Value::String(translated)) => keeps_markers(source, translated),
        (Value::Array(source), Value::Array(translated)) => {
            source.len() == translated.len()
                && source.iter().zip(translated).all(|(source, translated)| {
                    match (source.as_str(), translated.as_str()) {
                        (Some(source), Some(translated)) => keeps_markers(source, translated),
                        (None, _) => source == translated,
                        (Some(_), None) => false,
                    }
                })
        }
        _ => false,
    }
}

/// Text that is blank or made only of markup such as `{@pagebreak}` or
/// `{image:...}` must come back unchanged.
fn keeps_markers(source: &str, translated: &str) -> bool {
    !is_marker_only(source) || source == translated
}

fn is_marker_only(text: &str) -> bool {
    MARKER.replace_all(text, "").trim().is_empty()
}

/// Every string in a unit map, list elements included, in order.
pub fn unit_strings(units: &UnitMap) -> Vec<String> {
    let mut strings = Vec::new();
    for value in units.values() {
        match value {
            Value::String(text) => strings.push(text.clone()),
            Value::Array(items) => strings.extend(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string),
            ),
            _ => {}
        }
    }
    strings
}

/// One term per line; list markers and blank lines are dropped.
pub fn parse_keywords(answer: &str) -> Vec<String> {
    repair::strip_code_fence(answer)
        .lines()
        .map(|line| LIST_MARKER.replace(line.trim(), "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

fn unexpected_document(text: &str) -> PipelineError {
    PipelineError::Output(RepairError::unrecoverable("expected a JSON object", text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{user_text, HashingEmbedder, ScriptedGenerator};
    use serde_json::json;

    async fn retriever_with(pairs: &[(&str, &str)]) -> Retriever {
        let embedder = Arc::new(HashingEmbedder::default());
        let mut store = TermStore::new();
        store
            .rebuild(
                pairs.iter().map(|(s, t)| (s.to_string(), t.to_string())),
                embedder.as_ref(),
                8,
            )
            .await
            .unwrap();
        Retriever::new(Arc::new(store), embedder, 0.0)
    }

    fn units(value: Value) -> UnitMap {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn is_extraction(messages: &[ChatMessage]) -> bool {
        messages[0].content.contains("entity extraction")
    }

    #[tokio::test]
    async fn ender_pearl_scenario() {
        let retriever = retriever_with(&[("Ender Pearl", "末影珍珠"), ("Iron Ingot", "铁锭")]).await;
        let generator = Arc::new(ScriptedGenerator::new(|messages| {
            assert!(user_text(messages).contains("Ender Pearl=末影珍珠"));
            Ok("```json\n{\"item.mod.pearl\": \"一颗神奇的末影珍珠。\"}\n```".into())
        }));
        let pipeline = TranslationPipeline::new(retriever, generator.clone());

        let job = PipelineJob::plain_map(units(json!({"item.mod.pearl": "A magical Ender Pearl."})));
        let job = pipeline.extract_keywords(job).await.unwrap();
        let job = pipeline.retrieve(job).await.unwrap();
        let PipelineJob::PlainMap(state) = &job else {
            panic!("variant changed");
        };
        assert_eq!(state.words_to_search, vec!["A magical Ender Pearl.".to_string()]);
        assert!(state.context.contains("Ender Pearl=末影珍珠"));

        let output = finish(pipeline.generate(job).await.unwrap()).unwrap();
        let PipelineOutput::Map(map) = output else {
            panic!("expected map output");
        };
        assert!(map["item.mod.pearl"].as_str().unwrap().contains("末影珍珠"));
        assert_eq!(generator.prompts().len(), 1);
    }

    #[tokio::test]
    async fn streaming_mode_matches_single_answer() {
        let answer = "{\"a\": \"末影珍珠\", \"b\": \"铁锭\"}";
        let input = units(json!({"a": "Ender Pearl", "b": "Iron Ingot"}));
        let mut results = Vec::new();
        for stream in [false, true] {
            let retriever = retriever_with(&[("Ender Pearl", "末影珍珠")]).await;
            let generator = Arc::new(ScriptedGenerator::new(move |_| Ok(answer.to_string())));
            let pipeline = TranslationPipeline::new(retriever, generator).with_options(PipelineOptions {
                stream,
                ..PipelineOptions::default()
            });
            results.push(pipeline.translate_map(input.clone()).await.unwrap());
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0]["b"], json!("铁锭"));
    }

    #[tokio::test]
    async fn document_variant_extracts_then_translates() {
        let retriever = retriever_with(&[("Ender Pearl", "末影珍珠"), ("Charger", "充能器")]).await;
        let generator = Arc::new(ScriptedGenerator::new(|messages| {
            if is_extraction(messages) {
                Ok("- Ender Pearl\n* Charger\n\n".into())
            } else {
                assert!(user_text(messages).contains("Charger=充能器"));
                Ok("```markdown\n# 在充能器中放入末影珍珠\n```".into())
            }
        }));
        let pipeline = TranslationPipeline::new(retriever, generator.clone());

        let job = pipeline
            .extract_keywords(PipelineJob::document("# Put an Ender Pearl in the Charger"))
            .await
            .unwrap();
        let PipelineJob::Document(state) = &job else {
            panic!("variant changed");
        };
        assert_eq!(state.words_to_search, vec!["Ender Pearl", "Charger"]);

        let translated = pipeline
            .translate_document("# Put an Ender Pearl in the Charger".into())
            .await
            .unwrap();
        assert_eq!(translated, "# 在充能器中放入末影珍珠");
        assert_eq!(generator.prompts().len(), 3);
    }

    #[tokio::test]
    async fn structured_variant_preserves_keys_and_list_shape() {
        let retriever = retriever_with(&[("Ender Pearl", "末影珍珠")]).await;
        let generator = Arc::new(ScriptedGenerator::new(|messages| {
            if is_extraction(messages) {
                return Ok("Ender Pearl".into());
            }
            Ok(r#"{
                "quest.title": "末影珍珠",
                "quest.desc": ["第一行", "", "{@pagebreak}"],
                "quest.extra": "invented"
            }"#
            .into())
        }));
        let pipeline = TranslationPipeline::new(retriever, generator);

        let input = units(json!({
            "quest.title": "Ender Pearl",
            "quest.desc": ["First line", "", "{@pagebreak}"],
            "quest.subtitle": "Missing from answer"
        }));
        let output = pipeline.translate_structured(input.clone()).await.unwrap();

        let keys: Vec<&str> = output.keys().map(String::as_str).collect();
        assert_eq!(keys, ["quest.title", "quest.desc"]);
        assert_eq!(output["quest.desc"], json!(["第一行", "", "{@pagebreak}"]));
        assert!(!output.contains_key("quest.subtitle"));
        assert!(!output.contains_key("quest.extra"));
    }

    #[tokio::test]
    async fn structured_variant_keeps_source_when_markers_move() {
        let retriever = retriever_with(&[("Ender Pearl", "末影珍珠")]).await;
        let generator = Arc::new(ScriptedGenerator::new(|messages| {
            if is_extraction(messages) {
                return Ok("Line".into());
            }
            Ok(r#"{"d": ["行", "{@pagebreak}", ""], "e": ["{image:ae2:textures/guide/a.png}", "图"]}"#.into())
        }));
        let pipeline = TranslationPipeline::new(retriever, generator);

        let input = units(json!({
            "d": ["Line", "", "{@pagebreak}"],
            "e": ["{image:ae2:textures/guide/a.png}", "Picture"]
        }));
        let output = pipeline.translate_structured(input).await.unwrap();

        assert_eq!(output["d"], json!(["Line", "", "{@pagebreak}"]));
        assert_eq!(output["e"], json!(["{image:ae2:textures/guide/a.png}", "图"]));
    }

    #[test]
    fn marker_only_text() {
        assert!(is_marker_only(""));
        assert!(is_marker_only(" {@pagebreak} "));
        assert!(is_marker_only("{image:ae2:a.png width=64}{@pagebreak}"));
        assert!(!is_marker_only("Press {@key} to open"));
        assert!(!is_marker_only("Line"));
    }

    #[test]
    fn reconcile_leaves_omitted_keys_out() {
        let input = units(json!({"a": "Ender Pearl", "b": "Charger"}));
        let output = reconcile(&input, json!({"a": "末影珍珠"}), "").unwrap();
        assert_eq!(Value::Object(output), json!({"a": "末影珍珠"}));
    }

    #[test]
    fn reconcile_keeps_source_on_shape_change() {
        let input = units(json!({"a": ["x", "y"], "b": "text"}));
        let parsed = json!({"a": ["only one"], "b": ["not", "a", "string"]});
        let output = reconcile(&input, parsed, "").unwrap();
        assert_eq!(Value::Object(output), json!({"a": ["x", "y"], "b": "text"}));
    }

    #[test]
    fn reconcile_rejects_unrelated_answers() {
        let input = units(json!({"a": "text"}));
        assert!(reconcile(&input, json!(["a"]), "[\"a\"]").is_err());
        assert!(reconcile(&input, json!({"z": "other"}), "").is_err());
    }

    #[tokio::test]
    async fn unrecoverable_answer_fails_the_job() {
        let retriever = retriever_with(&[]).await;
        let generator = Arc::new(ScriptedGenerator::new(|_| Ok("Sorry, I cannot help.".into())));
        let pipeline = TranslationPipeline::new(retriever, generator);

        let err = pipeline
            .translate_map(units(json!({"a": "text"})))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Output(_)));
    }

    #[tokio::test]
    async fn generator_failure_propagates() {
        let retriever = retriever_with(&[]).await;
        let generator = Arc::new(ScriptedGenerator::new(|_| {
            Err(GeneratorError::Http {
                status: 500,
                message: "upstream down".into(),
            })
        }));
        let pipeline = TranslationPipeline::new(retriever, generator);

        let err = pipeline
            .translate_map(units(json!({"a": "text"})))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Generator(GeneratorError::Http { status: 500, .. })));
    }

    #[tokio::test]
    async fn empty_input_skips_the_generator() {
        let retriever = retriever_with(&[]).await;
        let generator = Arc::new(ScriptedGenerator::new(|_| Ok("{}".into())));
        let pipeline = TranslationPipeline::new(retriever, generator.clone());

        assert!(pipeline.translate_map(UnitMap::new()).await.unwrap().is_empty());
        assert_eq!(pipeline.translate_document("  ".into()).await.unwrap(), "  ");
        assert!(generator.prompts().is_empty());
    }

    #[test]
    fn keywords_drop_markers_and_blank_lines() {
        let answer = "```\n1. Ender Pearl\n2) Charger\n  - Quartz Fiber  \n\n• Sky Stone\nInscriber\n```";
        assert_eq!(
            parse_keywords(answer),
            vec!["Ender Pearl", "Charger", "Quartz Fiber", "Sky Stone", "Inscriber"]
        );
    }

    #[test]
    fn unit_strings_flattens_lists() {
        let input = units(json!({"a": "one", "b": ["two", "three"], "c": 4}));
        assert_eq!(unit_strings(&input), vec!["one", "two", "three"]);
    }
}
