/// Configuration for the translation system
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::ai::retry::RetryPolicy;
use crate::ai::OpenAiSettings;
use crate::backup::{backup_and_swap, BackupError};

/// Overrides `provider.apiKey` when set.
pub const API_KEY_ENV: &str = "MODLANG_API_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Failed to write config file: {0}")]
    Write(#[from] BackupError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// 작업 디렉터리 구성. 파생 파일은 모두 `workDir` 아래에 고정된 이름으로 놓입니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathsConfig {
    /// 모드 아카이브(.jar/.zip)가 있는 디렉터리
    pub mods_dir: PathBuf,
    pub work_dir: PathBuf,
    /// 용어 저장소 디렉터리
    pub db_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            mods_dir: PathBuf::from("mods"),
            work_dir: PathBuf::from("work"),
            db_dir: PathBuf::from("work/db"),
        }
    }
}

impl PathsConfig {
    pub fn source_lang_dir(&self) -> PathBuf {
        self.work_dir.join("en")
    }

    pub fn target_lang_dir(&self) -> PathBuf {
        self.work_dir.join("zh")
    }

    pub fn merged_source_file(&self) -> PathBuf {
        self.work_dir.join("merged/merged_output_en.json")
    }

    pub fn merged_target_file(&self) -> PathBuf {
        self.work_dir.join("merged/merged_output_zh.json")
    }

    pub fn map_file(&self) -> PathBuf {
        self.work_dir.join("merged/merged_en2zh.json")
    }

    pub fn untranslated_file(&self) -> PathBuf {
        self.work_dir.join("untranslated.json")
    }

    /// Hand-made translations layered over the extracted target files.
    pub fn exist_translated_file(&self) -> PathBuf {
        self.work_dir.join("exist_translated.json")
    }

    pub fn translated_file(&self) -> PathBuf {
        self.work_dir.join("translated.json")
    }

    pub fn guide_source_dir(&self) -> PathBuf {
        self.work_dir.join("ae2/en")
    }

    pub fn guide_target_dir(&self) -> PathBuf {
        self.work_dir.join("ae2/zh")
    }

    pub fn quest_source_dir(&self, source_lang: &str) -> PathBuf {
        self.work_dir.join("ftbquests/quests/lang").join(source_lang)
    }

    pub fn quest_target_dir(&self, target_lang: &str) -> PathBuf {
        self.work_dir.join("ftbquests/quests/lang").join(target_lang)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LanguagesConfig {
    /// 원문 언어 코드
    pub source: String,
    /// 번역 언어 코드
    pub target: String,
    /// 프롬프트에 쓰이는 번역 언어 이름
    pub target_name: String,
}

impl Default for LanguagesConfig {
    fn default() -> Self {
        Self {
            source: "en_us".to_string(),
            target: "zh_cn".to_string(),
            target_name: "Simplified Chinese".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub embed_base_url: String,
    pub llm_base_url: String,
    pub embed_model: String,
    pub llm_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub embed_dimensions: Option<u32>,
    pub temperature: f32,
    /// 응답을 스트리밍으로 받아 합칩니다
    pub stream: bool,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            embed_base_url: String::new(),
            llm_base_url: String::new(),
            embed_model: "gte-multilingual-base".to_string(),
            llm_model: "gpt-4o".to_string(),
            api_key: None,
            embed_dimensions: Some(768),
            temperature: 0.0,
            stream: false,
            timeout_secs: 120,
            max_retries: 2,
        }
    }
}

impl ProviderConfig {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            ..RetryPolicy::default()
        }
    }

    pub fn embedding_settings(&self) -> OpenAiSettings {
        OpenAiSettings {
            base_url: self.embed_base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.embed_model.clone(),
            temperature: self.temperature,
            dimensions: self.embed_dimensions,
            timeout: Duration::from_secs(self.timeout_secs),
            retry: self.retry_policy(),
        }
    }

    pub fn generation_settings(&self) -> OpenAiSettings {
        OpenAiSettings {
            base_url: self.llm_base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.llm_model.clone(),
            temperature: self.temperature,
            dimensions: None,
            timeout: Duration::from_secs(self.timeout_secs),
            retry: self.retry_policy(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// 임베딩 요청 하나에 담는 최대 용어 수
    pub upsert_batch_size: usize,
    /// 이 점수 이하의 검색 결과는 버립니다
    pub relevance_floor: f32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            upsert_batch_size: 64,
            relevance_floor: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchConfig {
    pub chunk_size: usize,
    pub workers: usize,
    pub document_workers: usize,
    pub quest_chunk_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            workers: 4,
            document_workers: 12,
            quest_chunk_size: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TranslatorConfig {
    pub paths: PathsConfig,
    pub languages: LanguagesConfig,
    pub provider: ProviderConfig,
    pub store: StoreConfig,
    pub batch: BatchConfig,
}

impl TranslatorConfig {
    /// `<config dir>/modlang/config.yaml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("modlang").join("config.yaml"))
    }

    /// Load configuration from a YAML or JSON file (by extension)
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(&content).map_err(|e| e.to_string())
        };

        let mut config: Self = parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.is_file() {
            return Self::load(path);
        }
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Save configuration to YAML file. An existing file is kept as a
    /// timestamped `.bak` copy.
    pub fn to_yaml_file(&self, path: &Path) -> Result<Option<PathBuf>, ConfigError> {
        let content = serde_yaml::to_string(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        let outcome = backup_and_swap(path, content.as_bytes())?;
        Ok(outcome.backup_path)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                self.provider.api_key = Some(key.trim().to_string());
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let batch = &self.batch;
        for (name, value) in [
            ("batch.chunkSize", batch.chunk_size),
            ("batch.workers", batch.workers),
            ("batch.documentWorkers", batch.document_workers),
            ("batch.questChunkSize", batch.quest_chunk_size),
            ("store.upsertBatchSize", self.store.upsert_batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        if !self.store.relevance_floor.is_finite() {
            return Err(ConfigError::Invalid("store.relevanceFloor must be a finite number".into()));
        }
        Ok(())
    }

    /// Checks the endpoints needed by commands that call the model provider.
    pub fn require_provider(&self, generation: bool) -> Result<(), ConfigError> {
        if self.provider.embed_base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("provider.embedBaseUrl is not set".into()));
        }
        if generation && self.provider.llm_base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("provider.llmBaseUrl is not set".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TranslatorConfig::default();
        assert_eq!(config.batch.chunk_size, 100);
        assert_eq!(config.batch.workers, 4);
        assert_eq!(config.batch.document_workers, 12);
        assert_eq!(config.provider.embed_dimensions, Some(768));
        assert_eq!(config.languages.target, "zh_cn");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "paths:\n  workDir: /tmp/pack\nprovider:\n  llmBaseUrl: http://localhost:8000/v1\n  stream: true\nbatch:\n  workers: 8\n",
        )
        .unwrap();

        let config = TranslatorConfig::load(&path).unwrap();
        assert_eq!(config.paths.work_dir, PathBuf::from("/tmp/pack"));
        assert_eq!(config.paths.map_file(), PathBuf::from("/tmp/pack/merged/merged_en2zh.json"));
        assert!(config.provider.stream);
        assert_eq!(config.batch.workers, 8);
        assert_eq!(config.batch.chunk_size, 100);
        assert_eq!(config.provider.embed_model, "gte-multilingual-base");
    }

    #[test]
    fn test_json_serialization() {
        let config = TranslatorConfig::default();
        let json = config.to_json().unwrap();
        assert!(json.contains("\"chunkSize\": 100"));
        let deserialized = TranslatorConfig::from_json(&json).unwrap();
        assert_eq!(deserialized.batch.quest_chunk_size, config.batch.quest_chunk_size);
        assert_eq!(deserialized.languages.target_name, "Simplified Chinese");
    }

    #[test]
    fn test_yaml_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.yaml");
        let mut config = TranslatorConfig::default();
        config.batch.chunk_size = 25;
        assert!(config.to_yaml_file(&path).unwrap().is_none());

        let loaded = TranslatorConfig::load(&path).unwrap();
        assert_eq!(loaded.batch.chunk_size, 25);

        let backup = config.to_yaml_file(&path).unwrap().unwrap();
        assert!(backup.is_file());
    }

    #[test]
    fn test_rejects_zero_sizes() {
        let mut config = TranslatorConfig::default();
        config.batch.workers = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("batch.workers"));
    }

    #[test]
    fn test_provider_requirements() {
        let mut config = TranslatorConfig::default();
        assert!(config.require_provider(false).is_err());
        config.provider.embed_base_url = "http://localhost:9997/v1".into();
        assert!(config.require_provider(false).is_ok());
        assert!(config.require_provider(true).is_err());

        let settings = config.provider.embedding_settings();
        assert_eq!(settings.dimensions, Some(768));
        assert_eq!(settings.timeout, Duration::from_secs(120));
        assert_eq!(config.provider.generation_settings().dimensions, None);
    }

    #[test]
    fn test_malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            TranslatorConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
