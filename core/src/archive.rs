//! ZIP/JAR 아카이브 파일 처리 모듈
//!
//! 모드 아카이브(.jar/.zip) 안의 언어 파일과 가이드 문서(markdown)를
//! 작업 디렉터리로 추출합니다. 손상된 아카이브나 엔트리는 경고만 남기고
//! 건너뜁니다.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use log::{info, warn};
use zip::read::ZipArchive;

use crate::backup::{write_atomic, BackupError};
use crate::formats::{self, json, FileFormat, FormatError};

/// 아카이브 처리 결과 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Mods directory not found: {0}")]
    NotFound(String),

    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Write error: {0}")]
    Write(#[from] BackupError),
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// 언어 파일 추출 옵션
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// 원문 언어 코드 (예: "en_us")
    pub source_lang: String,
    /// 번역 언어 코드 (예: "zh_cn")
    pub target_lang: String,
    /// `.json` 대신 레거시 `.lang` 파일을 읽어 JSON 으로 변환
    pub legacy_lang: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            source_lang: "en_us".to_string(),
            target_lang: "zh_cn".to_string(),
            legacy_lang: false,
        }
    }
}

impl ExtractOptions {
    fn suffix(&self) -> &'static str {
        if self.legacy_lang {
            ".lang"
        } else {
            ".json"
        }
    }
}

/// 추출 결과 요약
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub archives: usize,
    pub skipped_archives: usize,
    pub source_files: usize,
    pub target_files: usize,
    pub failed_entries: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuideSummary {
    pub archives: usize,
    pub skipped_archives: usize,
    pub documents: usize,
    pub skipped_translations: usize,
    pub failed_entries: usize,
}

/// 아카이브 파일인지 확인
pub fn is_archive_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_lowercase().as_str(), "jar" | "zip"))
        .unwrap_or(false)
}

/// `mods_dir` 바로 아래의 아카이브 목록 (하위 디렉터리는 보지 않음, 이름순)
pub fn list_archives(mods_dir: &Path) -> ArchiveResult<Vec<PathBuf>> {
    if !mods_dir.is_dir() {
        return Err(ArchiveError::NotFound(mods_dir.display().to_string()));
    }

    let mut archives = Vec::new();
    for entry in fs::read_dir(mods_dir)? {
        let path = entry?.path();
        if path.is_file() && is_archive_file(&path) {
            archives.push(path);
        }
    }
    archives.sort();
    Ok(archives)
}

/// `assets/*lang/<code><suffix>` 형태의 엔트리면 `lang` 상위 디렉터리 이름
/// (네임스페이스)을 돌려줍니다.
pub fn lang_entry_namespace(entry_path: &str, lang_code: &str, suffix: &str) -> Option<String> {
    if !entry_path.starts_with("assets/") {
        return None;
    }
    let file_name = format!("lang/{lang_code}{suffix}");
    if !entry_path.ends_with(&file_name) {
        return None;
    }

    Path::new(entry_path)
        .parent()?
        .parent()?
        .file_name()?
        .to_str()
        .map(str::to_string)
}

/// 가이드 엔트리 분류
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuideEntry {
    /// 원문 문서; 값은 `assets/` 를 뗀 출력 경로
    Document(String),
    /// 밑줄로 시작하는 가이드 경로 (기존 번역본)
    Translation,
}

/// `assets/<ns>/ae2guide/**.md` 엔트리를 분류합니다. 가이드 문서가 아니면 `None`.
pub fn classify_guide_entry(entry_path: &str) -> Option<GuideEntry> {
    let relative = entry_path.strip_prefix("assets/")?;
    if !relative.ends_with(".md") {
        return None;
    }
    let (_, guide_path) = relative.split_once("/ae2guide/")?;
    if guide_path.starts_with('_') {
        return Some(GuideEntry::Translation);
    }
    Some(GuideEntry::Document(relative.to_string()))
}

/// 모든 모드 아카이브에서 원문/번역 언어 파일을 `<dir>/<namespace>.json` 으로 추출
pub fn extract_mod_langs(
    mods_dir: &Path,
    source_dir: &Path,
    target_dir: &Path,
    options: &ExtractOptions,
) -> ArchiveResult<ExtractSummary> {
    fs::create_dir_all(source_dir)?;
    fs::create_dir_all(target_dir)?;

    let mut summary = ExtractSummary::default();
    let suffix = options.suffix();
    for archive_path in list_archives(mods_dir)? {
        let mut archive = match open_archive(&archive_path) {
            Ok(archive) => archive,
            Err(err) => {
                warn!("skipping unreadable archive {}: {err}", archive_path.display());
                summary.skipped_archives += 1;
                continue;
            }
        };
        summary.archives += 1;

        for index in 0..archive.len() {
            let Some(name) = entry_name(&mut archive, index) else {
                continue;
            };

            let (namespace, out_dir, is_source) =
                if let Some(ns) = lang_entry_namespace(&name, &options.source_lang, suffix) {
                    (ns, source_dir, true)
                } else if let Some(ns) = lang_entry_namespace(&name, &options.target_lang, suffix) {
                    (ns, target_dir, false)
                } else {
                    continue;
                };

            let output = out_dir.join(format!("{namespace}.json"));
            match extract_lang_entry(&mut archive, index, &name, &output) {
                Ok(()) => {
                    info!("extracted {name} -> {}", output.display());
                    if is_source {
                        summary.source_files += 1;
                    } else {
                        summary.target_files += 1;
                    }
                }
                Err(err) => {
                    warn!("failed to extract {name} from {}: {err}", archive_path.display());
                    summary.failed_entries += 1;
                }
            }
        }
    }

    info!(
        "extracted {} source and {} target language files from {} archives",
        summary.source_files, summary.target_files, summary.archives
    );
    Ok(summary)
}

/// 가이드 문서(markdown) 원문을 `out_dir/<namespace>/ae2guide/...` 로 추출
pub fn extract_guide_markdown(mods_dir: &Path, out_dir: &Path) -> ArchiveResult<GuideSummary> {
    fs::create_dir_all(out_dir)?;

    let mut summary = GuideSummary::default();
    for archive_path in list_archives(mods_dir)? {
        let mut archive = match open_archive(&archive_path) {
            Ok(archive) => archive,
            Err(err) => {
                warn!("skipping unreadable archive {}: {err}", archive_path.display());
                summary.skipped_archives += 1;
                continue;
            }
        };
        summary.archives += 1;

        for index in 0..archive.len() {
            let Some(name) = entry_name(&mut archive, index) else {
                continue;
            };
            let relative = match classify_guide_entry(&name) {
                Some(GuideEntry::Document(relative)) => relative,
                Some(GuideEntry::Translation) => {
                    summary.skipped_translations += 1;
                    continue;
                }
                None => continue,
            };

            let output = out_dir.join(&relative);
            let written = read_entry_string(&mut archive, index)
                .and_then(|content| write_atomic(&output, content.as_bytes()).map_err(ArchiveError::from));
            match written {
                Ok(_) => summary.documents += 1,
                Err(err) => {
                    warn!("failed to extract {name} from {}: {err}", archive_path.display());
                    summary.failed_entries += 1;
                }
            }
        }
    }

    info!(
        "extracted {} guide documents from {} archives",
        summary.documents, summary.archives
    );
    Ok(summary)
}

fn open_archive(path: &Path) -> ArchiveResult<ZipArchive<File>> {
    let file = File::open(path)?;
    Ok(ZipArchive::new(file)?)
}

fn entry_name(archive: &mut ZipArchive<File>, index: usize) -> Option<String> {
    let entry = archive.by_index(index).ok()?;
    if entry.is_dir() {
        return None;
    }
    Some(entry.name().to_string())
}

/// 선할당 상한. 헤더의 크기 값은 신뢰할 수 없으므로 나머지는 읽으면서 늘린다.
const MAX_PREALLOC: usize = 1024 * 1024;

fn initial_capacity(declared: u64) -> usize {
    usize::try_from(declared).map_or(MAX_PREALLOC, |size| size.min(MAX_PREALLOC))
}

/// 엔트리 내용을 문자열로 읽기 (UTF-8 BOM 제거)
fn read_entry_string(archive: &mut ZipArchive<File>, index: usize) -> ArchiveResult<String> {
    let mut entry = archive.by_index(index)?;
    let mut bytes = Vec::with_capacity(initial_capacity(entry.size()));
    entry.read_to_end(&mut bytes)?;

    let content = String::from_utf8(bytes)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(formats::strip_bom(&content).to_string())
}

fn extract_lang_entry(
    archive: &mut ZipArchive<File>,
    index: usize,
    name: &str,
    output: &Path,
) -> ArchiveResult<()> {
    let content = read_entry_string(archive, index)?;
    let format = FileFormat::from_path(Path::new(name));
    let handler = formats::get_handler(format)
        .ok_or_else(|| FormatError::UnsupportedFormat(format!("{format:?}")))?;
    let units = handler.parse(&content)?;
    json::write_pretty(output, &units)?;
    Ok(())
}
