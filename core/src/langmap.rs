//! Merging of per-mod language files and derivation of the curated
//! source-to-target term map.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde_json::Value;

use crate::formats::{json, FormatError};
use crate::pipeline::UnitMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub files: usize,
    pub skipped_files: usize,
    pub keys: usize,
    /// Keys defined by more than one file.
    pub conflicts: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LangMapSummary {
    pub curated: usize,
    pub untranslated: usize,
}

/// Merges named unit maps in order. Later definitions of a key replace
/// earlier ones and are reported as conflicts.
pub fn merge_units<I>(sources: I) -> (UnitMap, BTreeSet<String>)
where
    I: IntoIterator<Item = (String, UnitMap)>,
{
    let mut merged = UnitMap::new();
    let mut conflicts = BTreeSet::new();
    for (name, units) in sources {
        for (key, value) in units {
            if merged.contains_key(&key) {
                warn!("key '{key}' is redefined in '{name}', keeping the later value");
                conflicts.insert(key.clone());
            }
            merged.insert(key, value);
        }
    }
    (merged, conflicts)
}

/// Merges every `*.json` object in `dir` (by file name) into `output`.
/// Files that cannot be parsed are skipped with a warning.
pub fn merge_lang_dir(dir: &Path, output: &Path) -> Result<MergeSummary, FormatError> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut summary = MergeSummary::default();
    let mut sources = Vec::new();
    for path in paths {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        match json::read_object(&path) {
            Ok(units) => {
                summary.files += 1;
                sources.push((name, units));
            }
            Err(err) => {
                warn!("skipping {}: {err}", path.display());
                summary.skipped_files += 1;
            }
        }
    }

    let (merged, conflicts) = merge_units(sources);
    if !conflicts.is_empty() {
        let listed: Vec<&str> = conflicts.iter().map(String::as_str).collect();
        warn!("{} conflicting keys: {}", conflicts.len(), listed.join(", "));
    }

    json::write_pretty(output, &merged)?;
    summary.keys = merged.len();
    summary.conflicts = conflicts;
    info!(
        "merged {} files ({} keys) into {}",
        summary.files,
        summary.keys,
        output.display()
    );
    Ok(summary)
}

/// Splits the source language file into known translations and the rest.
///
/// For every string-valued source key: when the target has a string value
/// that differs from the source text, `curated[source_text] = target_text`;
/// otherwise `untranslated[key] = source_text`. `extra` is layered over the
/// target map first.
pub fn generate_lang_map(source: &UnitMap, target: &UnitMap, extra: Option<&UnitMap>) -> (UnitMap, UnitMap) {
    let mut curated = UnitMap::new();
    let mut untranslated = UnitMap::new();

    for (key, value) in source {
        let Value::String(source_text) = value else {
            continue;
        };
        let translated = extra
            .and_then(|extra| extra.get(key))
            .or_else(|| target.get(key))
            .and_then(Value::as_str);

        match translated {
            Some(target_text) if target_text != source_text => {
                curated.insert(source_text.clone(), Value::String(target_text.to_string()));
            }
            _ => {
                untranslated.insert(key.clone(), Value::String(source_text.clone()));
            }
        }
    }

    (curated, untranslated)
}

/// File-level [`generate_lang_map`]. A missing `extra` file is ignored.
pub fn write_lang_map(
    source_file: &Path,
    target_file: &Path,
    map_file: &Path,
    untranslated_file: &Path,
    extra_file: Option<&Path>,
) -> Result<LangMapSummary, FormatError> {
    let source = json::read_object(source_file)?;
    let target = json::read_object(target_file)?;
    let extra = match extra_file.filter(|path| path.is_file()) {
        Some(path) => Some(json::read_object(path)?),
        None => None,
    };

    let (curated, untranslated) = generate_lang_map(&source, &target, extra.as_ref());
    json::write_pretty(map_file, &curated)?;
    json::write_pretty(untranslated_file, &untranslated)?;

    info!(
        "curated map: {} terms -> {}; untranslated: {} keys -> {}",
        curated.len(),
        map_file.display(),
        untranslated.len(),
        untranslated_file.display()
    );
    Ok(LangMapSummary {
        curated: curated.len(),
        untranslated: untranslated.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn units(value: Value) -> UnitMap {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn later_files_win_and_conflicts_are_reported() {
        let (merged, conflicts) = merge_units([
            ("a.json".to_string(), units(json!({"k1": "one", "k2": "two"}))),
            ("b.json".to_string(), units(json!({"k2": "TWO", "k3": "three"}))),
        ]);
        assert_eq!(Value::Object(merged), json!({"k1": "one", "k2": "TWO", "k3": "three"}));
        assert_eq!(conflicts.into_iter().collect::<Vec<_>>(), ["k2"]);
    }

    #[test]
    fn merges_directory_and_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("en");
        fs::create_dir_all(&input).unwrap();
        fs::write(input.join("b.json"), r#"{"shared": "from b", "b": "B"}"#).unwrap();
        fs::write(input.join("a.json"), r#"{"shared": "from a", "a": "A"}"#).unwrap();
        fs::write(input.join("c.json"), "{broken").unwrap();
        fs::write(input.join("notes.txt"), "ignored").unwrap();

        let output = dir.path().join("merged/merged_output_en.json");
        let summary = merge_lang_dir(&input, &output).unwrap();

        assert_eq!(summary.files, 2);
        assert_eq!(summary.skipped_files, 1);
        assert_eq!(summary.keys, 3);
        assert!(summary.conflicts.contains("shared"));
        let merged = json::read_object(&output).unwrap();
        assert_eq!(merged["shared"], "from b");
    }

    #[test]
    fn splits_curated_and_untranslated() {
        let en = units(json!({
            "item.pearl": "Ender Pearl",
            "item.ingot": "Iron Ingot",
            "item.same": "OK",
            "item.new": "Charger",
            "item.list": ["not", "a string"]
        }));
        let zh = units(json!({
            "item.pearl": "末影珍珠",
            "item.ingot": "铁锭",
            "item.same": "OK"
        }));
        let extra = units(json!({"item.new": "充能器", "item.ingot": "铁锭（新）"}));

        let (curated, untranslated) = generate_lang_map(&en, &zh, None);
        assert_eq!(
            Value::Object(curated),
            json!({"Ender Pearl": "末影珍珠", "Iron Ingot": "铁锭"})
        );
        assert_eq!(
            Value::Object(untranslated),
            json!({"item.same": "OK", "item.new": "Charger"})
        );

        let (curated, untranslated) = generate_lang_map(&en, &zh, Some(&extra));
        assert_eq!(curated["Charger"], "充能器");
        assert_eq!(curated["Iron Ingot"], "铁锭（新）");
        assert_eq!(untranslated.keys().collect::<Vec<_>>(), ["item.same"]);
    }

    #[test]
    fn writes_map_files() {
        let dir = tempfile::tempdir().unwrap();
        let en = dir.path().join("en.json");
        let zh = dir.path().join("zh.json");
        fs::write(&en, r#"{"a": "Ender Pearl", "b": "Stick"}"#).unwrap();
        fs::write(&zh, r#"{"a": "末影珍珠"}"#).unwrap();

        let map = dir.path().join("merged_en2zh.json");
        let untranslated = dir.path().join("untranslated.json");
        let summary = write_lang_map(
            &en,
            &zh,
            &map,
            &untranslated,
            Some(&dir.path().join("exist_translated.json")),
        )
        .unwrap();

        assert_eq!(summary, LangMapSummary { curated: 1, untranslated: 1 });
        assert_eq!(json::read_object(&map).unwrap()["Ender Pearl"], "末影珍珠");
        assert_eq!(json::read_object(&untranslated).unwrap()["b"], "Stick");
    }
}
