pub mod runner;

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::pipeline::UnitMap;

pub use runner::{BatchCoordinator, BatchFailure, DocumentError, DocumentFailure, DocumentJob, DocumentReport};

/// Aggregated batch result, sorted by key.
pub type ResultSet = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
}

/// Observer of a running batch. Called from the coordinator's drain loop
/// only, once per completed unit of work.
pub trait ProgressSink {
    fn chunk_completed(&mut self, chunk: &UnitMap, progress: Progress);

    fn finished(&mut self, _aggregate: &ResultSet) {}

    fn document_completed(&mut self, _label: &str, _progress: Progress) {}
}

/// Human-readable progress on stdout: the translated chunk as pretty JSON
/// followed by `processed / total`.
#[derive(Debug, Default)]
pub struct StdoutProgress;

impl ProgressSink for StdoutProgress {
    fn chunk_completed(&mut self, chunk: &UnitMap, progress: Progress) {
        match serde_json::to_string_pretty(chunk) {
            Ok(text) => println!("{text}"),
            Err(err) => log::warn!("could not render chunk: {err}"),
        }
        println!("{} / {}", progress.processed, progress.total);
    }

    fn finished(&mut self, aggregate: &ResultSet) {
        println!("finished: {} entries", aggregate.len());
    }

    fn document_completed(&mut self, label: &str, progress: Progress) {
        println!("translated {label}");
        println!("progress: {}/{}", progress.processed, progress.total);
    }
}

/// Splits `units` into consecutive chunks of at most `chunk_size` entries,
/// keeping insertion order.
pub fn chunk_units(units: &UnitMap, chunk_size: usize) -> Vec<UnitMap> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(units.len().div_ceil(chunk_size));
    let mut current = UnitMap::new();
    for (key, value) in units {
        current.insert(key.clone(), value.clone());
        if current.len() == chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn numbered(count: usize) -> UnitMap {
        (0..count)
            .map(|index| (format!("key.{index:03}"), Value::String(format!("text {index}"))))
            .collect()
    }

    #[test]
    fn chunks_partition_the_input() {
        for (count, size) in [(0, 3), (1, 1), (7, 3), (9, 3), (250, 100), (5, 0)] {
            let units = numbered(count);
            let chunks = chunk_units(&units, size);

            let mut seen = BTreeSet::new();
            for chunk in &chunks {
                assert!(!chunk.is_empty());
                assert!(chunk.len() <= size.max(1));
                for key in chunk.keys() {
                    assert!(seen.insert(key.clone()), "{key} appears in two chunks");
                }
            }
            let expected: BTreeSet<String> = units.keys().cloned().collect();
            assert_eq!(seen, expected);
        }
    }

    #[test]
    fn chunks_follow_insertion_order() {
        let mut units = UnitMap::new();
        for key in ["z", "a", "m", "b"] {
            units.insert(key.into(), Value::String(key.into()));
        }
        let chunks = chunk_units(&units, 3);
        let first: Vec<&String> = chunks[0].keys().collect();
        assert_eq!(first, ["z", "a", "m"]);
        assert_eq!(chunks[1].keys().collect::<Vec<_>>(), ["b"]);
    }
}
