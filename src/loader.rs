/// Match bundle discovery and loading.
///
/// A data directory holds, per match id:
///   Match_<id>.json                 event log (required)
///   PlayerUpdate_<id>.csv           snapshot table (required)
///   Performance_<user>_<id>.csv     client frame timings (optional, any number)
///
/// Event logs are sometimes written as UTF-16; `decode_text` sniffs the BOM.
use crate::{
    parser::{parse_match_json, MatchLog},
    snapshot::SnapshotTable,
    summary::PerformanceSample,
};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed snapshot table {path}: {source}")]
    Csv {
        path:   PathBuf,
        #[source]
        source: csv::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchBundle {
    pub match_id:          String,
    pub log_path:          PathBuf,
    pub snapshot_path:     PathBuf,
    /// (username, path)
    pub performance_paths: Vec<(String, PathBuf)>,
}

/// Everything the reconstruction needs for one match, in memory.
#[derive(Debug, Clone, Default)]
pub struct MatchInput {
    pub match_id:    String,
    pub log:         MatchLog,
    pub snapshots:   SnapshotTable,
    pub performance: BTreeMap<String, Vec<PerformanceSample>>,
}

/// Decode a text file that may be UTF-8 (with or without BOM) or UTF-16
/// with a BOM. Malformed sequences become U+FFFD and are logged.
pub fn decode_text(bytes: &[u8]) -> String {
    let (text, encoding, had_errors) = encoding_rs::UTF_8.decode(bytes);
    if had_errors {
        tracing::warn!("Log text is not valid {}; replaced malformed bytes", encoding.name());
    }
    text.into_owned()
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LoadError + '_ {
    move |source| LoadError::Io { path: path.to_path_buf(), source }
}

impl MatchBundle {
    pub fn load(&self) -> Result<MatchInput, LoadError> {
        let bytes = std::fs::read(&self.log_path).map_err(io_err(&self.log_path))?;
        let log = parse_match_json(&decode_text(&bytes));

        let file = File::open(&self.snapshot_path).map_err(io_err(&self.snapshot_path))?;
        let snapshots = SnapshotTable::from_csv(file).map_err(|source| LoadError::Csv {
            path: self.snapshot_path.clone(),
            source,
        })?;

        let mut performance = BTreeMap::new();
        for (user, path) in &self.performance_paths {
            let samples = File::open(path)
                .map_err(csv::Error::from)
                .and_then(PerformanceSample::read_csv);
            match samples {
                Ok(samples) => {
                    performance.insert(user.clone(), samples);
                }
                Err(e) => tracing::warn!("Skipping performance file {:?}: {}", path, e),
            }
        }

        tracing::debug!(
            "Loaded match {}: {} events, {} perf files",
            self.match_id,
            log.events.len(),
            performance.len()
        );
        Ok(MatchInput { match_id: self.match_id.clone(), log, snapshots, performance })
    }
}

/// Scan `data_dir` for complete match bundles, sorted by match id. Logs
/// without a sibling snapshot table are skipped with a warning.
pub fn find_match_bundles(data_dir: &Path) -> anyhow::Result<Vec<MatchBundle>> {
    let mut names: Vec<String> = std::fs::read_dir(data_dir)?
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    let mut bundles = Vec::new();
    for name in &names {
        let Some(match_id) = name
            .strip_prefix("Match_")
            .and_then(|s| s.strip_suffix(".json"))
            .filter(|id| !id.is_empty())
        else {
            continue;
        };

        let snapshot_path = data_dir.join(format!("PlayerUpdate_{}.csv", match_id));
        if !snapshot_path.is_file() {
            tracing::warn!("Skipping {}: no PlayerUpdate_{}.csv", name, match_id);
            continue;
        }

        let perf_suffix = format!("_{}.csv", match_id);
        let performance_paths = names
            .iter()
            .filter_map(|n| {
                let user = n.strip_prefix("Performance_")?.strip_suffix(perf_suffix.as_str())?;
                (!user.is_empty()).then(|| (user.to_owned(), data_dir.join(n)))
            })
            .collect();

        bundles.push(MatchBundle {
            match_id: match_id.to_owned(),
            log_path: data_dir.join(name),
            snapshot_path,
            performance_paths,
        });
    }

    tracing::info!("Found {} match bundles in {:?}", bundles.len(), data_dir);
    Ok(bundles)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const LOG: &str = r#"{"events": [
        {"stamp": 0, "name": "join", "id": 1, "username": "A"},
        {"stamp": 5, "name": "spawn", "player": 1},
    ]}"#;

    const SNAPSHOTS: &str = "PlayerId,Stamp,Health\n1,0,100\n2,0,100\n";

    fn write(dir: &Path, name: &str, body: &[u8]) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn finds_complete_bundles_only() {
        let dir = tempdir().unwrap();
        write(dir.path(), "Match_42.json", LOG.as_bytes());
        write(dir.path(), "PlayerUpdate_42.csv", SNAPSHOTS.as_bytes());
        write(dir.path(), "Performance_Stonebraid_42.csv", b"Frame Avg\n16\n");
        write(dir.path(), "Performance_Other_7.csv", b"Frame Avg\n16\n");
        write(dir.path(), "Match_7.json", LOG.as_bytes()); // no snapshot table
        write(dir.path(), "notes.txt", b"");

        let bundles = find_match_bundles(dir.path()).unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].match_id, "42");
        assert_eq!(
            bundles[0].performance_paths,
            vec![("Stonebraid".to_owned(), dir.path().join("Performance_Stonebraid_42.csv"))]
        );
    }

    #[test]
    fn loads_bundle_contents() {
        let dir = tempdir().unwrap();
        write(dir.path(), "Match_1.json", LOG.as_bytes());
        write(dir.path(), "PlayerUpdate_1.csv", SNAPSHOTS.as_bytes());
        write(dir.path(), "Performance_A_1.csv", b"Frame Avg,Packet Latency\n16,30\n20,40\n");

        let bundle = find_match_bundles(dir.path()).unwrap().remove(0);
        let input = bundle.load().unwrap();
        assert_eq!(input.log.events.len(), 2);
        assert_eq!(input.snapshots.slots().count(), 2);
        assert_eq!(input.performance["A"].len(), 2);
    }

    #[test]
    fn unreadable_log_degrades_to_empty() {
        let dir = tempdir().unwrap();
        write(dir.path(), "Match_1.json", b"\x00\x01garbage");
        write(dir.path(), "PlayerUpdate_1.csv", SNAPSHOTS.as_bytes());
        let input = find_match_bundles(dir.path()).unwrap().remove(0).load().unwrap();
        assert!(input.log.events.is_empty());
    }

    #[test]
    fn missing_snapshot_file_is_an_error() {
        let bundle = MatchBundle {
            match_id:          "9".into(),
            log_path:          PathBuf::from("/nonexistent/Match_9.json"),
            snapshot_path:     PathBuf::from("/nonexistent/PlayerUpdate_9.csv"),
            performance_paths: vec![],
        };
        assert!(matches!(bundle.load(), Err(LoadError::Io { .. })));
    }

    #[test]
    fn decodes_utf16_logs() {
        let text = "{\"events\": []}";
        let mut bytes = vec![0xFF, 0xFE];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_text(&bytes), text);
        assert_eq!(decode_text(b"\xEF\xBB\xBFabc"), "abc");
    }

    #[test]
    fn truncated_utf16_keeps_a_replacement_char() {
        // BOM + "ab" + a dangling half code unit
        let bytes = [0xFF, 0xFE, b'a', 0x00, b'b', 0x00, b'c'];
        assert_eq!(decode_text(&bytes), "ab\u{FFFD}");
        assert_eq!(decode_text(&[0xFE, 0xFF, 0x00, b'x']), "x");
    }
}
