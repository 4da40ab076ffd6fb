use crate::record::TrialRecord;
use anyhow::Result;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Append-only NDJSON log of trial records with a single writer.
#[derive(Debug)]
pub struct TrialLog {
    path: PathBuf,
    file: File,
}

impl TrialLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::ensure_dir(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        // A crash mid-append can leave a torn last line; terminate it so the
        // next record starts on a fresh line.
        let len = file.metadata()?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                file.write_all(b"\n")?;
                file.sync_data()?;
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durable before returning.
    pub fn append(&mut self, record: &TrialRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub visited_by_pack: BTreeMap<String, BTreeSet<String>>,
    pub total_lines: usize,
    pub malformed_lines: usize,
}

impl Progress {
    pub fn visited(&self, pack_id: &str) -> usize {
        self.visited_by_pack.get(pack_id).map_or(0, |s| s.len())
    }
}

// Only the fields replay needs; everything else in the line is ignored.
#[derive(Deserialize)]
struct VisitLine {
    pack_id: String,
    #[serde(default)]
    trial_id: Option<String>,
}

/// Rebuilds the visited sets by streaming the log. Malformed lines are
/// skipped and counted; a missing log is empty progress.
pub fn load_progress(path: &Path) -> Result<Progress> {
    let mut progress = Progress::default();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(progress),
        Err(e) => return Err(e.into()),
    };
    let reader = BufReader::new(file);
    for (idx, raw) in reader.split(b'\n').enumerate() {
        let raw = raw?;
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        progress.total_lines += 1;
        match serde_json::from_slice::<VisitLine>(&raw) {
            Ok(line) => {
                if let Some(trial_id) = line.trial_id {
                    progress
                        .visited_by_pack
                        .entry(line.pack_id)
                        .or_default()
                        .insert(trial_id);
                }
            }
            Err(err) => {
                progress.malformed_lines += 1;
                tracing::warn!(
                    line = idx + 1,
                    error = %err,
                    path = %path.display(),
                    "skipping malformed trial log line"
                );
            }
        }
    }
    Ok(progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::temp_dir;
    use std::fs;

    fn record(pack: &str, trial: Option<&str>) -> TrialRecord {
        TrialRecord::new("run_test", pack, trial.map(|s| s.to_string()), 1)
    }

    #[test]
    fn missing_log_is_empty_progress() {
        let dir = temp_dir("log_missing");
        let progress = load_progress(&dir.join("trials.log")).expect("load");
        assert_eq!(progress, Progress::default());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn replay_matches_appended_records() {
        let dir = temp_dir("log_replay");
        let path = dir.join("trials.log");
        let mut log = TrialLog::open(&path).expect("open");
        log.append(&record("p1", Some("a"))).expect("append");
        log.append(&record("p1", Some("b"))).expect("append");
        log.append(&record("p1", Some("a"))).expect("append");
        log.append(&record("p2", None)).expect("append");

        let progress = load_progress(&path).expect("load");
        assert_eq!(progress.total_lines, 4);
        assert_eq!(progress.malformed_lines, 0);
        assert_eq!(progress.visited("p1"), 2);
        assert_eq!(progress.visited("p2"), 0);
        assert!(!progress.visited_by_pack.contains_key("p2"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn malformed_lines_are_skipped_and_counted() {
        let dir = temp_dir("log_malformed");
        let path = dir.join("trials.log");
        let good = serde_json::to_string(&record("p1", Some("x"))).expect("ser");
        let body = format!(
            "{}\nnot json at all\n{{\"pack_id\": 7}}\n\n{}\n{{\"pack_id\":\"p1\",\"trial_id\":\"y\",\"futu",
            good,
            r#"{"pack_id":"p1","trial_id":"z","extra_field":{"nested":true}}"#
        );
        fs::write(&path, body).expect("write");

        let progress = load_progress(&path).expect("load");
        assert_eq!(progress.total_lines, 5);
        assert_eq!(progress.malformed_lines, 3);
        let visited = &progress.visited_by_pack["p1"];
        assert!(visited.contains("x"));
        assert!(visited.contains("z"));
        assert_eq!(visited.len(), 2);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn reopening_after_torn_line_starts_a_fresh_line() {
        let dir = temp_dir("log_torn");
        let path = dir.join("trials.log");
        fs::write(&path, "{\"pack_id\":\"p1\",\"tri").expect("write torn");

        let mut log = TrialLog::open(&path).expect("open");
        log.append(&record("p1", Some("after"))).expect("append");

        let progress = load_progress(&path).expect("load");
        assert_eq!(progress.malformed_lines, 1);
        assert!(progress.visited_by_pack["p1"].contains("after"));
        assert_eq!(progress.total_lines, 2);
        let _ = fs::remove_dir_all(dir);
    }
}
