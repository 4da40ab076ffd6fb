use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

pub mod manifest;
pub mod meta;
pub mod record;
pub mod trial_log;

pub use manifest::{Manifest, PackManifest};
pub use meta::{
    read_run_metadata, write_run_metadata, BudgetSnapshot, FatalError, PackProgress, PackStatus,
    ResumeInfo, RunMetadata, RunStats, RunStatus,
};
pub use record::{Telemetry, TrialRecord};
pub use trial_log::{load_progress, Progress, TrialLog};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Digest of the JSON value with object keys in sorted order.
pub fn canonical_json_digest(value: &Value) -> String {
    // serde_json's default map is ordered, so serialization is already canonical.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    sha256_bytes(&bytes)
}

/// Writes `bytes` next to `path` and renames over it, so readers see either
/// the old or the new file and never a torn one.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_digest_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b: Value = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).expect("parse");
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
        assert!(canonical_json_digest(&a).starts_with("sha256:"));
    }

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp_files() {
        let dir = testutil::temp_dir("atomic");
        let path = dir.join("meta.json");
        atomic_write_bytes(&path, b"first").expect("first write");
        atomic_write_json_pretty(&path, &json!({"v": 2})).expect("second write");

        let value: Value =
            serde_json::from_slice(&fs::read(&path).expect("read")).expect("parse json");
        assert_eq!(value["v"], 2);
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind");
        let _ = fs::remove_dir_all(dir);
    }
}
