use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
struct RawManifest {
    #[serde(default)]
    schema_version: Option<String>,
    packs: Vec<RawPack>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawPack {
    id: String,
    trials: Vec<String>,
    #[serde(default)]
    total: Option<usize>,
}

/// The valid trial identifiers of one pack, in manifest order.
#[derive(Debug, Clone, PartialEq)]
pub struct PackManifest {
    pub id: String,
    pub trials: Vec<String>,
    allowed: BTreeSet<String>,
}

impl PackManifest {
    pub fn new(id: &str, trials: Vec<String>) -> Self {
        let mut allowed = BTreeSet::new();
        let trials: Vec<String> = trials
            .into_iter()
            .filter(|t| allowed.insert(t.clone()))
            .collect();
        Self {
            id: id.to_string(),
            trials,
            allowed,
        }
    }

    pub fn total(&self) -> usize {
        self.trials.len()
    }

    pub fn contains(&self, trial_id: &str) -> bool {
        self.allowed.contains(trial_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub packs: Vec<PackManifest>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .map_err(|e| anyhow!("manifest_not_found: {}: {}", path.display(), e))?;
        let raw: RawManifest = serde_json::from_slice(&bytes)
            .map_err(|e| anyhow!("manifest_invalid: {}: {}", path.display(), e))?;
        if let Some(version) = raw.schema_version.as_deref() {
            if version != "manifest_v1" {
                tracing::warn!(version, "unrecognized manifest schema_version, reading anyway");
            }
        }
        Self::from_packs(raw.packs)
    }

    fn from_packs(raw: Vec<RawPack>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        let mut packs = Vec::with_capacity(raw.len());
        for pack in raw {
            if !seen.insert(pack.id.clone()) {
                return Err(anyhow!("manifest_invalid: duplicate pack id '{}'", pack.id));
            }
            let listed = pack.trials.len();
            let built = PackManifest::new(&pack.id, pack.trials);
            if built.total() != listed {
                tracing::warn!(
                    pack = %pack.id,
                    duplicates = listed - built.total(),
                    "manifest lists duplicate trial ids, counting each once"
                );
            }
            if let Some(total) = pack.total {
                if total != built.total() {
                    return Err(anyhow!(
                        "manifest_invalid: pack '{}' declares total {} but lists {} distinct trials",
                        pack.id,
                        total,
                        built.total()
                    ));
                }
            }
            packs.push(built);
        }
        Ok(Self { packs })
    }

    pub fn pack(&self, id: &str) -> Option<&PackManifest> {
        self.packs.iter().find(|p| p.id == id)
    }

    pub fn pack_ids(&self) -> Vec<String> {
        self.packs.iter().map(|p| p.id.clone()).collect()
    }
}
