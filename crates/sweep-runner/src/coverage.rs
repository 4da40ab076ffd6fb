use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use sweep_core::{PackManifest, Progress};

const TARGET_SCALE: f64 = 1e9;

/// Distinct trials a pack needs before it counts as done. An explicit sample
/// count wins over the ratio and is capped at the pack size.
pub fn coverage_target(total: usize, ratio: f64, samples: Option<usize>) -> usize {
    if total == 0 {
        return 0;
    }
    match samples {
        Some(n) => n.min(total),
        None => {
            // Rounded to nine decimals first so 10 * 0.8 (8.000000000000002)
            // stays 8 while 10 * 0.7000000001 still rounds up to 8.
            let product = (total as f64 * ratio * TARGET_SCALE).round() / TARGET_SCALE;
            (product.ceil().max(0.0) as usize).min(total)
        }
    }
}

#[derive(Debug, Clone)]
struct PackCoverage {
    total: usize,
    target: usize,
    visited: BTreeSet<String>,
}

/// Per-pack visited sets. Sets only grow; the trial log is the source of
/// truth and [`CoverageTracker::seed_from`] rebuilds them on resume.
#[derive(Debug, Clone, Default)]
pub struct CoverageTracker {
    packs: BTreeMap<String, PackCoverage>,
}

impl CoverageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pack, keeping any ids already seen that the manifest allows.
    pub fn register(&mut self, pack: &PackManifest, target: usize, seen: Option<&BTreeSet<String>>) {
        let visited = seen
            .map(|ids| ids.iter().filter(|id| pack.contains(id)).cloned().collect())
            .unwrap_or_default();
        self.packs.insert(
            pack.id.clone(),
            PackCoverage {
                total: pack.total(),
                target,
                visited,
            },
        );
    }

    /// Registers every pack in `packs` with state replayed from the log.
    pub fn seed_from<'a>(
        &mut self,
        packs: impl IntoIterator<Item = &'a PackManifest>,
        progress: &Progress,
        target_for: impl Fn(&PackManifest) -> usize,
    ) {
        for pack in packs {
            let target = target_for(pack);
            self.register(pack, target, progress.visited_by_pack.get(&pack.id));
        }
    }

    pub fn is_done(&self, pack_id: &str) -> bool {
        self.packs
            .get(pack_id)
            .map(|p| p.visited.len() >= p.target)
            .unwrap_or(false)
    }

    /// Returns true when `trial_id` was not seen before in this pack.
    pub fn record_visit(&mut self, pack_id: &str, trial_id: &str) -> bool {
        match self.packs.get_mut(pack_id) {
            Some(p) => p.visited.insert(trial_id.to_string()),
            None => false,
        }
    }

    pub fn visited(&self, pack_id: &str) -> usize {
        self.packs.get(pack_id).map(|p| p.visited.len()).unwrap_or(0)
    }

    pub fn target(&self, pack_id: &str) -> usize {
        self.packs.get(pack_id).map(|p| p.target).unwrap_or(0)
    }

    pub fn total(&self, pack_id: &str) -> usize {
        self.packs.get(pack_id).map(|p| p.total).unwrap_or(0)
    }

    pub fn visited_set(&self, pack_id: &str) -> Option<&BTreeSet<String>> {
        self.packs.get(pack_id).map(|p| &p.visited)
    }

    /// Snapshot comparable to [`Progress::visited_by_pack`]; packs without
    /// any visit are left out.
    pub fn visited_sets(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.packs
            .iter()
            .filter(|(_, p)| !p.visited.is_empty())
            .map(|(id, p)| (id.clone(), p.visited.clone()))
            .collect()
    }

    /// Unseen ids first, then seen ones, each group shuffled.
    pub fn priority_order<R: Rng + ?Sized>(&self, pack: &PackManifest, rng: &mut R) -> Vec<String> {
        let seen = self.visited_set(&pack.id);
        let (mut missing, mut visited): (Vec<String>, Vec<String>) = pack
            .trials
            .iter()
            .cloned()
            .partition(|id| !seen.map(|s| s.contains(id)).unwrap_or(false));
        missing.shuffle(rng);
        visited.shuffle(rng);
        missing.extend(visited);
        missing
    }
}
