// crates/core/src/capability_index.rs

use std::collections::HashSet;
use std::sync::Arc;

use crate::capability_store::CapabilityStore;
use crate::types::Capability;

/// Lowercased alphanumeric words of `text`.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Number of `words` that also occur in `text`.
pub fn overlap(words: &HashSet<String>, text: &str) -> usize {
    let tokens = tokenize(text);
    words.iter().filter(|w| tokens.contains(*w)).count()
}

fn score(words: &HashSet<String>, cap: &Capability) -> usize {
    overlap(words, &format!("{} {}", cap.name, cap.description))
}

/// Score every capability against `task`, best first.
///
/// Ties go to the most recently updated capability, then to name order so the
/// ranking is deterministic.
pub fn rank_capabilities(
    capabilities: &[Arc<Capability>],
    task: &str,
) -> Vec<(Arc<Capability>, usize)> {
    let words = tokenize(task);
    let mut scored: Vec<(Arc<Capability>, usize)> = capabilities
        .iter()
        .map(|cap| (cap.clone(), score(&words, cap)))
        .collect();

    scored.sort_by(|(a, sa), (b, sb)| {
        sb.cmp(sa)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.name.cmp(&b.name))
    });
    scored
}

/// Picks a stored capability for a task by lexical overlap with its name and
/// description. Simple on purpose: every selection can be explained by the
/// words it shares with the task.
pub struct RelevanceSelector {
    store: Arc<CapabilityStore>,
    min_score: usize,
}

impl RelevanceSelector {
    pub fn new(store: Arc<CapabilityStore>, min_score: usize) -> Self {
        Self { store, min_score }
    }

    /// Best capability scoring at least the floor, if any.
    pub fn best_match(&self, task: &str) -> Option<Arc<Capability>> {
        rank_capabilities(&self.store.list(), task)
            .into_iter()
            .next()
            .filter(|(_, score)| *score >= self.min_score)
            .map(|(cap, _)| cap)
    }

    /// Top-k capabilities with a non-zero score.
    pub fn rank(&self, task: &str, k: usize) -> Vec<(Arc<Capability>, usize)> {
        let mut ranked = rank_capabilities(&self.store.list(), task);
        ranked.retain(|(_, score)| *score > 0);
        ranked.truncate(k);
        ranked
    }
}
