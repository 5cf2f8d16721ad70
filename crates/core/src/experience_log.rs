// crates/core/src/experience_log.rs

//! Bounded log of past task invocations. Used for recall only, never for gating.

use std::collections::VecDeque;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::capability_index::{overlap, tokenize};
use crate::capability_store::write_json_atomic;
use crate::error::{StoreError, StoreResult};
use crate::types::Experience;

#[derive(Debug)]
pub struct ExperienceLog {
    path: PathBuf,
    capacity: usize,
    entries: VecDeque<Experience>,
}

impl ExperienceLog {
    /// Load the log at `path`, keeping only the newest `capacity` entries.
    pub fn open(path: PathBuf, capacity: usize) -> StoreResult<Self> {
        let capacity = capacity.max(1);
        let entries: Vec<Experience> = match fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "experience log unreadable, starting empty");
                Vec::new()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let skip = entries.len().saturating_sub(capacity);
        Ok(Self {
            path,
            capacity,
            entries: entries.into_iter().skip(skip).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append and persist, evicting oldest-first once full.
    pub fn record(&mut self, experience: Experience) -> StoreResult<()> {
        self.entries.push_back(experience);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        write_json_atomic(&self.path, &self.entries)
    }

    /// The `limit` entries with the highest lexical overlap with `text`.
    /// Entries with no overlap are never returned; ties favor newer entries.
    pub fn query(&self, text: &str, limit: usize) -> Vec<Experience> {
        let words = tokenize(text);
        let mut scored: Vec<(usize, usize, &Experience)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, exp)| {
                let haystack = format!("{} {}", exp.task, exp.learned.join(" "));
                let score = overlap(&words, &haystack);
                (score > 0).then_some((score, i, exp))
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        scored
            .into_iter()
            .take(limit)
            .map(|(_, _, exp)| exp.clone())
            .collect()
    }

    /// Snapshot, oldest first.
    pub fn entries(&self) -> Vec<Experience> {
        self.entries.iter().cloned().collect()
    }
}

/// Build an experience record with a short content-derived id.
pub fn new_experience(
    task: &str,
    success: bool,
    learned: Vec<String>,
    capability: Option<String>,
) -> Experience {
    let timestamp = Utc::now();
    Experience {
        id: short_id(task, success, &timestamp),
        task: task.to_string(),
        success,
        learned,
        capability,
        timestamp,
    }
}

fn short_id(task: &str, success: bool, timestamp: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task.as_bytes());
    hasher.update([success as u8]);
    hasher.update(timestamp.to_rfc3339().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..10].to_string()
}
