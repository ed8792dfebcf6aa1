//! Domain Knowledge Index
//!
//! Curated documentation about the platform's domain objects, counters,
//! vendors and families, loaded once at startup and queried with
//! case-insensitive alias/prefix/substring matching. Reloads publish a new
//! immutable snapshot; concurrent readers keep the one they started with.

use crate::error::{NlqError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use strsim::jaro_winkler;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainCategory {
    Object,
    Counter,
    Vendor,
    Family,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEntry {
    pub term: String,
    pub category: DomainCategory,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub description: String,
}

/// Match quality tiers, best first. Ties within a tier are broken by
/// Jaro-Winkler similarity against the queried term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchTier {
    ExactAlias,
    Prefix,
    Substring,
}

pub struct DomainIndex {
    path: Option<PathBuf>,
    snapshot: RwLock<Arc<Vec<DomainEntry>>>,
}

impl DomainIndex {
    /// Build from a JSON file holding an array of entries.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let entries = read_entries(path.as_ref())?;
        info!(
            entries = entries.len(),
            path = %path.as_ref().display(),
            "domain knowledge index loaded"
        );
        Ok(Self {
            path: Some(path.as_ref().to_path_buf()),
            snapshot: RwLock::new(Arc::new(entries)),
        })
    }

    /// Build from in-memory entries (tests, or deployments without docs).
    pub fn from_entries(entries: Vec<DomainEntry>) -> Self {
        Self {
            path: None,
            snapshot: RwLock::new(Arc::new(entries)),
        }
    }

    pub fn empty() -> Self {
        Self::from_entries(Vec::new())
    }

    /// Re-read the backing file and atomically publish a new snapshot.
    pub fn reload(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| NlqError::Config("domain index has no backing file".into()))?;
        let entries = Arc::new(read_entries(path)?);
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = entries;
        Ok(())
    }

    fn snapshot(&self) -> Arc<Vec<DomainEntry>> {
        let guard = self
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Rank matches: exact alias, then prefix, then substring. Empty result
    /// (never an error) when nothing matches.
    pub fn lookup(&self, term: &str) -> Vec<DomainEntry> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        let snapshot = self.snapshot();
        let mut ranked: Vec<(MatchTier, f64, &DomainEntry)> = Vec::new();

        for entry in snapshot.iter() {
            if let Some(tier) = match_tier(entry, &needle) {
                let score = jaro_winkler(&entry.term.to_lowercase(), &needle);
                ranked.push((tier, score, entry));
            }
        }

        ranked.sort_by(|a, b| {
            a.0.cmp(&b.0).then(
                b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal),
            )
        });
        ranked.into_iter().map(|(_, _, e)| e.clone()).collect()
    }

    /// Look up every candidate term of a free-text question, deduplicated,
    /// best matches first.
    pub fn lookup_question(&self, question: &str) -> Vec<DomainEntry> {
        let mut seen = std::collections::HashSet::new();
        let mut hits = Vec::new();
        for token in candidate_terms(question) {
            for entry in self.lookup(&token) {
                if seen.insert(entry.term.to_lowercase()) {
                    hits.push(entry);
                }
            }
        }
        hits
    }
}

fn match_tier(entry: &DomainEntry, needle: &str) -> Option<MatchTier> {
    let mut names = vec![entry.term.to_lowercase()];
    names.extend(entry.aliases.iter().map(|a| a.to_lowercase()));

    if names.iter().any(|n| n == needle) {
        return Some(MatchTier::ExactAlias);
    }
    if names.iter().any(|n| n.starts_with(needle)) {
        return Some(MatchTier::Prefix);
    }
    if names.iter().any(|n| n.contains(needle) || needle.contains(n.as_str())) {
        return Some(MatchTier::Substring);
    }
    None
}

const STOPWORDS: &[&str] = &[
    "the", "what", "which", "for", "and", "our", "have", "does", "list", "are", "how", "many",
    "with", "that", "this", "all", "can", "you", "get", "show", "give", "between", "from",
    "values", "available", "covered",
];

fn candidate_terms(question: &str) -> Vec<String> {
    question
        .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| t.len() >= 3 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

fn read_entries(path: &Path) -> Result<Vec<DomainEntry>> {
    let raw = std::fs::read_to_string(path)?;
    let entries: Vec<DomainEntry> = serde_json::from_str(&raw)?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> DomainIndex {
        DomainIndex::from_entries(vec![
            DomainEntry {
                term: "LTE_MAC".into(),
                category: DomainCategory::Object,
                aliases: vec!["lte mac layer".into()],
                description: "MAC layer object for LTE cells".into(),
            },
            DomainEntry {
                term: "PRBUsageDL".into(),
                category: DomainCategory::Counter,
                aliases: vec!["prb usage downlink".into()],
                description: "Downlink PRB utilization counter".into(),
            },
            DomainEntry {
                term: "Nokia".into(),
                category: DomainCategory::Vendor,
                aliases: vec![],
                description: "Nokia network equipment vendor".into(),
            },
        ])
    }

    #[test]
    fn exact_alias_outranks_substring() {
        let index = sample_index();
        let hits = index.lookup("lte_mac");
        assert_eq!(hits[0].term, "LTE_MAC");
        assert_eq!(hits[0].category, DomainCategory::Object);
    }

    #[test]
    fn prefix_match_is_case_insensitive() {
        let index = sample_index();
        let hits = index.lookup("prb");
        assert!(!hits.is_empty());
        assert_eq!(hits[0].term, "PRBUsageDL");
    }

    #[test]
    fn no_match_returns_empty_not_error() {
        let index = sample_index();
        assert!(index.lookup("zzz_nonexistent").is_empty());
        assert!(index.lookup("").is_empty());
    }

    #[test]
    fn question_lookup_extracts_domain_terms() {
        let index = sample_index();
        let hits = index.lookup_question("What counters are available for nokia objects?");
        assert!(hits.iter().any(|e| e.term == "Nokia"));
    }
}
