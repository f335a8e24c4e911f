//! Pre-recorded clip catalog
//!
//! The catalog is built once at startup and shared read-only
//! (`Arc<Catalog>`). Document parsing and validation live in
//! `avatar-config`; this module only holds the validated data.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One subtitle segment of a clip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub text: String,
    /// Offset from playback start
    pub start_offset_ms: u64,
}

impl Segment {
    pub fn new(text: impl Into<String>, start_offset_ms: u64) -> Self {
        Self {
            text: text.into(),
            start_offset_ms,
        }
    }
}

/// A pre-recorded clip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: String,
    pub display_text: String,
    /// `None` when an override removed the audio; the entry is then spoken
    /// through text-to-speech
    pub audio_uri: Option<String>,
    /// Ordered by non-decreasing start offset
    pub segments: Vec<Segment>,
    /// Offsets where the mouth closes for the configured pause duration
    pub pause_offsets: Vec<u64>,
}

impl CatalogEntry {
    pub fn has_audio(&self) -> bool {
        self.audio_uri.as_deref().is_some_and(|uri| !uri.is_empty())
    }
}

/// Ordered, id-indexed set of entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    index: HashMap<String, usize>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from entries; a repeated id replaces the earlier entry in place
    pub fn from_entries(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        let mut catalog = Self::new();
        for entry in entries {
            catalog.insert(entry);
        }
        catalog
    }

    fn insert(&mut self, entry: CatalogEntry) {
        match self.index.get(&entry.id) {
            Some(&pos) => self.entries[pos] = entry,
            None => {
                self.index.insert(entry.id.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.index.get(id).map(|&pos| &self.entries[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Position of an id in catalog order
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn at(&self, position: usize) -> Option<&CatalogEntry> {
        self.entries.get(position)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.id.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter()
    }

    /// Audio references of every entry that has one
    pub fn audio_uris(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|e| e.audio_uri.clone())
            .filter(|uri| !uri.is_empty())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Combine catalogs; entries of later catalogs win
    pub fn merge<'a>(catalogs: impl IntoIterator<Item = &'a Catalog>) -> Catalog {
        Catalog::from_entries(catalogs.into_iter().flat_map(|c| c.entries.iter().cloned()))
    }
}
