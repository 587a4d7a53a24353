//! Durable mapping from frame file name to its label.
//!
//! The document is a single JSON object keyed by frame file name. Saves go
//! through a temporary file in the same directory that is renamed over the
//! previous document, so a reader never observes a half-written store.

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::category::{Category, Subphase};
use crate::error::StoreError;
use crate::frame::FrameName;
use crate::util::parent_or_cwd;

pub const DEFAULT_STORE_FILE: &str = "classifications.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EntryDoc", into = "EntryDoc")]
pub struct ClassificationEntry {
    pub frame: FrameName,
    pub category: Category,
    pub subphase: Option<Subphase>,
    pub original_path: PathBuf,
    pub destination_path: Option<PathBuf>,
    pub classified_at: DateTime<Utc>,
}

impl ClassificationEntry {
    pub fn new(
        frame: FrameName,
        category: Category,
        subphase: Option<Subphase>,
        original_path: PathBuf,
    ) -> Result<Self, StoreError> {
        if category.is_null() && subphase.is_some() {
            return Err(StoreError::Invalid(format!(
                "{}: null category cannot carry a sub-phase",
                frame
            )));
        }
        Ok(Self {
            frame,
            category,
            subphase,
            original_path,
            destination_path: None,
            classified_at: Utc::now(),
        })
    }

    pub fn key(&self) -> String {
        self.frame.file_name()
    }
}

/// On-disk shape of one entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryDoc {
    category_id: String,
    category_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subphase: Option<String>,
    original_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    destination_path: Option<PathBuf>,
    round_id: u64,
    frame_number: u64,
    frame_timestamp: String,
    classification_timestamp: DateTime<Utc>,
}

impl From<ClassificationEntry> for EntryDoc {
    fn from(e: ClassificationEntry) -> Self {
        EntryDoc {
            category_id: e.category.id().to_string(),
            category_name: e.category.name().to_string(),
            subphase: e.subphase.map(|s| s.name().to_string()),
            original_path: e.original_path,
            destination_path: e.destination_path,
            round_id: e.frame.round_id,
            frame_number: e.frame.frame_number,
            frame_timestamp: e.frame.timestamp,
            classification_timestamp: e.classified_at,
        }
    }
}

impl TryFrom<EntryDoc> for ClassificationEntry {
    type Error = String;

    fn try_from(doc: EntryDoc) -> Result<Self, Self::Error> {
        let mut id = doc.category_id.chars();
        let category = match (id.next(), id.next()) {
            (Some(c), None) => Category::from_id(c),
            _ => None,
        }
        .ok_or_else(|| format!("unknown category_id {:?}", doc.category_id))?;
        if category.name() != doc.category_name {
            return Err(format!(
                "category_id {} does not match category_name {:?}",
                doc.category_id, doc.category_name
            ));
        }
        let subphase = match doc.subphase.as_deref() {
            None => None,
            Some(name) => {
                Some(Subphase::from_name(name).ok_or_else(|| format!("unknown subphase {:?}", name))?)
            }
        };
        if category.is_null() && subphase.is_some() {
            return Err("null category cannot carry a sub-phase".to_string());
        }
        Ok(ClassificationEntry {
            frame: FrameName {
                round_id: doc.round_id,
                frame_number: doc.frame_number,
                timestamp: doc.frame_timestamp,
            },
            category,
            subphase,
            original_path: doc.original_path,
            destination_path: doc.destination_path,
            classified_at: doc.classification_timestamp,
        })
    }
}

/// Per-category and per-(category, sub-phase) tallies kept in step with every
/// mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryCounts {
    by_category: [usize; Category::ALL.len()],
    by_subphase: [[usize; Subphase::ALL.len()]; Category::ALL.len()],
}

impl CategoryCounts {
    pub fn get(&self, category: Category) -> usize {
        self.by_category[category.index()]
    }

    pub fn get_subphase(&self, category: Category, subphase: Subphase) -> usize {
        self.by_subphase[category.index()][subphase.index()]
    }

    pub fn total(&self) -> usize {
        self.by_category.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, usize)> + '_ {
        Category::ALL.into_iter().map(|c| (c, self.get(c)))
    }

    fn add(&mut self, entry: &ClassificationEntry) {
        self.by_category[entry.category.index()] += 1;
        if let Some(sub) = entry.subphase {
            self.by_subphase[entry.category.index()][sub.index()] += 1;
        }
    }

    fn remove(&mut self, entry: &ClassificationEntry) {
        let cat = &mut self.by_category[entry.category.index()];
        *cat = cat.saturating_sub(1);
        if let Some(sub) = entry.subphase {
            let s = &mut self.by_subphase[entry.category.index()][sub.index()];
            *s = s.saturating_sub(1);
        }
    }
}

#[derive(Debug)]
pub struct ClassificationStore {
    path: PathBuf,
    entries: BTreeMap<String, ClassificationEntry>,
    counts: CategoryCounts,
}

impl ClassificationStore {
    /// Empty when the document does not exist yet. A document that exists but
    /// does not parse is an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no classification store at {}, starting empty", path.display());
                return Ok(Self::empty(path));
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let entries: BTreeMap<String, ClassificationEntry> = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        for (key, entry) in &entries {
            if *key != entry.key() {
                return Err(StoreError::Corrupt {
                    path,
                    reason: format!("key {:?} does not match frame {}", key, entry.frame),
                });
            }
        }

        let mut counts = CategoryCounts::default();
        for entry in entries.values() {
            counts.add(entry);
        }
        info!(
            "loaded {} classifications from {}",
            entries.len(),
            path.display()
        );
        Ok(Self {
            path,
            entries,
            counts,
        })
    }

    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
            counts: CategoryCounts::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts or overwrites the entry for the frame. Returns the replaced
    /// entry when reclassifying.
    pub fn upsert(&mut self, entry: ClassificationEntry) -> Option<ClassificationEntry> {
        self.counts.add(&entry);
        let previous = self.entries.insert(entry.key(), entry);
        if let Some(old) = &previous {
            self.counts.remove(old);
        }
        previous
    }

    /// Writes the whole mapping as one atomic replace of the document.
    pub fn save(&self) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        let dir = parent_or_cwd(&self.path);
        std::fs::create_dir_all(dir).map_err(io_err)?;

        let json = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.write_all(b"\n").map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&ClassificationEntry> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ClassificationEntry> {
        self.entries.values()
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = &mut ClassificationEntry> {
        self.entries.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn counts(&self) -> &CategoryCounts {
        &self.counts
    }
}
