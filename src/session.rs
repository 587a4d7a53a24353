//! Labeling state machine over the ordered frame sequence.
//!
//! Two states: browsing, or a sub-phase key was pressed and a category key is
//! expected next. Every commit is autosaved, so an abrupt exit loses at most
//! the pending sub-phase selection.

use anyhow::{bail, Result};
use clap::ValueEnum;
use log::debug;

use crate::category::{Category, Subphase};
use crate::error::StoreError;
use crate::frame::FrameFile;
use crate::store::{ClassificationEntry, ClassificationStore};

/// Whether a non-null category may be committed without a sub-phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum SubphasePolicy {
    Optional,
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Relative move; ±1 steps and ±10/±100/±1000 jumps alike.
    Move(i64),
    SelectSubphase(Subphase),
    Classify(Category),
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Moved { from: usize, to: usize },
    SubphasePending(Subphase),
    Committed {
        entry: ClassificationEntry,
        previous: Option<Category>,
    },
    Rejected(&'static str),
    Quit,
}

pub struct ClassificationSession {
    frames: Vec<FrameFile>,
    current: usize,
    pending: Option<Subphase>,
    policy: SubphasePolicy,
    store: ClassificationStore,
    finished: bool,
}

impl ClassificationSession {
    pub fn new(
        frames: Vec<FrameFile>,
        store: ClassificationStore,
        policy: SubphasePolicy,
    ) -> Result<Self> {
        if frames.is_empty() {
            bail!("no frames to classify");
        }
        Ok(Self {
            frames,
            current: 0,
            pending: None,
            policy,
            store,
            finished: false,
        })
    }

    pub fn apply(&mut self, command: Command) -> Result<Outcome, StoreError> {
        if self.finished {
            return Ok(Outcome::Quit);
        }
        match command {
            Command::Move(delta) => {
                let from = self.current;
                let to = self.move_by(delta);
                Ok(Outcome::Moved { from, to })
            }
            Command::SelectSubphase(sub) => {
                self.pending = Some(sub);
                Ok(Outcome::SubphasePending(sub))
            }
            Command::Classify(Category::Null) => {
                self.pending = None;
                self.commit(Category::Null, None)
            }
            Command::Classify(category) => match (self.pending.take(), self.policy) {
                (Some(sub), _) => self.commit(category, Some(sub)),
                (None, SubphasePolicy::Optional) => self.commit(category, None),
                (None, SubphasePolicy::Required) => {
                    Ok(Outcome::Rejected("select a sub-phase (i/m/f) before the category"))
                }
            },
            Command::Quit => {
                self.finish()?;
                Ok(Outcome::Quit)
            }
        }
    }

    /// Moves by `delta` frames, clamped to the sequence. Returns the new index.
    pub fn move_by(&mut self, delta: i64) -> usize {
        let last = self.frames.len() - 1;
        let target = (self.current as i64).saturating_add(delta);
        self.current = target.clamp(0, last as i64) as usize;
        self.current
    }

    /// Final save. Idempotent.
    pub fn finish(&mut self) -> Result<(), StoreError> {
        if !self.finished {
            self.store.save()?;
            self.finished = true;
        }
        Ok(())
    }

    fn commit(
        &mut self,
        category: Category,
        subphase: Option<Subphase>,
    ) -> Result<Outcome, StoreError> {
        let frame = &self.frames[self.current];
        let mut entry = ClassificationEntry::new(
            frame.name.clone(),
            category,
            subphase,
            frame.path.clone(),
        )?;
        // Export needs the old location to clear it after a relabel.
        entry.destination_path = self
            .store
            .get(&entry.key())
            .and_then(|old| old.destination_path.clone());
        let previous = self.store.upsert(entry.clone()).map(|p| p.category);
        self.store.save()?;
        debug!(
            "committed {} as {}{}",
            entry.frame,
            category,
            subphase.map(|s| format!("/{}", s)).unwrap_or_default()
        );
        self.move_by(1);
        Ok(Outcome::Committed { entry, previous })
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_frame(&self) -> &FrameFile {
        &self.frames[self.current]
    }

    pub fn current_entry(&self) -> Option<&ClassificationEntry> {
        self.store.get(&self.current_frame().name.file_name())
    }

    pub fn pending_subphase(&self) -> Option<Subphase> {
        self.pending
    }

    pub fn policy(&self) -> SubphasePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn store(&self) -> &ClassificationStore {
        &self.store
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}
