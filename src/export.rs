use anyhow::{Context, Result};
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::progress::ProgressHandle;
use crate::store::{ClassificationEntry, ClassificationStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    Copy,
    Move,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub exported: usize,
    pub already_present: usize,
    pub missing: usize,
    pub bytes: u64,
}

/// `<dest>/<category>[/<subphase>]/<file>`
pub fn destination_for(dest: &Path, entry: &ClassificationEntry) -> PathBuf {
    let mut path = dest.join(entry.category.name());
    if let Some(sub) = entry.subphase {
        path.push(sub.name());
    }
    path.join(entry.key())
}

/// Places every labeled frame into its category folder and records where it
/// went. The store is saved once at the end, also when some frames are missing
/// or a placement fails part way through.
pub fn export_frames(
    store: &mut ClassificationStore,
    dest: &Path,
    mode: ExportMode,
    progress: &ProgressHandle,
) -> Result<ExportStats> {
    let mut stats = ExportStats::default();
    progress.set_stage(format!("exporting to {}", dest.display()));

    let mut failure = None;
    for entry in store.entries_mut() {
        if let Err(e) = export_entry(entry, dest, mode, &mut stats, progress) {
            failure = Some(e);
            break;
        }
        progress.inc_position(1);
    }

    store
        .save()
        .with_context(|| format!("save {}", store.path().display()))?;
    match failure {
        Some(e) => Err(e),
        None => Ok(stats),
    }
}

/// A relabeled frame still sitting under its old category folder is moved
/// out of it, so each frame lives in exactly one folder.
fn export_entry(
    entry: &mut ClassificationEntry,
    dest: &Path,
    mode: ExportMode,
    stats: &mut ExportStats,
    progress: &ProgressHandle,
) -> Result<()> {
    let target = destination_for(dest, entry);
    let stale = entry
        .destination_path
        .clone()
        .filter(|old| *old != target && old.is_file());

    if entry.original_path.is_file() {
        let bytes = place(&entry.original_path, &target, mode)?;
        if let Some(old) = &stale {
            fs::remove_file(old).with_context(|| format!("remove {}", old.display()))?;
            debug!("{} relabeled, removed {}", entry.frame, old.display());
        }
        stats.exported += 1;
        stats.bytes += bytes;
        progress.record_frame(bytes);
    } else if let Some(old) = &stale {
        let bytes = place(old, &target, ExportMode::Move)?;
        debug!("{} relabeled, moved from {}", entry.frame, old.display());
        stats.exported += 1;
        stats.bytes += bytes;
        progress.record_frame(bytes);
    } else if target.is_file() {
        debug!("{} already at {}", entry.frame, target.display());
        stats.already_present += 1;
    } else {
        stats.missing += 1;
        progress.warn(format!(
            "{}: source {} not found",
            entry.frame,
            entry.original_path.display()
        ));
        return Ok(());
    }
    entry.destination_path = Some(target);
    Ok(())
}

fn place(source: &Path, target: &Path, mode: ExportMode) -> Result<u64> {
    if let Some(dir) = target.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    match mode {
        ExportMode::Copy => fs::copy(source, target)
            .with_context(|| format!("copy {} -> {}", source.display(), target.display())),
        ExportMode::Move => {
            let len = fs::metadata(source)
                .with_context(|| format!("stat {}", source.display()))?
                .len();
            if let Err(e) = fs::rename(source, target) {
                // Rename cannot cross filesystems.
                warn!(
                    "rename {} failed ({}), falling back to copy",
                    source.display(),
                    e
                );
                fs::copy(source, target).with_context(|| {
                    format!("copy {} -> {}", source.display(), target.display())
                })?;
                fs::remove_file(source)
                    .with_context(|| format!("remove {}", source.display()))?;
            }
            Ok(len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::{Category, Subphase};
    use crate::frame::FrameName;
    use crate::progress::{ProgressConfig, ProgressMode, ProgressReporter, ProgressUnit};
    use tempfile::TempDir;

    fn labeled(dir: &Path, n: u64, category: Category, sub: Option<Subphase>) -> ClassificationEntry {
        let frame = FrameName {
            round_id: 2,
            frame_number: n,
            timestamp: "20240101_120000".into(),
        };
        let path = dir.join(frame.file_name());
        fs::write(&path, vec![7u8; 10 * n as usize]).expect("write frame");
        ClassificationEntry::new(frame, category, sub, path).expect("entry")
    }

    fn reporter() -> ProgressReporter {
        ProgressReporter::new(
            "export-test",
            0,
            ProgressUnit::Files,
            ProgressConfig::new(ProgressMode::Quiet),
        )
    }

    #[test]
    fn copies_into_category_folders_and_records_destination() {
        let tmp = TempDir::new().expect("tempdir");
        let frames = tmp.path().join("frames");
        fs::create_dir_all(&frames).expect("mkdir");
        let mut store = ClassificationStore::empty(tmp.path().join("store.json"));
        store.upsert(labeled(&frames, 1, Category::FornoEnchendo, Some(Subphase::Inicio)));
        store.upsert(labeled(&frames, 2, Category::Null, None));

        let dest = tmp.path().join("sorted");
        let r = reporter();
        let stats = export_frames(&mut store, &dest, ExportMode::Copy, &r.handle()).expect("export");
        assert_eq!(stats.exported, 2);
        assert_eq!(stats.bytes, 30);

        let sorted = dest
            .join("forno_enchendo")
            .join("inicio")
            .join("round_2_1_20240101_120000.jpg");
        assert!(sorted.is_file());
        assert!(frames.join("round_2_1_20240101_120000.jpg").is_file());
        assert!(dest.join("null").join("round_2_2_20240101_120000.jpg").is_file());

        let reloaded = ClassificationStore::load(tmp.path().join("store.json")).expect("reload");
        let entry = reloaded.get("round_2_1_20240101_120000.jpg").expect("entry");
        assert_eq!(entry.destination_path.as_deref(), Some(sorted.as_path()));
    }

    fn relabel(store: &mut ClassificationStore, key: &str, category: Category) {
        let mut entry = store.get(key).expect("entry").clone();
        entry.category = category;
        entry.subphase = None;
        store.upsert(entry);
    }

    #[test]
    fn relabeled_copy_leaves_only_the_new_folder() {
        let tmp = TempDir::new().expect("tempdir");
        let mut store = ClassificationStore::empty(tmp.path().join("store.json"));
        store.upsert(labeled(tmp.path(), 4, Category::FornoVazio, None));
        let dest = tmp.path().join("sorted");
        let key = "round_2_4_20240101_120000.jpg";
        let r = reporter();

        export_frames(&mut store, &dest, ExportMode::Copy, &r.handle()).expect("first");
        relabel(&mut store, key, Category::FornoEnchendo);
        let stats = export_frames(&mut store, &dest, ExportMode::Copy, &r.handle()).expect("second");

        assert_eq!(stats.exported, 1);
        assert!(!dest.join("forno_vazio").join(key).exists());
        assert!(dest.join("forno_enchendo").join(key).is_file());
        assert!(tmp.path().join(key).is_file());
    }

    #[test]
    fn relabeled_move_relocates_the_exported_file() {
        let tmp = TempDir::new().expect("tempdir");
        let mut store = ClassificationStore::empty(tmp.path().join("store.json"));
        store.upsert(labeled(tmp.path(), 5, Category::FornoVazio, None));
        let dest = tmp.path().join("sorted");
        let key = "round_2_5_20240101_120000.jpg";
        let r = reporter();

        export_frames(&mut store, &dest, ExportMode::Move, &r.handle()).expect("first");
        relabel(&mut store, key, Category::DespejoAcontecendo);
        let stats = export_frames(&mut store, &dest, ExportMode::Move, &r.handle()).expect("second");

        assert_eq!(stats.exported, 1);
        assert_eq!(stats.missing, 0);
        assert!(!dest.join("forno_vazio").join(key).exists());
        let fresh = dest.join("despejo_acontecendo").join(key);
        assert!(fresh.is_file());
        let reloaded = ClassificationStore::load(tmp.path().join("store.json")).expect("reload");
        assert_eq!(
            reloaded.get(key).expect("entry").destination_path.as_deref(),
            Some(fresh.as_path())
        );
    }

    #[test]
    fn failed_placement_still_saves_progress() {
        let tmp = TempDir::new().expect("tempdir");
        let mut store = ClassificationStore::empty(tmp.path().join("store.json"));
        store.upsert(labeled(tmp.path(), 6, Category::FornoVazio, None));
        store.upsert(labeled(tmp.path(), 7, Category::FornoEnchendo, None));
        let dest = tmp.path().join("sorted");
        // A plain file where the second category folder should go.
        fs::create_dir_all(&dest).expect("mkdir");
        fs::write(dest.join("forno_enchendo"), b"blocker").expect("blocker");
        let r = reporter();

        let err = export_frames(&mut store, &dest, ExportMode::Move, &r.handle());
        assert!(err.is_err());

        let reloaded = ClassificationStore::load(tmp.path().join("store.json")).expect("reload");
        let moved = dest.join("forno_vazio").join("round_2_6_20240101_120000.jpg");
        assert!(moved.is_file());
        assert_eq!(
            reloaded
                .get("round_2_6_20240101_120000.jpg")
                .expect("entry")
                .destination_path
                .as_deref(),
            Some(moved.as_path())
        );
    }

    #[test]
    fn move_is_repeatable() {
        let tmp = TempDir::new().expect("tempdir");
        let mut store = ClassificationStore::empty(tmp.path().join("store.json"));
        store.upsert(labeled(tmp.path(), 3, Category::FornoVazio, None));
        let dest = tmp.path().join("sorted");
        let r = reporter();

        let first = export_frames(&mut store, &dest, ExportMode::Move, &r.handle()).expect("first");
        assert_eq!(first.exported, 1);
        assert!(!tmp.path().join("round_2_3_20240101_120000.jpg").exists());

        let second = export_frames(&mut store, &dest, ExportMode::Move, &r.handle()).expect("second");
        assert_eq!(second.exported, 0);
        assert_eq!(second.already_present, 1);
        assert_eq!(second.missing, 0);
    }
}
