//! Placement engine
//!
//! Turns a classified, resolved and arbitrated bundle into a
//! [`PlacementPlan`], then commits the plan as one unit:
//!
//! 1. every file is copied into a staging directory inside the category
//!    root, so the final step is a same-filesystem rename
//! 2. superseded versions are set aside into the staging directory
//! 3. staged files are renamed into place, each step journaled
//!
//! Any failure rolls the journal back, leaving the library as it was.
//! Removing the staging directory afterwards discards superseded versions.
//! A plan whose files do not fit on the library's filesystem is refused
//! before anything is staged.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sysinfo::Disks;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::arbiter::PlacementDecision;
use super::classifier::{Bundle, ItemKind};
use super::file_utils::{extension_of, format_bytes, is_subtitle_file};
use super::metadata::MediaType;
use super::naming::{FileRole, MediaTarget, PathFormatter, stem_of};
use crate::error::PipelineError;

pub const STAGING_PREFIX: &str = ".shelver-staging-";

/// Upper bound on ` (n)` suffixes tried for a free version name
const MAX_VERSION_SUFFIX: u32 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlannedRole {
    Primary,
    Extra,
    Subtitle,
}

impl fmt::Display for PlannedRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Primary => "primary",
            Self::Extra => "extra",
            Self::Subtitle => "subtitle",
        };
        f.pad(s)
    }
}

/// One source file and where it lands
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedFile {
    pub source: PathBuf,
    /// Absolute destination path
    pub destination: PathBuf,
    pub role: PlannedRole,
}

/// A primary that will not be placed, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPrimary {
    pub source: PathBuf,
    pub decision: PlacementDecision,
}

/// A primary's resolved destination identity and arbiter decision
#[derive(Debug, Clone)]
pub struct PrimaryAssignment {
    /// Index into [`Bundle::primaries`]
    pub index: usize,
    pub target: MediaTarget,
    pub decision: PlacementDecision,
}

/// Everything a bundle placement will do
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlacementPlan {
    pub category_root: PathBuf,
    pub files: Vec<PlannedFile>,
    /// Existing library files removed once the new files are committed
    pub supersedes: Vec<PathBuf>,
    pub skipped: Vec<SkippedPrimary>,
    /// Bytes staged into the category root
    pub total_bytes: u64,
}

impl PlacementPlan {
    pub fn primaries_placed(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.role == PlannedRole::Primary)
            .count()
    }

    /// True when the bundle had primaries and none of them will be placed
    pub fn all_primaries_skipped(&self) -> bool {
        self.primaries_placed() == 0 && !self.skipped.is_empty()
    }

    /// Free bytes on the filesystem holding the category root, if known
    pub fn free_space(&self) -> Option<u64> {
        available_space(&self.category_root)
    }

    /// Refuse the plan when `available` bytes cannot hold its files.
    ///
    /// Superseded versions are only removed after the commit, so they do not
    /// count towards the space a placement needs.
    pub fn check_space(&self, available: Option<u64>) -> Result<(), PipelineError> {
        let Some(available) = available else {
            return Ok(());
        };
        match shortfall(self.total_bytes, available) {
            Some(short) => Err(PipelineError::placement(
                &self.category_root,
                io::Error::new(
                    io::ErrorKind::StorageFull,
                    format!(
                        "not enough disk space: need {}, {} free, short by {}",
                        format_bytes(self.total_bytes),
                        format_bytes(available),
                        format_bytes(short)
                    ),
                ),
            )),
            None => Ok(()),
        }
    }
}

/// Bytes missing when `needed` exceeds `available`
pub fn shortfall(needed: u64, available: u64) -> Option<u64> {
    needed.checked_sub(available).filter(|short| *short > 0)
}

/// Available bytes on the mounted filesystem whose mount point is the longest
/// prefix of `path`. The path does not need to exist yet.
pub fn available_space(path: &Path) -> Option<u64> {
    let path = std::path::absolute(path).ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().components().count())
        .map(|disk| disk.available_space())
}

/// What a committed placement changed
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlacementReport {
    pub placed: Vec<PathBuf>,
    pub superseded: Vec<PathBuf>,
}

/// Relative path of a primary without a version label.
///
/// Its parent is the directory existing versions live in and its stem is the
/// base every version name extends.
pub fn primary_base(formatter: &dyn PathFormatter, target: &MediaTarget, extension: &str) -> PathBuf {
    formatter.format(target, FileRole::Primary { version: None }, extension)
}

/// Compute destinations for every file of a bundle
pub fn plan(
    bundle: &Bundle,
    assignments: &[PrimaryAssignment],
    category_root: &Path,
    formatter: &dyn PathFormatter,
) -> PlacementPlan {
    let mut plan = PlacementPlan {
        category_root: category_root.to_path_buf(),
        ..Default::default()
    };
    let mut taken: HashSet<PathBuf> = HashSet::new();

    for assignment in assignments {
        let primary = &bundle.primaries[assignment.index];
        let extension = extension_of(&primary.path).unwrap_or_else(|| "mkv".to_string());

        if !assignment.decision.places_file() {
            plan.skipped.push(SkippedPrimary {
                source: primary.path.clone(),
                decision: assignment.decision.clone(),
            });
            continue;
        }

        let replaced: Vec<PathBuf> = match &assignment.decision {
            PlacementDecision::UpgradeReplace { replaces } => replaces.clone(),
            _ => Vec::new(),
        };
        for old in &replaced {
            plan.supersedes.push(old.clone());
            plan.supersedes.extend(sidecar_subtitles(old));
        }

        let alongside = matches!(assignment.decision, PlacementDecision::UpgradeAddAlongside { .. });
        // Movies always carry their version label, episodes only next to another version
        let version = match bundle.media_type {
            MediaType::Movie => primary.version.clone(),
            MediaType::Series if alongside => primary.version.clone(),
            MediaType::Series => None,
        };

        let is_free = |candidate: &Path| {
            !taken.contains(candidate)
                && (replaced.iter().any(|r| r == candidate) || !candidate.exists())
        };
        let version = free_version(version, |v| {
            let relative = formatter.format(
                &assignment.target,
                FileRole::Primary { version: v },
                &extension,
            );
            is_free(&category_root.join(relative))
        });
        let destination = category_root.join(formatter.format(
            &assignment.target,
            FileRole::Primary {
                version: version.as_deref(),
            },
            &extension,
        ));

        taken.insert(destination.clone());
        plan.files.push(PlannedFile {
            source: primary.path.clone(),
            destination,
            role: PlannedRole::Primary,
        });

        for subtitle in bundle.subtitles.iter().filter(|s| s.primary == assignment.index) {
            let extension = extension_of(&subtitle.path).unwrap_or_else(|| "srt".to_string());
            let destination = category_root.join(formatter.format(
                &assignment.target,
                FileRole::Subtitle {
                    version: version.as_deref(),
                    language: &subtitle.language,
                    forced: subtitle.forced,
                    sdh: subtitle.sdh,
                },
                &extension,
            ));

            if taken.contains(&destination) {
                warn!(file = %subtitle.path.display(), "Another subtitle already claims this name, skipping");
                continue;
            }
            if destination.exists() && !plan.supersedes.contains(&destination) {
                warn!(file = %destination.display(), "Subtitle already in library, keeping existing");
                continue;
            }
            taken.insert(destination.clone());
            plan.files.push(PlannedFile {
                source: subtitle.path.clone(),
                destination,
                role: PlannedRole::Subtitle,
            });
        }
    }

    // Extras belong to the title (or season) folder, not to one primary
    if let Some(first) = assignments.first() {
        let mut folder_target = first.target.clone();
        folder_target.episode = None;
        folder_target.end_episode = None;
        folder_target.edition = None;

        for extra in &bundle.extras {
            let file_name = extra
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let extension = extension_of(&extra.path).unwrap_or_default();
            let mut destination = category_root.join(formatter.format(
                &folder_target,
                FileRole::Extra {
                    kind: extra.kind,
                    file_name: &file_name,
                },
                &extension,
            ));

            if destination.exists() || taken.contains(&destination) {
                let same_size = file_size(&destination) == file_size(&extra.path);
                if same_size && !taken.contains(&destination) {
                    debug!(file = %destination.display(), "Extra already in library");
                    continue;
                }
                match numbered_sibling(&destination, |p| !p.exists() && !taken.contains(p)) {
                    Some(free) => destination = free,
                    None => {
                        warn!(file = %extra.path.display(), "No free name for extra, skipping");
                        continue;
                    }
                }
            }
            taken.insert(destination.clone());
            plan.files.push(PlannedFile {
                source: extra.path.clone(),
                destination,
                role: PlannedRole::Extra,
            });
        }
    }

    plan.total_bytes = plan.files.iter().filter_map(|f| file_size(&f.source)).sum();
    plan
}

/// First free version label: the label itself, then `label (2)`, `label (3)`
/// or `Version 2`, `Version 3` when there is no label. A name is taken when
/// it exists in the library or another primary of the bundle claimed it.
fn free_version<F>(version: Option<String>, is_free: F) -> Option<String>
where
    F: Fn(Option<&str>) -> bool,
{
    if is_free(version.as_deref()) {
        return version;
    }
    for n in 2..=MAX_VERSION_SUFFIX {
        let candidate = match &version {
            Some(label) => format!("{} ({})", label, n),
            None => format!("Version {}", n),
        };
        if is_free(Some(&candidate)) {
            return Some(candidate);
        }
    }
    version
}

fn numbered_sibling<F>(path: &Path, is_free: F) -> Option<PathBuf>
where
    F: Fn(&Path) -> bool,
{
    let stem = stem_of(path);
    let extension = extension_of(path);
    (2..=MAX_VERSION_SUFFIX)
        .map(|n| {
            let name = match &extension {
                Some(ext) => format!("{} ({}).{}", stem, n, ext),
                None => format!("{} ({})", stem, n),
            };
            path.with_file_name(name)
        })
        .find(|candidate| is_free(candidate))
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}

/// Subtitles next to a library video that belong to it (`Stem.lang.ext`)
fn sidecar_subtitles(video: &Path) -> Vec<PathBuf> {
    let (Some(dir), stem) = (video.parent(), stem_of(video)) else {
        return Vec::new();
    };
    let prefix = format!("{}.", stem);
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut sidecars: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            is_subtitle_file(path)
                && path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with(&prefix))
        })
        .collect();
    sidecars.sort();
    sidecars
}

enum JournalEntry {
    CreatedDir(PathBuf),
    SetAside { original: PathBuf, backup: PathBuf },
    Committed(PathBuf),
}

/// Commit a plan: stage, set aside superseded files, rename into place
pub async fn execute(plan: &PlacementPlan) -> Result<PlacementReport, PipelineError> {
    if plan.files.is_empty() && plan.supersedes.is_empty() {
        return Ok(PlacementReport::default());
    }

    let root = plan.category_root.clone();
    let available = tokio::task::spawn_blocking(move || available_space(&root))
        .await
        .ok()
        .flatten();
    if available.is_none() {
        debug!(root = %plan.category_root.display(), "Free space unknown, not checking");
    }
    plan.check_space(available)?;

    tokio::fs::create_dir_all(&plan.category_root)
        .await
        .map_err(|e| PipelineError::placement(&plan.category_root, e))?;

    let staging = plan
        .category_root
        .join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4()));
    tokio::fs::create_dir(&staging)
        .await
        .map_err(|e| PipelineError::placement(&staging, e))?;

    let result = stage_and_commit(plan, &staging).await;

    if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
        warn!(staging = %staging.display(), error = %e, "Failed to remove staging directory");
    }
    result
}

async fn stage_and_commit(
    plan: &PlacementPlan,
    staging: &Path,
) -> Result<PlacementReport, PipelineError> {
    let mut staged = Vec::with_capacity(plan.files.len());
    for (index, file) in plan.files.iter().enumerate() {
        let staged_path = staging.join(format!("{:04}", index));
        debug!(
            source = %file.source.display(),
            staged = %staged_path.display(),
            "Staging file"
        );
        tokio::fs::copy(&file.source, &staged_path)
            .await
            .map_err(|e| PipelineError::placement(&file.source, e))?;
        staged.push(staged_path);
    }

    let mut journal: Vec<JournalEntry> = Vec::new();
    match commit(plan, staging, &staged, &mut journal).await {
        Ok(report) => Ok(report),
        Err(e) => {
            error!(error = %e, steps = journal.len(), "Placement failed, rolling back");
            rollback(journal).await;
            Err(e)
        }
    }
}

async fn commit(
    plan: &PlacementPlan,
    staging: &Path,
    staged: &[PathBuf],
    journal: &mut Vec<JournalEntry>,
) -> Result<PlacementReport, PipelineError> {
    let mut report = PlacementReport::default();

    for (index, original) in plan.supersedes.iter().enumerate() {
        if !original.exists() {
            continue;
        }
        let backup = staging.join(format!("superseded-{:04}", index));
        tokio::fs::rename(original, &backup)
            .await
            .map_err(|e| PipelineError::placement(original, e))?;
        journal.push(JournalEntry::SetAside {
            original: original.clone(),
            backup,
        });
        report.superseded.push(original.clone());
    }

    for (file, staged_path) in plan.files.iter().zip(staged) {
        if let Some(parent) = file.destination.parent() {
            create_dirs(parent, journal)
                .await
                .map_err(|e| PipelineError::placement(parent, e))?;
        }

        if tokio::fs::try_exists(&file.destination).await.unwrap_or(true) {
            return Err(PipelineError::placement(
                &file.destination,
                io::Error::new(io::ErrorKind::AlreadyExists, "destination appeared during placement"),
            ));
        }

        tokio::fs::rename(staged_path, &file.destination)
            .await
            .map_err(|e| PipelineError::placement(&file.destination, e))?;
        journal.push(JournalEntry::Committed(file.destination.clone()));
        debug!(
            role = %file.role,
            destination = %file.destination.display(),
            "Committed file"
        );
        report.placed.push(file.destination.clone());
    }

    Ok(report)
}

/// Create missing ancestors of `dir`, journaling each one created
async fn create_dirs(dir: &Path, journal: &mut Vec<JournalEntry>) -> io::Result<()> {
    let mut missing = Vec::new();
    let mut current = Some(dir);
    while let Some(path) = current {
        if tokio::fs::try_exists(path).await? {
            break;
        }
        missing.push(path.to_path_buf());
        current = path.parent();
    }

    for path in missing.into_iter().rev() {
        match tokio::fs::create_dir(&path).await {
            Ok(()) => journal.push(JournalEntry::CreatedDir(path)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn rollback(journal: Vec<JournalEntry>) {
    for entry in journal.into_iter().rev() {
        let result = match &entry {
            JournalEntry::Committed(path) => tokio::fs::remove_file(path).await,
            JournalEntry::SetAside { original, backup } => tokio::fs::rename(backup, original).await,
            JournalEntry::CreatedDir(path) => tokio::fs::remove_dir(path).await,
        };
        if let Err(e) = result {
            let path = match &entry {
                JournalEntry::Committed(path) | JournalEntry::CreatedDir(path) => path,
                JournalEntry::SetAside { original, .. } => original,
            };
            error!(path = %path.display(), error = %e, "Rollback step failed");
        }
    }
}

/// Remove the source item after a successful placement
pub async fn remove_source(bundle: &Bundle) -> io::Result<()> {
    info!(item = %bundle.root.display(), "Removing source item");
    match bundle.kind {
        ItemKind::File => tokio::fs::remove_file(&bundle.root).await,
        ItemKind::Directory => tokio::fs::remove_dir_all(&bundle.root).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Vocabulary;
    use crate::services::classifier::BundleClassifier;
    use crate::services::naming::PlexPathFormatter;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn movie_target() -> MediaTarget {
        MediaTarget {
            media_type: MediaType::Movie,
            catalog_id: "12".into(),
            title: "Movie Name".into(),
            year: Some(2020),
            season: None,
            episode: None,
            end_episode: None,
            edition: None,
        }
    }

    fn classify(dir: &Path) -> Bundle {
        BundleClassifier::new(Vocabulary::default(), 0, None)
            .classify(dir)
            .unwrap()
    }

    fn write(path: &Path, contents: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    // =========================================================================
    // Planning
    // =========================================================================

    #[test]
    fn test_plan_places_primary_subtitle_and_extra() {
        let source = TempDir::new().unwrap();
        let library = TempDir::new().unwrap();
        let item = source.path().join("Movie.Name.2020.1080p");
        write(&item.join("Movie.Name.2020.1080p.mkv"), b"movie");
        write(&item.join("Movie.Name.2020.1080p.eng.srt"), b"subs");
        write(&item.join("Movie.Name.Trailer.mkv"), b"trailer");

        let bundle = classify(&item);
        let plan = plan(
            &bundle,
            &[PrimaryAssignment {
                index: 0,
                target: movie_target(),
                decision: PlacementDecision::New,
            }],
            library.path(),
            &PlexPathFormatter,
        );

        let destinations: Vec<PathBuf> = plan
            .files
            .iter()
            .map(|f| f.destination.strip_prefix(library.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            destinations,
            vec![
                PathBuf::from("Movie Name (2020) {tvdb-12}/Movie Name (2020) - 1080p.mkv"),
                PathBuf::from("Movie Name (2020) {tvdb-12}/Movie Name (2020) - 1080p.en.srt"),
                PathBuf::from("Movie Name (2020) {tvdb-12}/Trailers/Movie.Name.Trailer.mkv"),
            ]
        );
        assert!(!plan.all_primaries_skipped());
    }

    #[test]
    fn test_plan_numbers_alongside_versions() {
        let source = TempDir::new().unwrap();
        let library = TempDir::new().unwrap();
        let item = source.path().join("Movie.Name.2020.1080p.mkv");
        write(&item, b"new");
        let existing = library
            .path()
            .join("Movie Name (2020) {tvdb-12}/Movie Name (2020) - 1080p.mkv");
        write(&existing, b"old");

        let bundle = classify(&item);
        let plan = plan(
            &bundle,
            &[PrimaryAssignment {
                index: 0,
                target: movie_target(),
                decision: PlacementDecision::UpgradeAddAlongside {
                    existing: vec![existing.clone()],
                },
            }],
            library.path(),
            &PlexPathFormatter,
        );

        assert_eq!(stem_of(&plan.files[0].destination), "Movie Name (2020) - 1080p (2)");
        assert!(plan.supersedes.is_empty());
    }

    #[test]
    fn test_plan_numbers_same_label_primaries_of_one_bundle() {
        let source = TempDir::new().unwrap();
        let library = TempDir::new().unwrap();
        let item = source.path().join("Movie.Name.2020.1080p");
        write(&item.join("Movie.Name.2020.1080p.CD1.mkv"), b"part one");
        write(&item.join("Movie.Name.2020.1080p.CD2.mkv"), b"part two");

        let bundle = classify(&item);
        assert_eq!(bundle.primaries.len(), 2);
        let assignments: Vec<PrimaryAssignment> = (0..2)
            .map(|index| PrimaryAssignment {
                index,
                target: movie_target(),
                decision: PlacementDecision::New,
            })
            .collect();
        let plan = plan(&bundle, &assignments, library.path(), &PlexPathFormatter);

        let stems: Vec<String> = plan.files.iter().map(|f| stem_of(&f.destination)).collect();
        assert_eq!(
            stems,
            vec!["Movie Name (2020) - 1080p", "Movie Name (2020) - 1080p (2)"]
        );
    }

    #[test]
    fn test_plan_skip_keeps_primary_out() {
        let source = TempDir::new().unwrap();
        let item = source.path().join("Movie.Name.2020.720p.mkv");
        write(&item, b"new");

        let bundle = classify(&item);
        let plan = plan(
            &bundle,
            &[PrimaryAssignment {
                index: 0,
                target: movie_target(),
                decision: PlacementDecision::SkipLowerQuality {
                    better: PathBuf::from("/lib/x.mkv"),
                },
            }],
            Path::new("/lib"),
            &PlexPathFormatter,
        );
        assert!(plan.files.is_empty());
        assert!(plan.all_primaries_skipped());
    }

    // =========================================================================
    // Execution
    // =========================================================================

    #[tokio::test]
    async fn test_execute_replaces_superseded_version() {
        let source = TempDir::new().unwrap();
        let library = TempDir::new().unwrap();
        let item = source.path().join("Movie.Name.2020.2160p.mkv");
        write(&item, b"4k");
        let folder = library.path().join("Movie Name (2020) {tvdb-12}");
        let old = folder.join("Movie Name (2020) - 1080p.mkv");
        let old_sub = folder.join("Movie Name (2020) - 1080p.en.srt");
        write(&old, b"hd");
        write(&old_sub, b"subs");

        let bundle = classify(&item);
        let plan = plan(
            &bundle,
            &[PrimaryAssignment {
                index: 0,
                target: movie_target(),
                decision: PlacementDecision::UpgradeReplace {
                    replaces: vec![old.clone()],
                },
            }],
            library.path(),
            &PlexPathFormatter,
        );
        assert_eq!(plan.supersedes, vec![old.clone(), old_sub.clone()]);

        let report = execute(&plan).await.unwrap();
        assert_eq!(report.placed, vec![folder.join("Movie Name (2020) - 4K.mkv")]);
        assert!(!old.exists());
        assert!(!old_sub.exists());
        assert_eq!(std::fs::read(folder.join("Movie Name (2020) - 4K.mkv")).unwrap(), b"4k");
        // Copy semantics: the source is untouched
        assert!(item.exists());

        let leftovers: Vec<_> = std::fs::read_dir(library.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(STAGING_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back() {
        let source = TempDir::new().unwrap();
        let library = TempDir::new().unwrap();
        let first = source.path().join("a.mkv");
        let second = source.path().join("b.mkv");
        write(&first, b"a");
        write(&second, b"b");
        let old = library.path().join("Old/old.mkv");
        write(&old, b"old");
        // A file where a directory must be created makes the second rename fail
        write(&library.path().join("Blocked"), b"not a directory");

        let plan = PlacementPlan {
            category_root: library.path().to_path_buf(),
            files: vec![
                PlannedFile {
                    source: first,
                    destination: library.path().join("New/a.mkv"),
                    role: PlannedRole::Primary,
                },
                PlannedFile {
                    source: second,
                    destination: library.path().join("Blocked/b.mkv"),
                    role: PlannedRole::Primary,
                },
            ],
            supersedes: vec![old.clone()],
            skipped: Vec::new(),
            total_bytes: 2,
        };

        let err = execute(&plan).await.unwrap_err();
        assert!(matches!(err, PipelineError::Placement { .. }));
        assert!(old.exists());
        assert!(!library.path().join("New").exists());
        assert_eq!(std::fs::read_dir(library.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_plan_totals_source_bytes() {
        let source = TempDir::new().unwrap();
        let library = TempDir::new().unwrap();
        let item = source.path().join("Movie.Name.2020.1080p");
        write(&item.join("Movie.Name.2020.1080p.mkv"), &[0u8; 3000]);
        write(&item.join("Movie.Name.2020.1080p.eng.srt"), &[0u8; 200]);

        let bundle = classify(&item);
        let assignments = vec![PrimaryAssignment {
            index: 0,
            target: movie_target(),
            decision: PlacementDecision::New,
        }];
        let plan = plan(&bundle, &assignments, library.path(), &PlexPathFormatter);
        assert_eq!(plan.files.len(), 2);
        assert_eq!(plan.total_bytes, 3200);
    }

    #[test]
    fn test_shortfall() {
        assert_eq!(shortfall(100, 250), None);
        assert_eq!(shortfall(250, 250), None);
        assert_eq!(shortfall(300, 250), Some(50));
    }

    #[test]
    fn test_check_space_refuses_oversized_plan() {
        let plan = PlacementPlan {
            category_root: PathBuf::from("/library/movies"),
            total_bytes: 3 * 1024 * 1024,
            ..Default::default()
        };

        let err = plan.check_space(Some(1024 * 1024)).unwrap_err();
        assert_matches!(err, PipelineError::Placement { ref source, .. } => {
            assert_eq!(source.kind(), io::ErrorKind::StorageFull);
            assert!(source.to_string().contains("short by 2.0 MB"));
        });

        assert!(plan.check_space(Some(4 * 1024 * 1024)).is_ok());
        assert!(plan.check_space(None).is_ok());
    }

    #[test]
    fn test_available_space_for_missing_path() {
        let library = TempDir::new().unwrap();
        let here = available_space(library.path());
        let below = available_space(&library.path().join("not/created/yet"));
        assert_eq!(here.is_some(), below.is_some());
    }

    #[tokio::test]
    async fn test_missing_source_leaves_library_untouched() {
        let library = TempDir::new().unwrap();
        let plan = PlacementPlan {
            category_root: library.path().to_path_buf(),
            files: vec![PlannedFile {
                source: PathBuf::from("/nonexistent/file.mkv"),
                destination: library.path().join("Movie/file.mkv"),
                role: PlannedRole::Primary,
            }],
            ..Default::default()
        };

        assert!(execute(&plan).await.is_err());
        assert_eq!(std::fs::read_dir(library.path()).unwrap().count(), 0);
    }
}
