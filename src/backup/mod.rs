//! Zip backups of a server's data directory.
//!
//! A backup runs on the blocking pool while the server keeps running. Each
//! server owns one [`BackupSlot`]; claiming it is what makes a second backup
//! request fail with [`BackupError::AlreadyInProgress`] until the first one
//! finishes or fails.
//!
//! Archive names encode the local start time at minute granularity
//! (`{month}-{day}-{year}_{hour}-{minute}.zip`), which is also the sort key
//! for listing. Two backups started within the same minute overwrite each
//! other.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};
use tokio::task::JoinHandle;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const COPY_CHUNK: usize = 64 * 1024;
const ARCHIVE_EXT: &str = ".zip";

#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    #[error("A backup for server '{0}' is already in progress")]
    AlreadyInProgress(String),

    #[error("Data directory {0} does not exist")]
    SourceMissing(PathBuf),

    #[error("Backup '{0}' not found")]
    NotFound(String),

    #[error("Invalid backup name '{0}'")]
    InvalidName(String),

    #[error("Backup task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

impl BackupError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyInProgress(_) => "BACKUP_IN_PROGRESS",
            Self::SourceMissing(_) => "SOURCE_MISSING",
            Self::NotFound(_) => "BACKUP_NOT_FOUND",
            Self::InvalidName(_) => "INVALID_BACKUP_NAME",
            Self::Task(_) => "BACKUP_TASK_FAILED",
            Self::Io(_) | Self::Zip(_) => "BACKUP_IO_ERROR",
        }
    }
}

// ─── Slot ────────────────────────────────────────────────────

/// Ownership flag and progress of the (at most one) in-flight backup.
#[derive(Debug, Default)]
pub struct BackupSlot {
    in_flight: AtomicBool,
    progress: AtomicU8,
}

impl BackupSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(in_flight, percent)`.
    pub fn progress(&self) -> (bool, u8) {
        if self.in_flight.load(Ordering::Acquire) {
            (true, self.progress.load(Ordering::Acquire))
        } else {
            (false, 0)
        }
    }

    fn try_claim(self: &Arc<Self>) -> Option<SlotClaim> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| {
                self.progress.store(0, Ordering::Release);
                SlotClaim(Arc::clone(self))
            })
    }

    fn advance(&self, percent: u8) {
        self.progress.fetch_max(percent.min(100), Ordering::AcqRel);
    }
}

/// Releases the slot and resets progress when dropped, whatever the outcome.
struct SlotClaim(Arc<BackupSlot>);

impl Drop for SlotClaim {
    fn drop(&mut self) {
        self.0.progress.store(0, Ordering::Release);
        self.0.in_flight.store(false, Ordering::Release);
    }
}

// ─── Job ─────────────────────────────────────────────────────

/// Start archiving `source` into `backup_dir`. Returns as soon as the work
/// is scheduled; the handle resolves to the archive path.
pub fn start(
    server: &str,
    slot: &Arc<BackupSlot>,
    source: &Path,
    backup_dir: &Path,
) -> Result<JoinHandle<Result<PathBuf, BackupError>>, BackupError> {
    let claim = slot
        .try_claim()
        .ok_or_else(|| BackupError::AlreadyInProgress(server.to_string()))?;

    let archive = backup_dir.join(backup_file_name(Local::now().naive_local()));
    let source = source.to_path_buf();
    let server = server.to_string();
    tracing::info!("Backup of '{}' started → {}", server, archive.display());

    Ok(tokio::task::spawn_blocking(move || {
        let result = archive_directory(&source, &archive, &claim.0);
        match &result {
            Ok(path) => tracing::info!("Backup of '{}' done: {}", server, path.display()),
            Err(e) => {
                tracing::error!("Backup of '{}' failed: {}", server, e);
                if !matches!(e, BackupError::SourceMissing(_)) && archive.exists() {
                    if let Err(rm) = fs::remove_file(&archive) {
                        tracing::warn!("Could not remove partial archive {}: {}", archive.display(), rm);
                    }
                }
            }
        }
        drop(claim);
        result
    }))
}

struct Entry {
    path: PathBuf,
    name: String,
    size: u64,
    is_dir: bool,
}

/// Two passes: measure the tree, then stream it into a deflate archive.
fn archive_directory(source: &Path, archive: &Path, slot: &BackupSlot) -> Result<PathBuf, BackupError> {
    if !source.is_dir() {
        return Err(BackupError::SourceMissing(source.to_path_buf()));
    }
    if let Some(parent) = archive.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut entries = Vec::new();
    collect_entries(source, source, archive, &mut entries)?;
    let total: u64 = entries.iter().map(|e| e.size).sum();

    let mut zip = ZipWriter::new(File::create(archive)?);
    let mut written: u64 = 0;
    let mut accounted: u64 = 0;
    let mut buf = vec![0u8; COPY_CHUNK];

    for entry in &entries {
        if entry.is_dir {
            if let Err(e) = zip.add_directory(entry.name.as_str(), FileOptions::default()) {
                tracing::warn!("Skipping directory {}: {}", entry.path.display(), e);
            }
            continue;
        }

        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(entry.size >= u64::from(u32::MAX));

        // read fully first so a failing file never leaves a truncated entry behind
        match read_entry(entry, &mut buf, total, &mut written, slot) {
            Ok(data) => {
                zip.start_file(entry.name.as_str(), options)?;
                zip.write_all(&data)?;
            }
            Err(e) => tracing::warn!("Skipping file {}: {}", entry.path.display(), e),
        }
        // skipped bytes still count so progress keeps moving
        accounted += entry.size;
        written = written.max(accounted);
        slot.advance(percent(written, total));
    }

    zip.finish()?;
    slot.advance(100);
    Ok(archive.to_path_buf())
}

fn read_entry(
    entry: &Entry,
    buf: &mut [u8],
    total: u64,
    written: &mut u64,
    slot: &BackupSlot,
) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(&entry.path)?;
    let mut data = Vec::with_capacity(usize::try_from(entry.size).unwrap_or(0));
    loop {
        let n = file.read(buf)?;
        if n == 0 {
            return Ok(data);
        }
        data.extend_from_slice(&buf[..n]);
        *written += n as u64;
        slot.advance(percent(*written, total));
    }
}

fn percent(written: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (written.min(total) * 100 / total) as u8
}

fn collect_entries(root: &Path, dir: &Path, archive: &Path, out: &mut Vec<Entry>) -> Result<(), BackupError> {
    let read = fs::read_dir(dir)?;
    for item in read {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                continue;
            }
        };
        let path = item.path();
        if path == archive {
            continue;
        }
        let meta = match item.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        let Some(name) = archive_name(root, &path) else {
            continue;
        };

        if meta.is_dir() {
            out.push(Entry { path: path.clone(), name: format!("{}/", name), size: 0, is_dir: true });
            if let Err(e) = collect_entries(root, &path, archive, out) {
                tracing::warn!("Skipping directory {}: {}", path.display(), e);
            }
        } else {
            out.push(Entry { path, name, size: meta.len(), is_dir: false });
        }
    }
    Ok(())
}

/// Path relative to `root`, `/`-separated as zip expects.
fn archive_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

// ─── Naming & listing ────────────────────────────────────────

/// `{month}-{day}-{year}_{hour}-{minute}.zip`, no zero padding.
pub fn backup_file_name(at: NaiveDateTime) -> String {
    format!(
        "{}-{}-{}_{}-{}{}",
        at.month(),
        at.day(),
        at.year(),
        at.hour(),
        at.minute(),
        ARCHIVE_EXT
    )
}

/// Inverse of [`backup_file_name`] for an identifier without the extension.
pub fn parse_backup_name(name: &str) -> Option<NaiveDateTime> {
    let (date, time) = name.split_once('_')?;
    let mut date = date.split('-').map(str::parse::<u32>);
    let month = date.next()?.ok()?;
    let day = date.next()?.ok()?;
    let year = i32::try_from(date.next()?.ok()?).ok()?;
    let mut time = time.split('-').map(str::parse::<u32>);
    let hour = time.next()?.ok()?;
    let minute = time.next()?.ok()?;
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)
}

/// Backup identifiers in `backup_dir`, newest first. Files that do not follow
/// the naming scheme are ignored.
pub fn list_backups(backup_dir: &Path) -> Result<Vec<String>, BackupError> {
    if !backup_dir.is_dir() {
        tracing::debug!("Backup directory {} does not exist", backup_dir.display());
        return Ok(Vec::new());
    }

    let mut backups: Vec<(NaiveDateTime, String)> = Vec::new();
    for item in fs::read_dir(backup_dir)? {
        let item = item?;
        let file_name = item.file_name().to_string_lossy().into_owned();
        let Some(stem) = file_name.strip_suffix(ARCHIVE_EXT) else {
            continue;
        };
        match parse_backup_name(stem) {
            Some(at) => backups.push((at, stem.to_string())),
            None => tracing::debug!("Ignoring unrecognised backup file {}", file_name),
        }
    }

    backups.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    Ok(backups.into_iter().map(|(_, name)| name).collect())
}

// ─── Restore ─────────────────────────────────────────────────

/// Replace the contents of `data_dir` with the given backup.
///
/// Destructive: everything in `data_dir` is deleted before extraction. The
/// caller is responsible for making sure the server is stopped.
pub fn restore(data_dir: &Path, backup_dir: &Path, name: &str) -> Result<(), BackupError> {
    let stem = name.strip_suffix(ARCHIVE_EXT).unwrap_or(name);
    if stem.is_empty() || stem.contains(['/', '\\']) || stem.contains("..") {
        return Err(BackupError::InvalidName(name.to_string()));
    }
    let path = backup_dir.join(format!("{}{}", stem, ARCHIVE_EXT));
    if !path.is_file() {
        return Err(BackupError::NotFound(stem.to_string()));
    }

    // open first so a corrupt archive fails before anything is deleted
    let mut archive = ZipArchive::new(File::open(&path)?)?;

    clear_directory(data_dir)?;
    archive.extract(data_dir)?;
    tracing::info!("Restored backup {} into {}", stem, data_dir.display());
    Ok(())
}

fn clear_directory(dir: &Path) -> Result<(), BackupError> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        return Ok(());
    }
    for item in fs::read_dir(dir)? {
        let path = item?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populate(dir: &Path) {
        fs::create_dir_all(dir.join("world/region")).unwrap();
        fs::create_dir_all(dir.join("logs")).unwrap();
        fs::write(dir.join("server.properties"), "motd=hello\n").unwrap();
        fs::write(dir.join("world/level.dat"), vec![7u8; 200_000]).unwrap();
        fs::write(dir.join("world/region/r.0.0.mca"), vec![1u8; 50_000]).unwrap();
    }

    #[test]
    fn test_backup_file_name() {
        let at = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap().and_hms_opt(9, 5, 0).unwrap();
        assert_eq!(backup_file_name(at), "1-2-2024_9-5.zip");
        assert_eq!(parse_backup_name("1-2-2024_9-5"), Some(at));
        assert_eq!(parse_backup_name("13-2-2024_9-5"), None);
        assert_eq!(parse_backup_name("latest"), None);
    }

    #[test]
    fn test_list_backups_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["1-2-2024_10-30.zip", "1-2-2024_10-45.zip", "1-1-2024_9-0.zip", "notes.txt", "old.zip"] {
            fs::write(tmp.path().join(name), b"").unwrap();
        }
        assert_eq!(
            list_backups(tmp.path()).unwrap(),
            vec!["1-2-2024_10-45", "1-2-2024_10-30", "1-1-2024_9-0"]
        );
    }

    #[test]
    fn test_list_backups_missing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(list_backups(&tmp.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(50, 200), 25);
        assert_eq!(percent(500, 200), 100);
    }

    #[tokio::test]
    async fn test_backup_and_restore() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        let backups = tmp.path().join("backups");
        populate(&data);
        fs::create_dir_all(data.join("empty")).unwrap();

        let slot = BackupSlot::new();
        let handle = start("survival", &slot, &data, &backups).unwrap();
        let archive = handle.await.unwrap().unwrap();
        assert!(archive.exists());
        assert_eq!(slot.progress(), (false, 0));

        let listed = list_backups(&backups).unwrap();
        assert_eq!(listed.len(), 1);

        // wreck the data directory, then restore
        fs::remove_dir_all(data.join("world")).unwrap();
        fs::write(data.join("griefed.txt"), "oops").unwrap();

        restore(&data, &backups, &listed[0]).unwrap();
        assert!(!data.join("griefed.txt").exists());
        assert_eq!(fs::read(data.join("world/level.dat")).unwrap().len(), 200_000);
        assert_eq!(fs::read_to_string(data.join("server.properties")).unwrap(), "motd=hello\n");
        assert!(data.join("empty").is_dir());
    }

    #[tokio::test]
    async fn test_second_backup_rejected_while_in_flight() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        let backups = tmp.path().join("backups");
        populate(&data);
        let slot = BackupSlot::new();

        let held = slot.try_claim().unwrap();
        assert_eq!(slot.progress(), (true, 0));
        let second = start("survival", &slot, &data, &backups);
        assert!(matches!(second, Err(BackupError::AlreadyInProgress(_))));
        assert!(!backups.exists());
        drop(held);

        // slot released → a new backup may start
        let first = start("survival", &slot, &data, &backups).unwrap();
        first.await.unwrap().unwrap();
        assert_eq!(fs::read_dir(&backups).unwrap().count(), 1);
        assert_eq!(slot.progress(), (false, 0));
    }

    #[tokio::test]
    async fn test_missing_source_releases_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let slot = BackupSlot::new();
        let handle = start("ghost", &slot, &tmp.path().join("nope"), &tmp.path().join("b")).unwrap();
        assert!(matches!(handle.await.unwrap(), Err(BackupError::SourceMissing(_))));
        assert_eq!(slot.progress(), (false, 0));
        assert!(start("ghost", &slot, &tmp.path().join("nope"), &tmp.path().join("b")).is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_file_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        let backups = tmp.path().join("backups");
        populate(&data);
        // opening a dangling link fails even for root, unlike a chmod 000 file
        std::os::unix::fs::symlink(data.join("gone.dat"), data.join("world/session.lock")).unwrap();

        let slot = BackupSlot::new();
        let archive = start("survival", &slot, &data, &backups).unwrap().await.unwrap().unwrap();

        let mut zip = ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        assert!(zip.by_name("world/session.lock").is_err());
        assert_eq!(zip.by_name("world/level.dat").unwrap().size(), 200_000);
        assert_eq!(zip.by_name("world/region/r.0.0.mca").unwrap().size(), 50_000);
        let mut props = String::new();
        zip.by_name("server.properties").unwrap().read_to_string(&mut props).unwrap();
        assert_eq!(props, "motd=hello\n");
        assert_eq!(slot.progress(), (false, 0));
    }

    #[test]
    fn test_restore_rejects_bad_names() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            restore(tmp.path(), tmp.path(), "../etc"),
            Err(BackupError::InvalidName(_))
        ));
        assert!(matches!(
            restore(tmp.path(), tmp.path(), "1-1-2024_9-0"),
            Err(BackupError::NotFound(_))
        ));
    }
}
