use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleet_sdk::lease::{LeaseError, LeaseStore};
use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, info};

/// Lease held as an advisory `flock` on `{dir}/{name}.lock`, for replicas that
/// share one host. The kernel drops the lock when the holder exits, so a
/// crashed leader is replaced without waiting for a TTL; `ttl` is unused.
///
/// The lock file carries the holder identity and last renewal time.
pub struct FileLeaseStore {
    dir: PathBuf,
    held: Mutex<HashMap<String, HeldLock>>,
}

struct HeldLock {
    holder: String,
    file: File,
}

impl FileLeaseStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LeaseError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            LeaseError::Backend(format!("create lock dir {}: {e}", dir.display()))
        })?;
        info!(dir = %dir.display(), "using file lease store");
        Ok(Self {
            dir,
            held: Mutex::new(HashMap::new()),
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        let file_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect();
        self.dir.join(format!("{file_name}.lock"))
    }
}

fn backend(path: &Path, err: std::io::Error) -> LeaseError {
    LeaseError::Backend(format!("{}: {err}", path.display()))
}

fn contended(err: &std::io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn open_lock(path: &Path) -> Result<File, LeaseError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| backend(path, e))
}

fn write_holder(file: &mut File, holder: &str) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{holder}\n{}\n", Utc::now().to_rfc3339())?;
    file.flush()
}

fn read_holder(file: &mut File) -> std::io::Result<Option<String>> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut contents)?;
    Ok(contents
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string))
}

// Every lock call is non-blocking and the files hold two short lines, so the
// trait methods run inline on the runtime.
#[async_trait]
impl LeaseStore for FileLeaseStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        _ttl: Duration,
    ) -> Result<bool, LeaseError> {
        let path = self.path(name);
        let mut held = self.held.lock();
        if let Some(lock) = held.get_mut(name) {
            if lock.holder != holder {
                return Ok(false);
            }
            write_holder(&mut lock.file, holder).map_err(|e| backend(&path, e))?;
            return Ok(true);
        }

        let mut file = open_lock(&path)?;
        if let Err(err) = FileExt::try_lock_exclusive(&file) {
            if contended(&err) {
                return Ok(false);
            }
            return Err(backend(&path, err));
        }
        if let Err(err) = write_holder(&mut file, holder) {
            let _ = FileExt::unlock(&file);
            return Err(backend(&path, err));
        }
        debug!(path = %path.display(), holder, "lock file acquired");
        held.insert(
            name.to_string(),
            HeldLock {
                holder: holder.to_string(),
                file,
            },
        );
        Ok(true)
    }

    async fn renew(&self, name: &str, holder: &str, _ttl: Duration) -> Result<bool, LeaseError> {
        let path = self.path(name);
        let mut held = self.held.lock();
        match held.get_mut(name) {
            Some(lock) if lock.holder == holder => {
                write_holder(&mut lock.file, holder).map_err(|e| backend(&path, e))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool, LeaseError> {
        let path = self.path(name);
        let mut held = self.held.lock();
        if !held.get(name).is_some_and(|lock| lock.holder == holder) {
            return Ok(false);
        }
        let Some(mut lock) = held.remove(name) else {
            return Ok(false);
        };
        // Cleared before unlocking so readers never see a stale holder.
        let cleared = lock.file.set_len(0);
        FileExt::unlock(&lock.file).map_err(|e| backend(&path, e))?;
        cleared.map_err(|e| backend(&path, e))?;
        debug!(path = %path.display(), holder, "lock file released");
        Ok(true)
    }

    async fn current_holder(&self, name: &str) -> Result<Option<String>, LeaseError> {
        let path = self.path(name);
        let mut held = self.held.lock();
        if let Some(lock) = held.get_mut(name) {
            return read_holder(&mut lock.file).map_err(|e| backend(&path, e));
        }
        if !path.exists() {
            return Ok(None);
        }
        let mut file = open_lock(&path)?;
        // Obtaining a shared lock means nobody holds the exclusive one; the
        // contents then belong to an exited holder.
        match FileExt::try_lock_shared(&file) {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                Ok(None)
            }
            Err(err) if contended(&err) => read_holder(&mut file).map_err(|e| backend(&path, e)),
            Err(err) => Err(backend(&path, err)),
        }
    }
}
