use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::{StoreError, TaskStore};
use crate::error::Result;
use crate::model::{Ledger, Record};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

pub const STORE_FILE: &str = "store.jsonl";
pub const LOCK_FILE: &str = "store.lock";

/// RAII guard for the store lock - released on drop
struct FileLock {
    #[cfg(unix)]
    file: File,
}

impl FileLock {
    /// Acquire an exclusive lock on a lock file, blocking until available
    #[cfg(unix)]
    fn acquire(lock_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if ret != 0 {
            return Err(StoreError::Lock(format!(
                "Failed to acquire lock on {:?}: {}",
                lock_path,
                std::io::Error::last_os_error()
            )));
        }

        Ok(FileLock { file })
    }

    #[cfg(not(unix))]
    fn acquire(_lock_path: &Path) -> Result<Self, StoreError> {
        // No flock here; a single orchestrating process is assumed
        Ok(FileLock {})
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            // Best effort; closing the fd releases it anyway
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

/// JSONL-backed store under a state directory.
///
/// Each transaction holds `store.lock` for the whole load/apply/write
/// cycle, so concurrent CLI processes serialize on it.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open a store in `dir`. The file itself is created by [`FileStore::create`].
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the directory and an empty store file if they don't exist
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::open(dir);
        std::fs::create_dir_all(&store.dir)?;
        let _lock = FileLock::acquire(&store.lock_path())?;
        if !store.path().exists() {
            File::create(store.path())?;
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(STORE_FILE)
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }
}

impl TaskStore for FileStore {
    fn transact(&self, apply: &mut dyn FnMut(&mut Ledger) -> Result<()>) -> Result<()> {
        let _lock = FileLock::acquire(&self.lock_path())?;
        let mut ledger = load_ledger(&self.path())?;
        apply(&mut ledger)?;
        save_ledger(&ledger, &self.path())?;
        Ok(())
    }

    fn snapshot(&self) -> Result<Ledger> {
        let _lock = FileLock::acquire(&self.lock_path())?;
        Ok(load_ledger(&self.path())?)
    }
}

/// Parse a JSONL store file. Caller holds the lock.
fn load_ledger(path: &Path) -> Result<Ledger, StoreError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::Missing(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    let reader = BufReader::new(file);
    let mut ledger = Ledger::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let record: Record = serde_json::from_str(trimmed).map_err(|e| StoreError::Json {
            line: line_num + 1,
            source: e,
        })?;
        if ledger.contains(record.kind(), record.id()) {
            tracing::warn!(
                id = record.id(),
                line = line_num + 1,
                "duplicate record id, overwriting previous definition"
            );
        }
        ledger.insert(record);
    }

    Ok(ledger)
}

/// Write the ledger via temp file + fsync + rename. Caller holds the lock.
fn save_ledger(ledger: &Ledger, path: &Path) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or(Path::new("."));
    let tmp_path = parent.join(format!(".store.tmp.{}", std::process::id()));

    let result = (|| -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        for record in ledger.records() {
            let json = serde_json::to_string(&record)
                .map_err(|e| StoreError::Json { line: 0, source: e })?;
            writeln!(file, "{}", json)?;
        }

        file.flush()?;
        file.sync_all()?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            std::fs::rename(&tmp_path, path)?;
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::model::Project;
    use crate::store::StoreExt;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FileStore) {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::create(tmp.path().join(".autopilot")).unwrap();
        (tmp, store)
    }

    fn add_project(store: &FileStore, id: &str) {
        store
            .update(|ledger| {
                ledger.insert(Record::Project(Project::new(id, id)));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_create_makes_empty_store() {
        let (_tmp, store) = setup();
        assert!(store.exists());
        assert!(store.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_missing_store_is_reported() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::open(tmp.path().join("nowhere"));
        let err = store.snapshot().unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Missing(_))));
    }

    #[test]
    fn test_transaction_persists() {
        let (_tmp, store) = setup();
        add_project(&store, "p1");

        let reopened = FileStore::open(store.dir());
        assert_eq!(reopened.get_project("p1").unwrap().name, "p1");
        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(content.contains("\"kind\":\"project\""));
    }

    #[test]
    fn test_failed_transaction_writes_nothing() {
        let (_tmp, store) = setup();
        add_project(&store, "p1");
        let before = std::fs::read_to_string(store.path()).unwrap();

        let result = store.update(|ledger| {
            ledger.insert(Record::Project(Project::new("p2", "p2")));
            Err::<(), _>(Error::InvalidState("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), before);
    }

    #[test]
    fn test_load_skips_blank_lines_and_comments() {
        let (_tmp, store) = setup();
        let project = Record::Project(Project::new("p1", "Demo"));
        let content = format!(
            "# comment\n\n{}\n   \n",
            serde_json::to_string(&project).unwrap()
        );
        std::fs::write(store.path(), content).unwrap();
        assert_eq!(store.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_json_reports_line() {
        let (_tmp, store) = setup();
        std::fs::write(store.path(), "# header\n{not json}\n").unwrap();
        match store.snapshot().unwrap_err() {
            Error::Store(StoreError::Json { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_ids_last_wins() {
        let (_tmp, store) = setup();
        let first = Record::Project(Project::new("dup", "First"));
        let second = Record::Project(Project::new("dup", "Second"));
        let content = format!(
            "{}\n{}\n",
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        std::fs::write(store.path(), content).unwrap();
        assert_eq!(store.get_project("dup").unwrap().name, "Second");
    }

    #[test]
    fn test_concurrent_transactions_do_not_lose_writes() {
        use std::thread;

        let (_tmp, store) = setup();
        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                add_project(&store, &format!("p{}", i));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // The lock spans load and save, so every insert survives
        assert_eq!(store.snapshot().unwrap().projects().count(), 10);
    }
}
