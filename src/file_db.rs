//! Per-blog ledger of downloaded artifacts.
//!
//! Lookups are served from memory. Mutations mark the ledger dirty and are
//! written to the blog's SQLite file on [`FileDatabase::save`], which the
//! downloader calls periodically and once at the end of a run.
//!
//! Entries are keyed by the last path segment of the fetched URL (`link`).
//! When the media was posted under a different URL its last segment is kept
//! as `original_link`, a second key that survives CDN URL rotation.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::db::{Database, DbError};

/// Errors raised while loading or flushing a file database.
#[derive(Debug, Error)]
pub enum FileDbError {
    /// Opening or migrating the database failed.
    #[error(transparent)]
    Database(#[from] DbError),

    /// A query against the `files` table failed.
    #[error("file database query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// Creating the index directory failed.
    #[error("cannot create index directory {path}: {source}")]
    Io {
        /// Directory that could not be created.
        path: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// One downloaded artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// URL file name (post id for text artifacts).
    pub link: String,
    /// File name of the URL the media was originally posted under.
    pub original_link: Option<String>,
    /// Name of the file on disk.
    pub filename: String,
}

#[derive(Debug, Default)]
struct Ledger {
    entries: HashMap<String, FileEntry>,
    by_original: HashMap<String, String>,
    pending: HashSet<String>,
}

impl Ledger {
    fn insert(&mut self, entry: FileEntry) {
        if let Some(original) = &entry.original_link {
            self.by_original.insert(original.clone(), entry.link.clone());
        }
        self.entries.insert(entry.link.clone(), entry);
    }
}

/// Ledger of downloaded files for one blog.
#[derive(Debug)]
pub struct FileDatabase {
    db: Option<Database>,
    ledger: Mutex<Ledger>,
    dirty: AtomicBool,
}

impl FileDatabase {
    /// Opens the ledger stored at `path`, creating it when missing.
    ///
    /// # Errors
    ///
    /// Returns [`FileDbError`] when the directory, connection, migration or
    /// initial load fails.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self, FileDbError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| FileDbError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
        }
        let db = Database::open(path).await?;

        let rows: Vec<(String, Option<String>, String)> =
            sqlx::query_as("SELECT link, original_link, filename FROM files")
                .fetch_all(db.pool())
                .await?;

        let mut ledger = Ledger::default();
        for (link, original_link, filename) in rows {
            ledger.insert(FileEntry {
                link,
                original_link,
                filename,
            });
        }
        info!(entries = ledger.entries.len(), "file database loaded");

        Ok(Self {
            db: Some(db),
            ledger: Mutex::new(ledger),
            dirty: AtomicBool::new(false),
        })
    }

    /// Creates a ledger that is never persisted.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            db: None,
            ledger: Mutex::new(Ledger::default()),
            dirty: AtomicBool::new(false),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks whether `key` is known, as a URL file name or, with
    /// `is_original`, as an original-URL file name.
    #[must_use]
    pub fn contains(&self, key: &str, is_original: bool) -> bool {
        if key.is_empty() {
            return false;
        }
        let ledger = self.ledger();
        if is_original {
            ledger.by_original.contains_key(key)
        } else {
            ledger.entries.contains_key(key)
        }
    }

    /// Records a downloaded artifact. Empty links are ignored.
    pub fn add(&self, link: &str, original_link: Option<&str>, filename: &str) {
        if link.is_empty() {
            return;
        }
        let mut ledger = self.ledger();
        ledger.insert(FileEntry {
            link: link.to_string(),
            original_link: original_link.filter(|o| !o.is_empty()).map(ToString::to_string),
            filename: filename.to_string(),
        });
        ledger.pending.insert(link.to_string());
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Reserves `link` unless it is already known.
    ///
    /// Returns false when another item holds or has recorded `link`. A claim
    /// is not persisted until [`add`](Self::add) confirms it, and
    /// [`release`](Self::release) drops an unconfirmed claim. Empty links are
    /// always granted.
    pub fn claim(&self, link: &str, filename: &str) -> bool {
        if link.is_empty() {
            return true;
        }
        let mut ledger = self.ledger();
        if ledger.entries.contains_key(link) {
            return false;
        }
        ledger.insert(FileEntry {
            link: link.to_string(),
            original_link: None,
            filename: filename.to_string(),
        });
        true
    }

    /// Drops a claim that was never confirmed with [`add`](Self::add).
    pub fn release(&self, link: &str) {
        let mut ledger = self.ledger();
        if !ledger.pending.contains(link) {
            ledger.entries.remove(link);
        }
    }

    /// Attaches `original_link` to the entry found under `link`.
    pub fn update_original_link(&self, link: &str, original_link: &str) {
        let mut ledger = self.ledger();
        let Some(entry) = ledger.entries.get_mut(link) else {
            return;
        };
        if entry.original_link.as_deref() == Some(original_link) {
            return;
        }
        entry.original_link = Some(original_link.to_string());
        ledger
            .by_original
            .insert(original_link.to_string(), link.to_string());
        ledger.pending.insert(link.to_string());
        self.dirty.store(true, Ordering::SeqCst);
        debug!(link, original_link, "repaired original link");
    }

    /// Returns the entry stored under `link`.
    #[must_use]
    pub fn get(&self, link: &str) -> Option<FileEntry> {
        self.ledger().entries.get(link).cloned()
    }

    /// Number of known artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ledger().entries.len()
    }

    /// Returns true when no artifact is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when there are unsaved mutations.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Writes all unsaved mutations.
    ///
    /// On failure the mutations stay pending for the next save.
    ///
    /// # Errors
    ///
    /// Returns [`FileDbError::Query`] when the write transaction fails.
    #[instrument(skip(self))]
    pub async fn save(&self) -> Result<(), FileDbError> {
        let batch: Vec<FileEntry> = {
            let mut ledger = self.ledger();
            self.dirty.store(false, Ordering::SeqCst);
            let pending = std::mem::take(&mut ledger.pending);
            pending
                .iter()
                .filter_map(|link| ledger.entries.get(link).cloned())
                .collect()
        };

        let Some(db) = &self.db else {
            return Ok(());
        };
        if batch.is_empty() {
            return Ok(());
        }

        if let Err(e) = write_batch(db, &batch).await {
            let mut ledger = self.ledger();
            ledger
                .pending
                .extend(batch.into_iter().map(|entry| entry.link));
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        debug!(written = batch.len(), "file database saved");
        Ok(())
    }
}

async fn write_batch(db: &Database, batch: &[FileEntry]) -> Result<(), FileDbError> {
    let mut tx = db.pool().begin().await?;
    for entry in batch {
        sqlx::query(
            "INSERT INTO files (link, original_link, filename) VALUES (?, ?, ?) \
             ON CONFLICT(link) DO UPDATE SET original_link = excluded.original_link, \
             filename = excluded.filename",
        )
        .bind(&entry.link)
        .bind(&entry.original_link)
        .bind(&entry.filename)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}
