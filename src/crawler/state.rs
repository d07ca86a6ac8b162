//! Run-scoped crawl state.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

/// Phases of one crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlPhase {
    NotStarted,
    CheckingLogin,
    DiscoveringHighestId,
    ScanningPages,
    Draining,
    Completed,
    IncompleteCompleted,
}

impl CrawlPhase {
    /// True for both terminal phases.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::IncompleteCompleted)
    }
}

impl fmt::Display for CrawlPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not started",
            Self::CheckingLogin => "checking login",
            Self::DiscoveringHighestId => "discovering highest id",
            Self::ScanningPages => "scanning pages",
            Self::Draining => "draining",
            Self::Completed => "completed",
            Self::IncompleteCompleted => "completed (incomplete)",
        };
        f.write_str(name)
    }
}

/// Shared by all walkers of one run.
#[derive(Debug)]
pub struct CrawlState {
    phase: Mutex<CrawlPhase>,
    incomplete: AtomicBool,
    pages_crawled: AtomicUsize,
    highest_id: AtomicU64,
}

impl Default for CrawlState {
    fn default() -> Self {
        Self {
            phase: Mutex::new(CrawlPhase::NotStarted),
            incomplete: AtomicBool::new(false),
            pages_crawled: AtomicUsize::new(0),
            highest_id: AtomicU64::new(0),
        }
    }
}

impl CrawlState {
    /// Fresh state in [`CrawlPhase::NotStarted`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> CrawlPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves to `next`.
    pub fn enter(&self, next: CrawlPhase) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(from = %*phase, to = %next, "crawl phase");
        *phase = next;
    }

    /// Moves to the terminal phase matching the incomplete flag.
    pub fn finish(&self) -> CrawlPhase {
        let terminal = if self.is_incomplete() {
            CrawlPhase::IncompleteCompleted
        } else {
            CrawlPhase::Completed
        };
        self.enter(terminal);
        terminal
    }

    /// Flags the run as incomplete; the cursor will not advance.
    pub fn mark_incomplete(&self) {
        self.incomplete.store(true, Ordering::SeqCst);
    }

    /// Whether any walker reported a partial failure.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        self.incomplete.load(Ordering::SeqCst)
    }

    /// Counts a processed page; returns the new total.
    pub fn page_crawled(&self) -> usize {
        self.pages_crawled.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Pages processed so far.
    #[must_use]
    pub fn pages_crawled(&self) -> usize {
        self.pages_crawled.load(Ordering::SeqCst)
    }

    /// Records the newest post id seen by discovery.
    pub fn observe_highest_id(&self, id: u64) {
        self.highest_id.fetch_max(id, Ordering::SeqCst);
    }

    /// Newest post id seen.
    #[must_use]
    pub fn highest_id(&self) -> u64 {
        self.highest_id.load(Ordering::SeqCst)
    }
}
