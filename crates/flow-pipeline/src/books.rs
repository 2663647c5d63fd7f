//! Disk-usage bookkeeping for the flow directory.
//!
//! Every successfully published window adds its on-disk size to the running
//! totals; the summary is merged with any previous run's and persisted as
//! JSON in the flow directory on clean shutdown, so expiry tooling can see
//! cumulative usage without walking the tree.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const BOOKS_FILE: &str = ".flowcapd.books";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSummary {
    pub files: u64,
    pub bytes: u64,
    /// First/last published window start, seconds since epoch; 0 = none.
    pub first: i64,
    pub last: i64,
}

impl BookSummary {
    fn merge(&mut self, other: &BookSummary) {
        self.files += other.files;
        self.bytes += other.bytes;
        if self.first == 0 || (other.first != 0 && other.first < self.first) {
            self.first = other.first;
        }
        self.last = self.last.max(other.last);
    }
}

pub struct Bookkeeper {
    dir: PathBuf,
    summary: BookSummary,
}

impl Bookkeeper {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            summary: BookSummary::default(),
        }
    }

    /// Account one published window.
    pub fn update(&mut self, t_start: i64, bytes: u64) {
        self.summary.files += 1;
        self.summary.bytes += bytes;
        if self.summary.first == 0 || t_start < self.summary.first {
            self.summary.first = t_start;
        }
        self.summary.last = self.summary.last.max(t_start);
    }

    pub fn summary(&self) -> BookSummary {
        self.summary
    }

    /// Merge with a previous run's summary (if readable) and persist.
    pub fn save(&self) -> io::Result<()> {
        let path = self.dir.join(BOOKS_FILE);
        let mut total = self.summary;
        match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<BookSummary>(&bytes) {
                Ok(prev) => total.merge(&prev),
                Err(e) => warn!("ignoring unreadable book summary {}: {}", path.display(), e),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("ignoring unreadable book summary {}: {}", path.display(), e),
        }
        fs::write(&path, serde_json::to_vec_pretty(&total)?)?;
        info!(
            "books for {}: {} files, {} bytes total",
            self.dir.display(),
            total.files,
            total.bytes
        );
        Ok(())
    }
}
