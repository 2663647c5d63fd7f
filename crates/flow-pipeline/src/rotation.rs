//! Rotation window math and output file naming.
//!
//! Filenames round down to the `t_win` grid: `nfcapd.<TS>` / `pcapd.<TS>`
//! where `<TS>` is local time formatted with minute precision, or second
//! precision when the window is shorter than a minute. The optional `-S`
//! hierarchy spreads files over date subdirectories.

use chrono::{Local, TimeZone};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::error;

pub const MINUTE_EXTENSION: &str = "%Y%m%d%H%M";
pub const SECOND_EXTENSION: &str = "%Y%m%d%H%M%S";

/// Subdirectory layouts selectable with `-S 1..`; index 0 = flat.
const HIER_FORMATS: &[&str] = &[
    "%Y/%m/%d",
    "%Y/%m/%d/%H",
    "%Y/%W/%u",
    "%Y/%W/%u/%H",
    "%Y/%j",
    "%Y/%j/%H",
    "%F",
    "%F/%H",
];

/// Start of the window containing `t_clock`.
pub fn window_start(t_clock: i64, t_win: i64) -> i64 {
    t_clock - t_clock.rem_euclid(t_win)
}

/// Timestamp format for filenames: second precision below one-minute windows.
pub fn time_extension(t_win: i64) -> &'static str {
    if t_win < 60 {
        SECOND_EXTENSION
    } else {
        MINUTE_EXTENSION
    }
}

/// Validate a `-S` index at startup.
pub fn check_subdir_index(index: u32) -> bool {
    index as usize <= HIER_FORMATS.len()
}

fn format_local(t_start: i64, fmt: &str) -> Option<String> {
    Local
        .timestamp_opt(t_start, 0)
        .single()
        .map(|t| t.format(fmt).to_string())
}

/// Relative subdirectory for a window, `None` for index 0 or on failure.
pub fn subdir_for(index: u32, t_start: i64) -> Option<String> {
    if index == 0 {
        return None;
    }
    let fmt = HIER_FORMATS.get(index as usize - 1)?;
    format_local(t_start, fmt)
}

/// Final pathname `basedir/[subdir/]<prefix>.<TS>` for a closed window.
///
/// With a subdir index set, a failure to compute or create the hierarchy is
/// logged and the file falls back to the base directory, so the window is
/// published either way.
pub fn target_path(
    basedir: &Path,
    prefix: &str,
    subdir_index: u32,
    t_start: i64,
    extension: &str,
) -> PathBuf {
    let stamp = format_local(t_start, extension).unwrap_or_else(|| t_start.to_string());
    let fname = format!("{prefix}.{stamp}");

    if let Some(subdir) = subdir_for(subdir_index, t_start) {
        let dir = basedir.join(&subdir);
        match ensure_dir(&dir) {
            Ok(()) => return dir.join(fname),
            Err(e) => error!("failed to create sub hierarchy {}: {}", dir.display(), e),
        }
    }
    basedir.join(fname)
}

fn ensure_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        fs::create_dir_all(dir)
    }
}
