use std::path::{Path, PathBuf};

use nix::sys::resource::{getrlimit, Resource};
use tracing::{debug, warn};

/// Pin the calling thread to `core`. Returns false (and logs) when the core does not
/// exist or the OS refused.
pub fn pin_current_thread(core: usize) -> bool {
    let available = core_affinity::get_core_ids().unwrap_or_default();
    let Some(id) = available.into_iter().find(|id| id.id == core) else {
        warn!("CPU core {} not available, thread left unpinned", core);
        return false;
    };
    let pinned = core_affinity::set_for_current(id);
    if pinned {
        debug!("Pinned thread to core {}", core);
    } else {
        warn!("Could not pin thread to core {}", core);
    }
    pinned
}

/// Soft `RLIMIT_MEMLOCK` in bytes; `None` means unlimited.
pub fn memlock_limit() -> nix::Result<Option<u64>> {
    let (soft, _hard) = getrlimit(Resource::RLIMIT_MEMLOCK)?;
    Ok((soft != libc::RLIM_INFINITY).then_some(soft as u64))
}

/// Directory holding the frames of the `index`th session under `root`.
pub fn session_dir(root: &Path, index: u32) -> PathBuf {
    root.join(format!("session-{index:03}"))
}

/// First session index not yet used under `root`, so a restart never overwrites
/// frames from an earlier run.
pub fn next_session_index(root: &Path) -> u32 {
    let Ok(entries) = std::fs::read_dir(root) else {
        return 1;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()?
                .strip_prefix("session-")?
                .parse::<u32>()
                .ok()
        })
        .max()
        .map_or(1, |last| last.saturating_add(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_numbering_continues_after_earlier_runs() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(next_session_index(root.path()), 1);
        assert_eq!(next_session_index(&root.path().join("missing")), 1);

        std::fs::create_dir(session_dir(root.path(), 1)).unwrap();
        std::fs::create_dir(session_dir(root.path(), 7)).unwrap();
        std::fs::create_dir(root.path().join("session-notes")).unwrap();
        assert_eq!(next_session_index(root.path()), 8);
    }

    #[test]
    fn session_dirs_sort_by_index() {
        let root = Path::new("images");
        assert_eq!(session_dir(root, 1), PathBuf::from("images/session-001"));
        assert_eq!(session_dir(root, 42), PathBuf::from("images/session-042"));
        assert!(session_dir(root, 9) < session_dir(root, 10));
    }

    #[test]
    fn memlock_limit_is_readable() {
        assert!(memlock_limit().is_ok());
    }

    #[test]
    fn pinning_to_a_missing_core_fails_softly() {
        assert!(!pin_current_thread(usize::MAX));
    }
}
