//! Workspace directories: the authoritative run workspace, per-candidate
//! copies, and the winner-only merge.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};

/// Recursively copy `src` into `dst`, creating `dst`. Returns bytes copied.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<u64> {
    if !src.is_dir() {
        bail!("copy source {} is not a directory", src.display());
    }
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    let mut copied = 0u64;
    for entry in fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
        let entry = entry.context("read dir entry")?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type().context("entry file type")?;
        if file_type.is_dir() {
            copied += copy_dir(&entry.path(), &target)?;
        } else if file_type.is_file() {
            copied += fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", entry.path().display()))?;
        }
        // Symlinks are skipped: workspaces are plain file trees and a link
        // pointing outside the workspace must not leak into a sandbox mount.
    }
    Ok(copied)
}

/// Create an isolated copy of the authoritative workspace for candidate
/// `index`, as a sibling directory.
pub fn candidate_copy(authoritative: &Path, index: usize) -> Result<PathBuf> {
    let name = authoritative
        .file_name()
        .ok_or_else(|| anyhow!("workspace {} has no name", authoritative.display()))?
        .to_string_lossy()
        .to_string();
    let parent = authoritative
        .parent()
        .ok_or_else(|| anyhow!("workspace {} has no parent", authoritative.display()))?;
    let copy = parent.join(format!("{name}.cand{index}"));
    if copy.exists() {
        fs::remove_dir_all(&copy).with_context(|| format!("clear stale {}", copy.display()))?;
    }
    copy_dir(authoritative, &copy)?;
    Ok(copy)
}

/// Replace the contents of `dst` with the contents of `src`.
///
/// Used to merge the winning candidate: everything else about the round is
/// discarded, so the authoritative workspace only ever contains a fully
/// verified candidate's artifacts.
pub fn replace_dir(dst: &Path, src: &Path) -> Result<()> {
    if !src.is_dir() {
        bail!("merge source {} is not a directory", src.display());
    }
    if dst.exists() {
        fs::remove_dir_all(dst).with_context(|| format!("remove {}", dst.display()))?;
    }
    copy_dir(src, dst)?;
    Ok(())
}

/// Remove a directory, ignoring failures. Used for candidate cleanup where
/// a leaked directory is preferable to failing the round.
pub fn remove_dir_best_effort(path: &Path) {
    if path.exists() {
        let _ = fs::remove_dir_all(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, contents).expect("write");
    }

    #[test]
    fn copy_dir_copies_nested_trees() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("src");
        write(&src.join("a.txt"), "one");
        write(&src.join("sub/b.txt"), "two");

        let dst = temp.path().join("dst");
        let copied = copy_dir(&src, &dst).expect("copy");
        assert_eq!(copied, 6);
        assert_eq!(fs::read_to_string(dst.join("a.txt")).expect("read"), "one");
        assert_eq!(
            fs::read_to_string(dst.join("sub/b.txt")).expect("read"),
            "two"
        );
    }

    #[test]
    fn candidate_copy_is_a_sibling_and_isolated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let auth = temp.path().join("ws");
        write(&auth.join("solution.txt"), "v1");

        let copy = candidate_copy(&auth, 2).expect("copy");
        assert_eq!(copy, temp.path().join("ws.cand2"));

        write(&copy.join("solution.txt"), "v2");
        assert_eq!(
            fs::read_to_string(auth.join("solution.txt")).expect("read"),
            "v1"
        );
    }

    #[test]
    fn replace_dir_swaps_contents_exactly() {
        let temp = tempfile::tempdir().expect("tempdir");
        let auth = temp.path().join("ws");
        write(&auth.join("stale.txt"), "old");
        let winner = temp.path().join("winner");
        write(&winner.join("solution.txt"), "best");

        replace_dir(&auth, &winner).expect("replace");
        assert!(!auth.join("stale.txt").exists());
        assert_eq!(
            fs::read_to_string(auth.join("solution.txt")).expect("read"),
            "best"
        );
    }
}
