//! `current` link maintenance for version-keyed installs.
//!
//! A URL-mode target directory carries exactly one versioned agent
//! directory after extraction. A relative symlink named `current` records
//! that version so mount consumers never have to know it. Image-mode
//! targets are addressed by digest and get no link.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::error::ProvisionError;
use crate::vfs::{FileKind, Vfs};

pub const CURRENT_LINK: &str = "current";

/// Versioned agent directories look like `1.273.142.20240205-123456`.
static VERSION_DIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.(\d+)\.(\d+)\.(\d+)-(\d+)$").expect("static version pattern"));

/// Create `<target_dir>/current` pointing at the versioned directory found
/// in the extracted tree. Existing links are left alone. Filesystems
/// without symlink support skip silently.
pub fn create_current_symlink(vfs: &dyn Vfs, target_dir: &Path) -> Result<(), ProvisionError> {
    if !vfs.symlinks_supported() {
        debug!(
            target = %target_dir.display(),
            "filesystem lacks symlinks, skipping current link"
        );
        return Ok(());
    }

    let version = find_version_dir(vfs, target_dir)?.ok_or_else(|| {
        ProvisionError::InvalidArchive(format!(
            "no versioned agent directory under {}",
            target_dir.display()
        ))
    })?;

    let link = target_dir.join(CURRENT_LINK);
    if vfs.lstat(&link).is_ok() {
        debug!(link = %link.display(), "current link already exists");
        return Ok(());
    }
    debug!(link = %link.display(), version = %version, "creating current link");
    vfs.symlink(Path::new(&version), &link)?;
    Ok(())
}

/// Breadth-first search for the first directory named like an agent
/// version.
fn find_version_dir(vfs: &dyn Vfs, root: &Path) -> Result<Option<String>, ProvisionError> {
    let mut queue = VecDeque::from([root.to_path_buf()]);
    while let Some(dir) = queue.pop_front() {
        for entry in vfs.read_dir(&dir)? {
            if entry.kind != FileKind::Dir {
                continue;
            }
            if VERSION_DIR.is_match(&entry.name) {
                return Ok(Some(entry.name));
            }
            queue.push_back(dir.join(&entry.name));
        }
    }
    Ok(None)
}
