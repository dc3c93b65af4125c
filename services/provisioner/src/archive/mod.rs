//! Safe archive extraction.
//!
//! Agent archives (zip from the tenant API, tar+gzip layers from a
//! registry) are unpacked through one shared policy: entry paths are
//! sanitised and traversal attempts fail the whole extraction, config files
//! under `agent/conf/` come out world-writable, unsafe symlinks and exotic
//! entry types are skipped, and the result reaches the target directory
//! only through an atomic rename of a scratch directory. A losing rename
//! race means another install finished first and counts as success.

use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use skald_paths::PathResolver;

use crate::error::ProvisionError;
use crate::vfs::Vfs;

mod tar;
mod zip;

/// Entries under this prefix are created mode `0666` so later config
/// merges can overwrite them regardless of the extracting uid.
const AGENT_CONF_PREFIX: &str = "agent/conf";

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

/// Archive extractor bound to a filesystem and path layout.
pub struct Extractor {
    vfs: Arc<dyn Vfs>,
    resolver: PathResolver,
}

impl Extractor {
    pub fn new(vfs: Arc<dyn Vfs>, resolver: PathResolver) -> Self {
        Extractor { vfs, resolver }
    }

    /// Unpack a zip stream into `target_dir`.
    pub fn extract_zip(
        &self,
        source: Box<dyn crate::vfs::ReadSeek>,
        target_dir: &Path,
    ) -> Result<(), ProvisionError> {
        self.with_staging(target_dir, |vfs, dest| zip::unpack_zip(vfs, source, dest))
    }

    /// Unpack a gzip-compressed tarball at `source` into `target_dir`.
    pub fn extract_tar_gz(
        &self,
        source: &Path,
        target_dir: &Path,
    ) -> Result<(), ProvisionError> {
        self.with_staging(target_dir, |vfs, dest| tar::unpack_tar_gz(vfs, source, dest))
    }

    /// Unpack a sequence of gzip-compressed tarballs, in order, into
    /// `target_dir`. All layers land in one scratch directory so the target
    /// appears either complete or not at all.
    pub fn extract_layers(
        &self,
        sources: &[PathBuf],
        target_dir: &Path,
    ) -> Result<(), ProvisionError> {
        self.with_staging(target_dir, |vfs, dest| {
            for source in sources {
                tar::unpack_tar_gz(vfs, source, dest)?;
            }
            Ok(())
        })
    }

    /// Run `fill` against a scratch directory, then atomically rename the
    /// scratch onto `target_dir`. In init-container mode the scratch step
    /// is skipped and `fill` writes straight into the target.
    fn with_staging<F>(&self, target_dir: &Path, fill: F) -> Result<(), ProvisionError>
    where
        F: FnOnce(&dyn Vfs, &Path) -> Result<(), ProvisionError>,
    {
        let vfs = self.vfs.as_ref();
        if self.resolver.is_init_mount() {
            vfs.mkdir_all(target_dir, DEFAULT_DIR_MODE)?;
            return fill(vfs, target_dir);
        }

        let scratch = self.resolver.temp_unzip_target();
        vfs.remove_all(&scratch)?;
        vfs.mkdir_all(&scratch, DEFAULT_DIR_MODE)?;

        if let Err(err) = fill(vfs, &scratch) {
            let _ = vfs.remove_all(&scratch);
            return Err(err);
        }

        match vfs.rename(&scratch, target_dir) {
            Ok(()) => Ok(()),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::AlreadyExists | io::ErrorKind::DirectoryNotEmpty
                ) =>
            {
                debug!(
                    target = %target_dir.display(),
                    "target already populated, discarding scratch"
                );
                vfs.remove_all(&scratch)?;
                Ok(())
            }
            Err(err) => {
                let _ = vfs.remove_all(&scratch);
                Err(err.into())
            }
        }
    }
}

/// Normalise an archive entry path to a safe relative path.
///
/// `Ok(None)` means the entry names the root itself and there is nothing
/// to create. Any attempt to step outside the extraction root fails the
/// extraction.
fn sanitize_entry_path(raw: &Path) -> Result<Option<PathBuf>, ProvisionError> {
    let mut out = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return Err(ProvisionError::InvalidArchive(format!(
                        "entry {} escapes the extraction root",
                        raw.display()
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ProvisionError::InvalidArchive(format!(
                    "entry {} is absolute",
                    raw.display()
                )));
            }
        }
    }
    if out.as_os_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(out))
    }
}

fn file_mode(rel: &Path, archive_mode: Option<u32>) -> u32 {
    if rel.starts_with(AGENT_CONF_PREFIX) {
        return 0o666;
    }
    archive_mode
        .map(|mode| mode & 0o7777)
        .filter(|mode| *mode != 0)
        .unwrap_or(DEFAULT_FILE_MODE)
}

fn dir_mode(archive_mode: Option<u32>) -> u32 {
    archive_mode
        .map(|mode| mode & 0o7777)
        .filter(|mode| *mode != 0)
        .unwrap_or(DEFAULT_DIR_MODE)
}

/// Whether a symlink at `rel_link` pointing to `target` resolves inside
/// the extraction root.
fn symlink_stays_inside(rel_link: &Path, target: &Path) -> bool {
    if target.is_absolute() {
        return false;
    }
    let mut resolved = rel_link.parent().map(Path::to_path_buf).unwrap_or_default();
    for component in target.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => resolved.push(part),
            Component::ParentDir => {
                if !resolved.pop() {
                    return false;
                }
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

fn write_entry_file(
    vfs: &dyn Vfs,
    dest_root: &Path,
    rel: &Path,
    mode: u32,
    reader: &mut dyn Read,
) -> io::Result<()> {
    let dest = dest_root.join(rel);
    if let Some(parent) = dest.parent() {
        vfs.mkdir_all(parent, DEFAULT_DIR_MODE)?;
    }
    let mut writer = vfs.create(&dest, mode)?;
    io::copy(reader, &mut writer)?;
    writer.flush()
}

fn place_symlink(
    vfs: &dyn Vfs,
    dest_root: &Path,
    rel: &Path,
    target: &Path,
) -> Result<(), ProvisionError> {
    if !vfs.symlinks_supported() {
        debug!(link = %rel.display(), "filesystem lacks symlinks, skipping entry");
        return Ok(());
    }
    if !symlink_stays_inside(rel, target) {
        warn!(
            link = %rel.display(),
            target = %target.display(),
            "skipping symlink resolving outside the extraction root"
        );
        return Ok(());
    }
    let dest = dest_root.join(rel);
    if let Some(parent) = dest.parent() {
        vfs.mkdir_all(parent, DEFAULT_DIR_MODE)?;
    }
    vfs.symlink(target, &dest)?;
    Ok(())
}

fn place_hardlink(
    vfs: &dyn Vfs,
    dest_root: &Path,
    rel: &Path,
    raw_target: &Path,
) -> Result<(), ProvisionError> {
    let target_rel = sanitize_entry_path(raw_target)?.ok_or_else(|| {
        ProvisionError::InvalidArchive(format!("hardlink {} has an empty target", rel.display()))
    })?;
    let original = dest_root.join(&target_rel);
    if !vfs.exists(&original) {
        return Err(ProvisionError::InvalidArchive(format!(
            "hardlink target {} was not extracted",
            target_rel.display()
        )));
    }
    let dest = dest_root.join(rel);
    if let Some(parent) = dest.parent() {
        vfs.mkdir_all(parent, DEFAULT_DIR_MODE)?;
    }
    vfs.hard_link(&original, &dest)?;
    Ok(())
}

/// Stream corruption reads as archive damage; anything else stays an
/// ordinary filesystem failure.
fn classify_io(err: io::Error) -> ProvisionError {
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            ProvisionError::InvalidArchive(err.to_string())
        }
        _ => ProvisionError::Io(err),
    }
}
