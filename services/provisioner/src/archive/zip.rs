//! Zip entry walk for tenant-API agent packages.

use std::io::Read;
use std::path::{Path, PathBuf};

use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::ProvisionError;
use crate::vfs::{ReadSeek, Vfs};

use super::{
    classify_io, dir_mode, file_mode, place_symlink, sanitize_entry_path, write_entry_file,
};

pub(super) fn unpack_zip(
    vfs: &dyn Vfs,
    source: Box<dyn ReadSeek>,
    dest_root: &Path,
) -> Result<(), ProvisionError> {
    let mut archive = ZipArchive::new(source).map_err(zip_error)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(zip_error)?;
        let raw_name = entry.name().to_string();
        let Some(rel) = sanitize_entry_path(Path::new(&raw_name))? else {
            continue;
        };
        let unix_mode = entry.unix_mode();
        if entry.is_dir() {
            vfs.mkdir_all(&dest_root.join(&rel), dir_mode(unix_mode))?;
        } else if is_symlink_mode(unix_mode) {
            let mut target_bytes = Vec::new();
            entry.read_to_end(&mut target_bytes).map_err(classify_io)?;
            let target = PathBuf::from(String::from_utf8_lossy(&target_bytes).into_owned());
            place_symlink(vfs, dest_root, &rel, &target)?;
        } else {
            let mode = file_mode(&rel, unix_mode);
            write_entry_file(vfs, dest_root, &rel, mode, &mut entry).map_err(classify_io)?;
        }
    }
    Ok(())
}

/// The high bits of a zip external attribute carry the unix file type.
fn is_symlink_mode(mode: Option<u32>) -> bool {
    mode.is_some_and(|mode| mode & 0o170000 == 0o120000)
}

fn zip_error(err: ZipError) -> ProvisionError {
    match err {
        ZipError::Io(io_err) => ProvisionError::Io(io_err),
        other => ProvisionError::InvalidArchive(other.to_string()),
    }
}
