//! Tar+gzip entry walk for container image layers.

use std::path::Path;

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::debug;

use crate::error::ProvisionError;
use crate::vfs::Vfs;

use super::{
    classify_io, dir_mode, file_mode, place_hardlink, place_symlink, sanitize_entry_path,
    write_entry_file,
};

pub(super) fn unpack_tar_gz(
    vfs: &dyn Vfs,
    source: &Path,
    dest_root: &Path,
) -> Result<(), ProvisionError> {
    let reader = vfs.open(source)?;
    let mut archive = Archive::new(GzDecoder::new(reader));
    for entry in archive.entries().map_err(classify_io)? {
        let mut entry = entry.map_err(classify_io)?;
        let raw_path = entry.path().map_err(classify_io)?.into_owned();
        let Some(rel) = sanitize_entry_path(&raw_path)? else {
            continue;
        };
        let mode = entry.header().mode().ok();
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            vfs.mkdir_all(&dest_root.join(&rel), dir_mode(mode))?;
        } else if entry_type.is_file() {
            let mode = file_mode(&rel, mode);
            write_entry_file(vfs, dest_root, &rel, mode, &mut entry).map_err(classify_io)?;
        } else if entry_type.is_symlink() {
            let target = entry
                .link_name()
                .map_err(classify_io)?
                .ok_or_else(|| {
                    ProvisionError::InvalidArchive(format!(
                        "symlink {} has no target",
                        rel.display()
                    ))
                })?
                .into_owned();
            place_symlink(vfs, dest_root, &rel, &target)?;
        } else if entry_type.is_hard_link() {
            let target = entry
                .link_name()
                .map_err(classify_io)?
                .ok_or_else(|| {
                    ProvisionError::InvalidArchive(format!(
                        "hardlink {} has no target",
                        rel.display()
                    ))
                })?
                .into_owned();
            place_hardlink(vfs, dest_root, &rel, &target)?;
        } else {
            debug!(
                entry = %rel.display(),
                entry_type = ?entry_type,
                "skipping unsupported archive entry"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Extractor;
    use crate::vfs::MemFs;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use skald_paths::PathResolver;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tar::{Builder, EntryType, Header};

    fn build_layer(fill: impl FnOnce(&mut Builder<GzEncoder<Vec<u8>>>)) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = Builder::new(encoder);
        fill(&mut builder);
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn append_file(builder: &mut Builder<GzEncoder<Vec<u8>>>, path: &str, body: &[u8], mode: u32) {
        let mut header = Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(mode);
        header.set_cksum();
        builder.append_data(&mut header, path, body).unwrap();
    }

    fn write_blob(fs: &MemFs, path: &str, data: &[u8]) -> PathBuf {
        let path = PathBuf::from(path);
        fs.mkdir_all(path.parent().unwrap(), 0o755).unwrap();
        let mut writer = fs.create(&path, 0o644).unwrap();
        writer.write_all(data).unwrap();
        writer.flush().unwrap();
        path
    }

    #[test]
    fn test_unpack_files_dirs_and_hardlinks() {
        let fs = MemFs::new();
        fs.mkdir_all(Path::new("/out"), 0o755).unwrap();

        let layer = build_layer(|builder| {
            let mut dir = Header::new_gnu();
            dir.set_entry_type(EntryType::Directory);
            dir.set_size(0);
            dir.set_mode(0o750);
            dir.set_cksum();
            builder.append_data(&mut dir, "agent/bin/", std::io::empty()).unwrap();

            append_file(builder, "agent/bin/oneagent", b"elf", 0o755);
            append_file(builder, "agent/conf/ruxitagentproc.conf", b"[general]\n", 0o600);

            let mut link = Header::new_gnu();
            link.set_entry_type(EntryType::Link);
            link.set_size(0);
            link.set_cksum();
            builder
                .append_link(&mut link, "agent/bin/oneagent-copy", "agent/bin/oneagent")
                .unwrap();
        });
        let blob = write_blob(&fs, "/blobs/sha256/aa", &layer);

        unpack_tar_gz(&fs, &blob, Path::new("/out")).unwrap();

        assert_eq!(fs.stat(Path::new("/out/agent/bin")).unwrap().mode, 0o750);
        assert_eq!(fs.stat(Path::new("/out/agent/bin/oneagent")).unwrap().mode, 0o755);
        assert_eq!(
            fs.stat(Path::new("/out/agent/conf/ruxitagentproc.conf")).unwrap().mode,
            0o666
        );
        assert_eq!(fs.read_to_vec(Path::new("/out/agent/bin/oneagent-copy")).unwrap(), b"elf");
    }

    #[test]
    fn test_hardlink_to_missing_target_fails() {
        let fs = MemFs::new();
        fs.mkdir_all(Path::new("/out"), 0o755).unwrap();

        let layer = build_layer(|builder| {
            let mut link = Header::new_gnu();
            link.set_entry_type(EntryType::Link);
            link.set_size(0);
            link.set_cksum();
            builder
                .append_link(&mut link, "agent/copy", "agent/never-extracted")
                .unwrap();
        });
        let blob = write_blob(&fs, "/blobs/sha256/bb", &layer);

        let err = unpack_tar_gz(&fs, &blob, Path::new("/out")).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidArchive(_)));
    }

    #[test]
    fn test_unknown_entry_types_are_skipped() {
        let fs = MemFs::new();
        fs.mkdir_all(Path::new("/out"), 0o755).unwrap();

        let layer = build_layer(|builder| {
            let mut fifo = Header::new_gnu();
            fifo.set_entry_type(EntryType::Fifo);
            fifo.set_size(0);
            fifo.set_mode(0o644);
            fifo.set_cksum();
            builder.append_data(&mut fifo, "agent/pipe", std::io::empty()).unwrap();

            append_file(builder, "agent/real", b"x", 0o644);
        });
        let blob = write_blob(&fs, "/blobs/sha256/cc", &layer);

        unpack_tar_gz(&fs, &blob, Path::new("/out")).unwrap();
        assert!(!fs.exists(Path::new("/out/agent/pipe")));
        assert!(fs.exists(Path::new("/out/agent/real")));
    }

    #[test]
    fn test_traversal_path_fails_extraction() {
        let fs = MemFs::new();
        fs.mkdir_all(Path::new("/out"), 0o755).unwrap();

        let layer = build_layer(|builder| {
            append_file(builder, "ok", b"x", 0o644);
            // `append_data` refuses `..` paths, so write the raw header
            // name to smuggle the traversal entry into the fixture.
            let body = b"evil";
            let mut header = Header::new_gnu();
            let name = b"../escape";
            header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, &body[..]).unwrap();
        });
        let blob = write_blob(&fs, "/blobs/sha256/dd", &layer);

        let err = unpack_tar_gz(&fs, &blob, Path::new("/out")).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidArchive(_)));
    }

    #[test]
    fn test_corrupt_stream_is_invalid_archive() {
        let fs = MemFs::new();
        let blob = write_blob(&fs, "/blobs/sha256/ee", b"definitely not gzip");
        let err = unpack_tar_gz(&fs, &blob, Path::new("/out")).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidArchive(_)));
    }

    #[test]
    fn test_extract_layers_lands_all_layers_atomically() {
        let fs = Arc::new(MemFs::new());
        let resolver = PathResolver::new("/data");
        fs.mkdir_all(Path::new("/data/codemodules"), 0o755).unwrap();

        let first = build_layer(|builder| append_file(builder, "agent/bin/oneagent", b"elf", 0o755));
        let second = build_layer(|builder| {
            append_file(builder, "agent/lib/liboneagent.so", b"so", 0o644)
        });
        let blobs = vec![
            write_blob(&fs, "/cache/deadbeef/sha256:aa/blobs/sha256/01", &first),
            write_blob(&fs, "/cache/deadbeef/sha256:aa/blobs/sha256/02", &second),
        ];

        let extractor = Extractor::new(fs.clone(), resolver.clone());
        extractor
            .extract_layers(&blobs, Path::new("/data/codemodules/deadbeef"))
            .unwrap();

        assert!(fs.exists(Path::new("/data/codemodules/deadbeef/agent/bin/oneagent")));
        assert!(fs.exists(Path::new("/data/codemodules/deadbeef/agent/lib/liboneagent.so")));
        assert!(!fs.exists(&resolver.temp_unzip_target()));
    }

    #[test]
    fn test_failed_layer_removes_scratch_and_target_stays_absent() {
        let fs = Arc::new(MemFs::new());
        let resolver = PathResolver::new("/data");
        fs.mkdir_all(Path::new("/data/codemodules"), 0o755).unwrap();

        let good = build_layer(|builder| append_file(builder, "agent/bin/oneagent", b"elf", 0o755));
        let blobs = vec![
            write_blob(&fs, "/cache/feed/sha256:bb/blobs/sha256/01", &good),
            write_blob(&fs, "/cache/feed/sha256:bb/blobs/sha256/02", b"truncated junk"),
        ];

        let extractor = Extractor::new(fs.clone(), resolver.clone());
        let err = extractor
            .extract_layers(&blobs, Path::new("/data/codemodules/feed"))
            .unwrap_err();

        assert!(matches!(err, ProvisionError::InvalidArchive(_)));
        assert!(!fs.exists(Path::new("/data/codemodules/feed")));
        assert!(!fs.exists(&resolver.temp_unzip_target()));
    }
}
