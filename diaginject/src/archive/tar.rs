//! Streaming tar writer for the helper payload.

use diaginject_shared::errors::{InjectorError, InjectorResult};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tar::Builder;
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::pipe::PipeWriter;

/// Name every entry is rooted under: the last component of `dest`.
fn archive_root(dest: &Path) -> InjectorResult<PathBuf> {
    dest.file_name().map(PathBuf::from).ok_or_else(|| {
        InjectorError::Archive(format!(
            "destination {} has no final component",
            dest.display()
        ))
    })
}

/// Directory the remote `tar -C` must run in so entries land under `dest`.
pub fn extraction_parent(dest: &Path) -> InjectorResult<&Path> {
    archive_root(dest)?;
    match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent),
        _ => Err(InjectorError::Archive(format!(
            "destination {} has no parent directory",
            dest.display()
        ))),
    }
}

/// Write `src` as a tar stream into `sink`, rooted at the leaf of `dest`.
///
/// Extracting the result with `tar -xf - -C <parent of dest>` recreates the
/// contents of `src` at `dest`. Regular files, directories and symlinks are
/// archived with their modes; devices, FIFOs and sockets are skipped.
///
/// Returns the number of entries written.
pub fn write_tar<W: Write>(src: &Path, dest: &Path, sink: W) -> InjectorResult<u64> {
    let root = archive_root(dest)?;

    let meta = fs::metadata(src).map_err(|e| {
        InjectorError::Archive(format!("failed to stat helper dir {}: {}", src.display(), e))
    })?;
    if !meta.is_dir() {
        return Err(InjectorError::Archive(format!(
            "helper source {} is not a directory",
            src.display()
        )));
    }

    let mut builder = Builder::new(sink);
    builder.follow_symlinks(false);

    let mut entries = 0u64;
    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            InjectorError::Archive(format!("failed to walk {}: {}", src.display(), e))
        })?;

        let rel = entry.path().strip_prefix(src).map_err(|e| {
            InjectorError::Archive(format!(
                "{} escaped {}: {}",
                entry.path().display(),
                src.display(),
                e
            ))
        })?;
        let name = if rel.as_os_str().is_empty() {
            root.clone()
        } else {
            root.join(rel)
        };

        let file_type = entry.file_type();
        if !(file_type.is_dir() || file_type.is_file() || file_type.is_symlink()) {
            debug!(path = %entry.path().display(), "skipping special file");
            continue;
        }

        trace!(path = %name.display(), "archiving");
        builder
            .append_path_with_name(entry.path(), &name)
            .map_err(|e| {
                InjectorError::Archive(format!(
                    "failed to archive {}: {}",
                    entry.path().display(),
                    e
                ))
            })?;
        entries += 1;
    }

    let mut sink = builder
        .into_inner()
        .map_err(|e| InjectorError::Archive(format!("failed to finish archive: {}", e)))?;
    sink.flush()?;

    Ok(entries)
}

/// Run [`write_tar`] on the blocking pool, feeding `writer`.
///
/// The writer is shut down when the archive is complete or has failed, so
/// the consuming side always sees end of stream.
pub fn spawn_producer(
    src: PathBuf,
    dest: PathBuf,
    writer: PipeWriter,
) -> JoinHandle<InjectorResult<u64>> {
    let mut bridge = SyncIoBridge::new(writer);
    tokio::task::spawn_blocking(move || {
        let result = write_tar(&src, &dest, &mut bridge);
        if let Err(e) = bridge.shutdown() {
            debug!(error = %e, "tar pipe already closed");
        }
        match &result {
            Ok(entries) => debug!(src = %src.display(), entries, "helper archive written"),
            Err(e) => warn!(src = %src.display(), error = %e, "helper archive failed"),
        }
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{PermissionsExt, symlink};
    use tar::Archive;

    /// Helper tree: a script, a nested data file and a relative symlink.
    fn create_helper_tree(dir: &Path) {
        fs::create_dir_all(dir.join("lib")).unwrap();
        fs::write(dir.join("linperf.sh"), b"#!/bin/sh\necho run\n").unwrap();
        fs::set_permissions(dir.join("linperf.sh"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(dir.join("lib/common.sh"), b"helper() { :; }\n").unwrap();
        symlink("lib/common.sh", dir.join("common.sh")).unwrap();
    }

    fn entry_names(data: &[u8]) -> Vec<String> {
        let mut archive = Archive::new(data);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn test_entries_are_rooted_at_destination_leaf() {
        let temp_dir = tempfile::tempdir().unwrap();
        let src = temp_dir.path().join("payload");
        create_helper_tree(&src);

        let mut data = Vec::new();
        let count = write_tar(&src, Path::new("/opt/diag/helpers"), &mut data).unwrap();

        let names: Vec<String> = entry_names(&data)
            .iter()
            .map(|n| n.trim_end_matches('/').to_string())
            .collect();
        assert_eq!(count, names.len() as u64);
        assert_eq!(
            names,
            vec![
                "helpers",
                "helpers/common.sh",
                "helpers/lib",
                "helpers/lib/common.sh",
                "helpers/linperf.sh",
            ]
        );
    }

    #[test]
    fn test_round_trip_preserves_files_modes_and_symlinks() {
        let temp_dir = tempfile::tempdir().unwrap();
        let src = temp_dir.path().join("payload");
        create_helper_tree(&src);

        let mut data = Vec::new();
        write_tar(&src, Path::new("/tmp/x/helpers"), &mut data).unwrap();

        let out = temp_dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        let mut archive = Archive::new(&data[..]);
        archive.set_preserve_permissions(true);
        archive.unpack(&out).unwrap();

        let root = out.join("helpers");
        assert_eq!(
            fs::read(root.join("linperf.sh")).unwrap(),
            fs::read(src.join("linperf.sh")).unwrap()
        );
        assert_eq!(
            fs::read(root.join("lib/common.sh")).unwrap(),
            b"helper() { :; }\n"
        );
        let mode = fs::metadata(root.join("linperf.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        let link = root.join("common.sh");
        assert!(link.is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("lib/common.sh"));
    }

    #[test]
    fn test_special_files_are_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let src = temp_dir.path().join("payload");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("run.sh"), b"true\n").unwrap();
        let _listener = std::os::unix::net::UnixListener::bind(src.join("agent.sock")).unwrap();

        let mut data = Vec::new();
        let count = write_tar(&src, Path::new("/tmp/helpers"), &mut data).unwrap();

        assert_eq!(count, 2);
        let names = entry_names(&data);
        assert!(names.iter().all(|n| !n.contains("agent.sock")));
    }

    #[test]
    fn test_missing_source_is_archive_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let err = write_tar(
            &temp_dir.path().join("nope"),
            Path::new("/tmp/helpers"),
            Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, InjectorError::Archive(_)));
    }

    #[test]
    fn test_extraction_parent() {
        assert_eq!(
            extraction_parent(Path::new("/opt/diag/helpers")).unwrap(),
            Path::new("/opt/diag")
        );
        assert_eq!(extraction_parent(Path::new("/helpers")).unwrap(), Path::new("/"));
        assert!(extraction_parent(Path::new("/")).is_err());
        assert!(extraction_parent(Path::new("helpers")).is_err());
    }

    #[tokio::test]
    async fn test_producer_streams_through_pipe() {
        use tokio::io::AsyncReadExt;

        let temp_dir = tempfile::tempdir().unwrap();
        let src = temp_dir.path().join("payload");
        create_helper_tree(&src);

        let (mut reader, writer, _handle) = crate::pipe::byte_pipe(512);
        let producer = spawn_producer(src.clone(), PathBuf::from("/tmp/helpers"), writer);

        let mut streamed = Vec::new();
        reader.read_to_end(&mut streamed).await.unwrap();
        let count = producer.await.unwrap().unwrap();

        let mut direct = Vec::new();
        write_tar(&src, Path::new("/tmp/helpers"), &mut direct).unwrap();
        assert_eq!(count, 5);
        assert_eq!(entry_names(&streamed), entry_names(&direct));
    }
}
