//! Workspace retrieval
//!
//! Re-materializes the post-build workspace from the runner's gzip tar
//! stream: directories, regular files, symlinks, hard links, and
//! `SCHILY.xattr.*` PAX records. Entries are rooted at `./melange-out`.

use crate::error::{ForgeError, ForgeResult};
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Unpack a gzip tar stream into the workspace directory.
pub fn retrieve_workspace<R: Read>(reader: R, workspace_dir: &Path) -> ForgeResult<()> {
    let gz = GzDecoder::new(reader);
    let mut archive = tar::Archive::new(gz);

    for entry in archive
        .entries()
        .map_err(|e| ForgeError::WorkspaceTar(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| ForgeError::WorkspaceTar(e.to_string()))?;

        let rel: PathBuf = entry
            .path()
            .map_err(|e| ForgeError::WorkspaceTar(e.to_string()))?
            .into_owned();
        let target = workspace_dir.join(&rel);
        let mode = entry
            .header()
            .mode()
            .map_err(|e| ForgeError::WorkspaceTar(e.to_string()))?;

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                if !symlink_to_dir(&target) {
                    make_dir_all(&target, mode)?;
                }
            }

            tar::EntryType::Regular => {
                let size = entry
                    .header()
                    .size()
                    .map_err(|e| ForgeError::WorkspaceTar(e.to_string()))?;
                let mut options = std::fs::OpenOptions::new();
                options.write(true).create_new(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    options.mode(mode);
                }
                let mut file = options
                    .open(&target)
                    .map_err(|e| ForgeError::io(format!("unable to open file {}", rel.display()), e))?;
                std::io::copy(&mut entry.by_ref().take(size), &mut file)
                    .map_err(|e| ForgeError::io(format!("unable to copy file {}", rel.display()), e))?;
            }

            tar::EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(|e| ForgeError::WorkspaceTar(e.to_string()))?
                    .ok_or_else(|| ForgeError::WorkspaceTar("symlink without target".into()))?
                    .into_owned();

                // A matching symlink from a prior retrieval is fine.
                if let Ok(existing) = std::fs::read_link(&target) {
                    if existing == link {
                        continue;
                    }
                }

                #[cfg(unix)]
                std::os::unix::fs::symlink(&link, &target).map_err(|e| {
                    ForgeError::io(
                        format!(
                            "unable to create symlink {} -> {}",
                            rel.display(),
                            link.display()
                        ),
                        e,
                    )
                })?;
            }

            tar::EntryType::Link => {
                let link = entry
                    .link_name()
                    .map_err(|e| ForgeError::WorkspaceTar(e.to_string()))?
                    .ok_or_else(|| ForgeError::WorkspaceTar("hard link without target".into()))?;
                std::fs::hard_link(workspace_dir.join(link.as_ref()), &target)
                    .map_err(|e| ForgeError::io(format!("unable to link {}", rel.display()), e))?;
            }

            other => {
                return Err(ForgeError::UnexpectedTarEntry {
                    typeflag: other.as_byte(),
                    path: rel.display().to_string(),
                });
            }
        }

        apply_xattrs(&mut entry, &target, &rel)?;
    }

    Ok(())
}

/// Whether `path` is a symlink resolving to a directory
fn symlink_to_dir(path: &Path) -> bool {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
        }
        _ => false,
    }
}

fn make_dir_all(path: &Path, mode: u32) -> ForgeResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true).mode(mode);
        builder
            .create(path)
            .map_err(|e| ForgeError::io(format!("unable to create directory {}", path.display()), e))
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
        std::fs::create_dir_all(path)
            .map_err(|e| ForgeError::io(format!("unable to create directory {}", path.display()), e))
    }
}

/// Apply `SCHILY.xattr.*` PAX records as extended attributes
fn apply_xattrs<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    target: &Path,
    rel: &Path,
) -> ForgeResult<()> {
    let Some(extensions) = entry
        .pax_extensions()
        .map_err(|e| ForgeError::WorkspaceTar(e.to_string()))?
    else {
        return Ok(());
    };

    for ext in extensions {
        let ext = ext.map_err(|e| ForgeError::WorkspaceTar(e.to_string()))?;
        let Ok(key) = ext.key() else { continue };
        let Some(attr) = key.strip_prefix("SCHILY.xattr.") else {
            continue;
        };

        debug!("setting xattr {attr} on {}", rel.display());
        xattr::set(target, attr, ext.value_bytes()).map_err(|e| {
            ForgeError::io(
                format!("unable to set xattr {attr} on {}", rel.display()),
                e,
            )
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    struct StreamBuilder {
        builder: tar::Builder<GzEncoder<Vec<u8>>>,
    }

    impl StreamBuilder {
        fn new() -> Self {
            let gz = GzEncoder::new(Vec::new(), Compression::default());
            Self {
                builder: tar::Builder::new(gz),
            }
        }

        fn dir(mut self, path: &str, mode: u32) -> Self {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(mode);
            header.set_size(0);
            self.builder
                .append_data(&mut header, path, std::io::empty())
                .unwrap();
            self
        }

        fn file(mut self, path: &str, mode: u32, data: &[u8]) -> Self {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(mode);
            header.set_size(data.len() as u64);
            self.builder.append_data(&mut header, path, data).unwrap();
            self
        }

        fn file_with_xattr(mut self, path: &str, data: &[u8], attr: &str, value: &[u8]) -> Self {
            // PAX extended header entry precedes the file entry
            let record_body = {
                // PAX record: "<len> <key>=<value>\n" where len counts
                // the whole record, its own digits included.
                let content_len = format!("SCHILY.xattr.{attr}=").len() + value.len() + 1;
                let mut len = content_len;
                loop {
                    let total = len.to_string().len() + 1 + content_len;
                    if total == len {
                        break;
                    }
                    len = total;
                }

                let mut record = Vec::new();
                record.extend_from_slice(len.to_string().as_bytes());
                record.push(b' ');
                record.extend_from_slice(format!("SCHILY.xattr.{attr}=").as_bytes());
                record.extend_from_slice(value);
                record.push(b'\n');
                record
            };

            let mut pax_header = tar::Header::new_ustar();
            pax_header.set_entry_type(tar::EntryType::XHeader);
            pax_header.set_size(record_body.len() as u64);
            self.builder
                .append_data(&mut pax_header, "pax_ext", record_body.as_slice())
                .unwrap();

            self.file(path, 0o644, data)
        }

        fn symlink(mut self, path: &str, target: &str) -> Self {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            self.builder
                .append_link(&mut header, path, target)
                .unwrap();
            self
        }

        fn hardlink(mut self, path: &str, target: &str) -> Self {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Link);
            header.set_size(0);
            self.builder
                .append_link(&mut header, path, target)
                .unwrap();
            self
        }

        fn finish(self) -> Vec<u8> {
            self.builder.into_inner().unwrap().finish().unwrap()
        }
    }

    #[test]
    fn files_and_dirs_roundtrip() {
        let workspace = TempDir::new().unwrap();
        let stream = StreamBuilder::new()
            .dir("./melange-out", 0o755)
            .dir("./melange-out/lib", 0o755)
            .file("./melange-out/lib/data.txt", 0o640, b"hello")
            .finish();

        retrieve_workspace(stream.as_slice(), workspace.path()).unwrap();

        let file = workspace.path().join("melange-out/lib/data.txt");
        assert_eq!(fs::read(&file).unwrap(), b"hello");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(file.metadata().unwrap().permissions().mode() & 0o777, 0o640);
        }
    }

    #[cfg(unix)]
    #[test]
    fn matching_symlink_is_idempotent() {
        let workspace = TempDir::new().unwrap();
        fs::create_dir_all(workspace.path().join("melange-out/lib")).unwrap();
        std::os::unix::fs::symlink(
            "libfoo.so.1",
            workspace.path().join("melange-out/lib/libfoo.so"),
        )
        .unwrap();

        let stream = StreamBuilder::new()
            .dir("./melange-out", 0o755)
            .dir("./melange-out/lib", 0o755)
            .symlink("./melange-out/lib/libfoo.so", "libfoo.so.1")
            .finish();

        retrieve_workspace(stream.as_slice(), workspace.path()).unwrap();

        let link = fs::read_link(workspace.path().join("melange-out/lib/libfoo.so")).unwrap();
        assert_eq!(link, PathBuf::from("libfoo.so.1"));
    }

    #[cfg(unix)]
    #[test]
    fn dir_entry_accepts_symlink_to_dir() {
        let workspace = TempDir::new().unwrap();
        fs::create_dir_all(workspace.path().join("real-out")).unwrap();
        std::os::unix::fs::symlink("real-out", workspace.path().join("melange-out")).unwrap();

        let stream = StreamBuilder::new().dir("melange-out", 0o755).finish();
        retrieve_workspace(stream.as_slice(), workspace.path()).unwrap();

        // Still a symlink, not replaced by a directory
        assert!(workspace
            .path()
            .join("melange-out")
            .symlink_metadata()
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[test]
    fn hard_links_materialize() {
        let workspace = TempDir::new().unwrap();
        let stream = StreamBuilder::new()
            .dir("./melange-out", 0o755)
            .file("./melange-out/a", 0o644, b"shared")
            .hardlink("./melange-out/b", "./melange-out/a")
            .finish();

        retrieve_workspace(stream.as_slice(), workspace.path()).unwrap();
        assert_eq!(
            fs::read(workspace.path().join("melange-out/b")).unwrap(),
            b"shared"
        );
    }

    #[test]
    fn unexpected_type_fails() {
        let workspace = TempDir::new().unwrap();

        let gz = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(gz);
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Fifo);
        header.set_size(0);
        builder
            .append_data(&mut header, "./melange-out/pipe", std::io::empty())
            .unwrap();
        let stream = builder.into_inner().unwrap().finish().unwrap();

        let err = retrieve_workspace(stream.as_slice(), workspace.path()).unwrap_err();
        assert!(matches!(err, ForgeError::UnexpectedTarEntry { .. }));
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    #[test]
    fn xattrs_apply_from_pax_records() {
        let workspace = TempDir::new().unwrap();
        let stream = StreamBuilder::new()
            .dir("./melange-out", 0o755)
            .file_with_xattr("./melange-out/tagged", b"data", "user.test", b"hello")
            .finish();

        retrieve_workspace(stream.as_slice(), workspace.path()).unwrap();

        let target = workspace.path().join("melange-out/tagged");
        // tmpfs on some CI hosts rejects user xattrs; only assert when set succeeded
        if let Ok(Some(value)) = xattr::get(&target, "user.test") {
            assert_eq!(value, b"hello");
        }
    }

    #[test]
    fn truncated_stream_fails() {
        let workspace = TempDir::new().unwrap();
        let mut stream = StreamBuilder::new()
            .dir("./melange-out", 0o755)
            .file("./melange-out/a", 0o644, b"data")
            .finish();
        stream.truncate(stream.len() / 2);

        assert!(retrieve_workspace(stream.as_slice(), workspace.path()).is_err());
    }

    #[test]
    fn gzip_garbage_fails() {
        let workspace = TempDir::new().unwrap();
        let mut garbage = Vec::new();
        garbage.write_all(b"not a gzip stream").unwrap();
        assert!(retrieve_workspace(garbage.as_slice(), workspace.path()).is_err());
    }
}
