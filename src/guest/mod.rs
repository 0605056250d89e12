//! Guest environment construction
//!
//! The guest is the root filesystem the build pipeline runs inside. An
//! external builder lays out the image tree from the recipe's
//! environment spec; the tree is then converted to a single-layer
//! tar.gz and handed to the runner's OCI loader.

use crate::arch::Arch;
use crate::error::{ForgeError, ForgeResult};
use crate::recipe::schema::ImageConfiguration;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// What the guest builder is invoked with
#[derive(Debug, Clone)]
pub struct GuestSpec {
    pub environment: ImageConfiguration,
    pub arch: Arch,
    pub extra_keys: Vec<String>,
    pub extra_repos: Vec<String>,
    /// Read-only hint: APK package cache to draw from
    pub apk_cache_dir: Option<PathBuf>,
}

/// A single-layer image produced from a guest tree
#[derive(Debug, Clone)]
pub struct Layer {
    /// Path to the layer tar.gz (deleted by the caller after load)
    pub path: PathBuf,

    /// sha256 digest of the compressed layer
    pub digest: String,

    /// Compressed size in bytes
    pub size: u64,
}

/// External guest builder interface
#[async_trait]
pub trait GuestBuilder: Send + Sync + std::fmt::Debug {
    /// Lay the guest image tree out into `guest_dir`
    async fn build_layout(&self, spec: &GuestSpec, guest_dir: &Path) -> ForgeResult<()>;
}

/// Guest builder driving the `apko` CLI
#[derive(Debug)]
pub struct ApkoCli;

#[async_trait]
impl GuestBuilder for ApkoCli {
    async fn build_layout(&self, spec: &GuestSpec, guest_dir: &Path) -> ForgeResult<()> {
        let config = serde_yaml::to_string(&ApkoConfig {
            contents: spec.environment.contents.clone(),
            environment: spec.environment.environment.clone(),
        })?;

        let config_file = tempfile::Builder::new()
            .prefix("apkforge-apko-")
            .suffix(".yaml")
            .tempfile()
            .map_err(|e| ForgeError::io("creating apko config", e))?;
        std::fs::write(config_file.path(), config)
            .map_err(|e| ForgeError::io("writing apko config", e))?;

        let mut cmd = Command::new("apko");
        cmd.arg("build-minirootfs")
            .arg("--arch")
            .arg(spec.arch.to_apk());

        for key in &spec.extra_keys {
            cmd.arg("--keyring-append").arg(key);
        }
        for repo in &spec.extra_repos {
            cmd.arg("--repository-append").arg(repo);
        }
        if let Some(cache) = &spec.apk_cache_dir {
            cmd.arg("--cache-dir").arg(cache);
        }

        cmd.arg(config_file.path()).arg(guest_dir);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!("building guest layout with apko into {}", guest_dir.display());

        let output = cmd
            .output()
            .await
            .map_err(|e| ForgeError::command_failed("apko build-minirootfs", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ForgeError::GuestBuild(stderr.trim().to_string()));
        }

        Ok(())
    }
}

/// The subset of apko configuration the driver forwards
#[derive(serde::Serialize)]
struct ApkoConfig {
    contents: crate::recipe::schema::ImageContents,
    environment: std::collections::HashMap<String, String>,
}

/// Convert a laid-out guest tree into a single-layer tar.gz.
///
/// Entries are emitted in sorted path order with mtimes pinned to the
/// source date epoch so the layer digest is reproducible.
pub fn layout_to_layer(guest_dir: &Path, epoch: i64) -> ForgeResult<Layer> {
    let tmp = tempfile::Builder::new()
        .prefix("apkforge-layer-")
        .suffix(".tar.gz")
        .tempfile()
        .map_err(|e| ForgeError::io("creating layer tempfile", e))?;
    let (_, path) = tmp
        .keep()
        .map_err(|e| ForgeError::io("persisting layer tempfile", e.error))?;

    {
        let file = File::create(&path).map_err(|e| ForgeError::io("opening layer", e))?;
        let gz = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(gz);
        builder.follow_symlinks(false);

        let mut entries: Vec<PathBuf> = walkdir::WalkDir::new(guest_dir)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .collect();
        entries.sort();

        for entry in entries {
            let rel = entry
                .strip_prefix(guest_dir)
                .expect("walkdir yields children of guest_dir");
            let meta = std::fs::symlink_metadata(&entry)
                .map_err(|e| ForgeError::io(format!("stat {}", entry.display()), e))?;

            let mut header = tar::Header::new_ustar();
            header.set_mtime(epoch as u64);
            #[cfg(unix)]
            {
                use std::os::unix::fs::MetadataExt;
                header.set_mode(meta.mode() & 0o7777);
            }

            if meta.file_type().is_symlink() {
                let target = std::fs::read_link(&entry)
                    .map_err(|e| ForgeError::io(format!("readlink {}", entry.display()), e))?;
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                builder
                    .append_link(&mut header, rel, &target)
                    .map_err(|e| ForgeError::io("appending symlink to layer", e))?;
            } else if meta.is_dir() {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                builder
                    .append_data(&mut header, rel, std::io::empty())
                    .map_err(|e| ForgeError::io("appending directory to layer", e))?;
            } else {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(meta.len());
                let f = File::open(&entry)
                    .map_err(|e| ForgeError::io(format!("open {}", entry.display()), e))?;
                builder
                    .append_data(&mut header, rel, f)
                    .map_err(|e| ForgeError::io("appending file to layer", e))?;
            }
        }

        let gz = builder
            .into_inner()
            .map_err(|e| ForgeError::io("finishing layer tar", e))?;
        gz.finish()
            .map_err(|e| ForgeError::io("finishing layer gzip", e))?
            .flush()
            .map_err(|e| ForgeError::io("flushing layer", e))?;
    }

    let mut hasher = Sha256::new();
    let mut reader =
        File::open(&path).map_err(|e| ForgeError::io("reopening layer for digest", e))?;
    let size = std::io::copy(&mut reader, &mut hasher)
        .map_err(|e| ForgeError::io("hashing layer", e))?;
    let digest = format!("sha256:{:x}", hasher.finalize());

    info!("using {} for image layer", path.display());

    Ok(Layer { path, digest, size })
}
