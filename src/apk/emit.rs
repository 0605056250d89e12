//! APK archive emission
//!
//! An APK is a concatenation of gzip streams: an optional signature
//! segment, a control segment carrying `.PKGINFO`, and the data
//! segment with the staged file tree. The signature and control
//! segments are written without tar end-of-archive blocks so readers
//! see one continuous entry stream.

use crate::apk::sign;
use crate::error::{ForgeError, ForgeResult};
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Everything needed to emit one (sub)package archive
#[derive(Debug, Clone)]
pub struct EmitSpec {
    pub name: String,
    /// Upstream version (without the `-rN` release suffix)
    pub version: String,
    pub epoch: u64,
    pub description: String,
    pub license: String,
    /// Origin package name; `None` omits the field (strip-origin-name)
    pub origin: Option<String>,
    pub runtime_deps: Vec<String>,
    pub provides: Vec<String>,
    pub arch: String,
    /// Staged tree (`{workspace}/melange-out/{name}`)
    pub staged: PathBuf,
    /// Per-arch output directory (`{OutDir}/{arch}`)
    pub out_dir: PathBuf,
    /// Source date epoch: builddate and all mtimes
    pub source_date_epoch: i64,
    pub signing_key: Option<PathBuf>,
    pub signing_passphrase: String,
}

impl EmitSpec {
    /// Emitted file name, `{name}-{version}-r{epoch}.apk`
    pub fn file_name(&self) -> String {
        format!("{}-{}-r{}.apk", self.name, self.version, self.epoch)
    }
}

/// Emit the signed archive for one (sub)package; returns the written path.
pub async fn emit_package(spec: &EmitSpec) -> ForgeResult<PathBuf> {
    let fail = |reason: String| ForgeError::Emit {
        name: spec.name.clone(),
        reason,
    };

    let (data, installed_size) = data_segment(&spec.staged, spec.source_date_epoch)
        .map_err(|e| fail(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&data);
    let datahash = format!("{:x}", hasher.finalize());

    let pkginfo = render_pkginfo(spec, installed_size, &datahash);
    let control = segment_entry(".PKGINFO", pkginfo.as_bytes(), spec.source_date_epoch)
        .map_err(|e| fail(e.to_string()))?;

    let signature = match &spec.signing_key {
        Some(key) => {
            let sig = sign::sign_blob(key, &spec.signing_passphrase, &control).await?;
            Some(
                segment_entry(&sign::signature_name(key), &sig, spec.source_date_epoch)
                    .map_err(|e| fail(e.to_string()))?,
            )
        }
        None => None,
    };

    std::fs::create_dir_all(&spec.out_dir)
        .map_err(|e| fail(format!("mkdir -p {}: {e}", spec.out_dir.display())))?;

    let out_path = spec.out_dir.join(spec.file_name());
    let mut out = File::create(&out_path)
        .map_err(|e| fail(format!("create {}: {e}", out_path.display())))?;

    if let Some(sig) = &signature {
        out.write_all(sig).map_err(|e| fail(e.to_string()))?;
    }
    out.write_all(&control).map_err(|e| fail(e.to_string()))?;
    out.write_all(&data).map_err(|e| fail(e.to_string()))?;
    out.flush().map_err(|e| fail(e.to_string()))?;

    info!("wrote {}", out_path.display());
    Ok(out_path)
}

/// Render the `.PKGINFO` control file
fn render_pkginfo(spec: &EmitSpec, installed_size: u64, datahash: &str) -> String {
    let mut out = String::new();
    out.push_str("# Generated by apkforge\n");
    out.push_str(&format!("pkgname = {}\n", spec.name));
    out.push_str(&format!("pkgver = {}-r{}\n", spec.version, spec.epoch));
    out.push_str(&format!("arch = {}\n", spec.arch));
    out.push_str(&format!("pkgdesc = {}\n", spec.description));
    out.push_str(&format!("builddate = {}\n", spec.source_date_epoch));
    out.push_str("packager = apkforge\n");
    out.push_str(&format!("size = {installed_size}\n"));
    if let Some(origin) = &spec.origin {
        out.push_str(&format!("origin = {origin}\n"));
    }
    out.push_str(&format!("license = {}\n", spec.license));
    for dep in &spec.runtime_deps {
        out.push_str(&format!("depend = {dep}\n"));
    }
    for p in &spec.provides {
        out.push_str(&format!("provides = {p}\n"));
    }
    out.push_str(&format!("datahash = {datahash}\n"));
    out
}

/// A gzip stream containing a single tar entry and no end-of-archive
/// blocks, as APK control and signature segments require.
fn segment_entry(name: &str, data: &[u8], epoch: i64) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_ustar();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(epoch as u64);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();

    let mut raw = Vec::with_capacity(512 + data.len() + 512);
    raw.extend_from_slice(header.as_bytes());
    raw.extend_from_slice(data);
    let pad = (512 - data.len() % 512) % 512;
    raw.extend(std::iter::repeat(0u8).take(pad));

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&raw)?;
    gz.finish()
}

/// The data segment: a gzip tar of the staged tree with deterministic
/// ordering and mtimes. Returns the bytes and the installed size.
fn data_segment(staged: &Path, epoch: i64) -> ForgeResult<(Vec<u8>, u64)> {
    let gz = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(gz);
    builder.follow_symlinks(false);

    let mut installed_size = 0u64;

    let mut entries: Vec<PathBuf> = walkdir::WalkDir::new(staged)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .collect();
    entries.sort();

    for entry in entries {
        let rel = entry
            .strip_prefix(staged)
            .expect("walkdir yields children of staged dir");
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
                .map_err(|e| ForgeError::io("appending symlink", e))?;
        } else if meta.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            builder
                .append_data(&mut header, rel, std::io::empty())
                .map_err(|e| ForgeError::io("appending directory", e))?;
        } else {
            installed_size += meta.len();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(meta.len());
            let f = File::open(&entry)
                .map_err(|e| ForgeError::io(format!("open {}", entry.display()), e))?;
            builder
                .append_data(&mut header, rel, f)
                .map_err(|e| ForgeError::io("appending file", e))?;
        }
    }

    let gz = builder
        .into_inner()
        .map_err(|e| ForgeError::io("finishing data tar", e))?;
    let bytes = gz
        .finish()
        .map_err(|e| ForgeError::io("finishing data gzip", e))?;

    Ok((bytes, installed_size))
}
