//! APKINDEX generation
//!
//! Builds the signed tar index over a set of emitted archives, plus a
//! JSON rendering for tooling that does not speak the APKINDEX format.

use crate::apk::sign;
use crate::error::{ForgeError, ForgeResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One APKINDEX entry
#[derive(Debug, Clone, Serialize)]
pub struct IndexEntry {
    pub checksum: String,
    pub name: String,
    /// Versioned release, e.g. `1.0-r0`
    pub version: String,
    pub arch: String,
    pub size: u64,
    pub installed_size: u64,
    pub description: String,
    pub license: String,
    pub origin: String,
    pub depends: Vec<String>,
    pub provides: Vec<String>,
    pub build_time: i64,
}

/// Options for one index generation run
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Archives to index
    pub package_files: Vec<PathBuf>,
    pub signing_key: Option<PathBuf>,
    pub signing_passphrase: String,
    /// Retain entries from a pre-existing index for other packages
    pub merge_existing: bool,
    /// Output path for `APKINDEX.tar.gz`
    pub index_file: PathBuf,
}

/// Generate the signed index; returns the entries written.
pub async fn generate_index(opts: &IndexOptions) -> ForgeResult<Vec<IndexEntry>> {
    let mut entries = Vec::new();
    for apk in &opts.package_files {
        debug!("indexing {}", apk.display());
        entries.push(scan_apk(apk)?);
    }

    if opts.merge_existing && opts.index_file.is_file() {
        let fresh: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
        for existing in read_index(&opts.index_file)? {
            if !fresh.contains(&existing.name) {
                entries.push(existing);
            }
        }
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let apkindex = render_apkindex(&entries);

    let inner = {
        let gz = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(gz);

        append_text(&mut builder, "DESCRIPTION", "")
            .map_err(|e| ForgeError::Index(e.to_string()))?;
        append_text(&mut builder, "APKINDEX", &apkindex)
            .map_err(|e| ForgeError::Index(e.to_string()))?;

        builder
            .into_inner()
            .and_then(|gz| gz.finish())
            .map_err(|e| ForgeError::Index(e.to_string()))?
    };

    if let Some(parent) = opts.index_file.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ForgeError::io(format!("mkdir -p {}", parent.display()), e))?;
    }

    let mut out = File::create(&opts.index_file)
        .map_err(|e| ForgeError::io(format!("create {}", opts.index_file.display()), e))?;

    if let Some(key) = &opts.signing_key {
        let sig = sign::sign_blob(key, &opts.signing_passphrase, &inner).await?;
        let segment = signature_segment(&sign::signature_name(key), &sig)
            .map_err(|e| ForgeError::Index(e.to_string()))?;
        out.write_all(&segment)
            .map_err(|e| ForgeError::Index(e.to_string()))?;
    }
    out.write_all(&inner)
        .map_err(|e| ForgeError::Index(e.to_string()))?;

    info!(
        "wrote index with {} entries to {}",
        entries.len(),
        opts.index_file.display()
    );
    Ok(entries)
}

/// Write the JSON rendering of the index entries
pub fn write_json_index(entries: &[IndexEntry], path: &Path) -> ForgeResult<()> {
    let file = File::create(path)
        .map_err(|e| ForgeError::io(format!("create {}", path.display()), e))?;
    serde_json::to_writer_pretty(file, entries)?;
    Ok(())
}

/// Pull the index entry for one archive out of its control segment
fn scan_apk(path: &Path) -> ForgeResult<IndexEntry> {
    let bytes = std::fs::read(path)
        .map_err(|e| ForgeError::io(format!("reading {}", path.display()), e))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let checksum = format!("Q2{}", BASE64.encode(hasher.finalize()));

    let mut archive = tar::Archive::new(MultiGzDecoder::new(bytes.as_slice()));
    let mut pkginfo = None;
    for entry in archive
        .entries()
        .map_err(|e| ForgeError::Index(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| ForgeError::Index(e.to_string()))?;
        if entry
            .path()
            .ok()
            .and_then(|p| p.to_str().map(|s| s == ".PKGINFO"))
            .unwrap_or(false)
        {
            let mut text = String::new();
            entry
                .read_to_string(&mut text)
                .map_err(|e| ForgeError::Index(e.to_string()))?;
            pkginfo = Some(text);
            break;
        }
    }

    let pkginfo = pkginfo
        .ok_or_else(|| ForgeError::Index(format!("{}: no .PKGINFO found", path.display())))?;

    let mut entry = IndexEntry {
        checksum,
        name: String::new(),
        version: String::new(),
        arch: String::new(),
        size: bytes.len() as u64,
        installed_size: 0,
        description: String::new(),
        license: String::new(),
        origin: String::new(),
        depends: Vec::new(),
        provides: Vec::new(),
        build_time: 0,
    };

    for line in pkginfo.lines() {
        let Some((key, value)) = line.split_once(" = ") else {
            continue;
        };
        match key {
            "pkgname" => entry.name = value.to_string(),
            "pkgver" => entry.version = value.to_string(),
            "arch" => entry.arch = value.to_string(),
            "pkgdesc" => entry.description = value.to_string(),
            "license" => entry.license = value.to_string(),
            "origin" => entry.origin = value.to_string(),
            "size" => entry.installed_size = value.parse().unwrap_or(0),
            "builddate" => entry.build_time = value.parse().unwrap_or(0),
            "depend" => entry.depends.push(value.to_string()),
            "provides" => entry.provides.push(value.to_string()),
            _ => {}
        }
    }

    Ok(entry)
}

fn render_apkindex(entries: &[IndexEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        out.push_str(&format!("C:{}\n", e.checksum));
        out.push_str(&format!("P:{}\n", e.name));
        out.push_str(&format!("V:{}\n", e.version));
        out.push_str(&format!("A:{}\n", e.arch));
        out.push_str(&format!("S:{}\n", e.size));
        out.push_str(&format!("I:{}\n", e.installed_size));
        out.push_str(&format!("T:{}\n", e.description));
        out.push_str(&format!("L:{}\n", e.license));
        if !e.origin.is_empty() {
            out.push_str(&format!("o:{}\n", e.origin));
        }
        if !e.depends.is_empty() {
            out.push_str(&format!("D:{}\n", e.depends.join(" ")));
        }
        if !e.provides.is_empty() {
            out.push_str(&format!("p:{}\n", e.provides.join(" ")));
        }
        out.push_str(&format!("t:{}\n", e.build_time));
        out.push('\n');
    }
    out
}

fn parse_apkindex(text: &str) -> Vec<IndexEntry> {
    let mut entries = Vec::new();
    for block in text.split("\n\n").filter(|b| !b.trim().is_empty()) {
        let mut e = IndexEntry {
            checksum: String::new(),
            name: String::new(),
            version: String::new(),
            arch: String::new(),
            size: 0,
            installed_size: 0,
            description: String::new(),
            license: String::new(),
            origin: String::new(),
            depends: Vec::new(),
            provides: Vec::new(),
            build_time: 0,
        };
        for line in block.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key {
                "C" => e.checksum = value.to_string(),
                "P" => e.name = value.to_string(),
                "V" => e.version = value.to_string(),
                "A" => e.arch = value.to_string(),
                "S" => e.size = value.parse().unwrap_or(0),
                "I" => e.installed_size = value.parse().unwrap_or(0),
                "T" => e.description = value.to_string(),
                "L" => e.license = value.to_string(),
                "o" => e.origin = value.to_string(),
                "D" => e.depends = value.split(' ').map(String::from).collect(),
                "p" => e.provides = value.split(' ').map(String::from).collect(),
                "t" => e.build_time = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        if !e.name.is_empty() {
            entries.push(e);
        }
    }
    entries
}

/// Read entries back out of an existing `APKINDEX.tar.gz`
fn read_index(path: &Path) -> ForgeResult<Vec<IndexEntry>> {
    let file = File::open(path)
        .map_err(|e| ForgeError::io(format!("open {}", path.display()), e))?;
    let mut archive = tar::Archive::new(MultiGzDecoder::new(file));

    for entry in archive
        .entries()
        .map_err(|e| ForgeError::Index(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| ForgeError::Index(e.to_string()))?;
        if entry
            .path()
            .ok()
            .and_then(|p| p.to_str().map(|s| s == "APKINDEX"))
            .unwrap_or(false)
        {
            let mut text = String::new();
            entry
                .read_to_string(&mut text)
                .map_err(|e| ForgeError::Index(e.to_string()))?;
            return Ok(parse_apkindex(&text));
        }
    }

    Ok(Vec::new())
}

fn append_text<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    text: &str,
) -> std::io::Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_size(text.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, name, text.as_bytes())
}

/// Gzip stream with a single entry and no end-of-archive blocks
fn signature_segment(name: &str, data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_ustar();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apk::emit::{emit_package, EmitSpec};
    use tempfile::TempDir;

    async fn emit_fixture(name: &str, out: &Path) -> PathBuf {
        let staged = TempDir::new().unwrap();
        std::fs::create_dir_all(staged.path().join("usr/bin")).unwrap();
        std::fs::write(staged.path().join("usr/bin").join(name), b"x").unwrap();

        emit_package(&EmitSpec {
            name: name.into(),
            version: "1.0".into(),
            epoch: 0,
            description: format!("{name} package"),
            license: "MIT".into(),
            origin: Some(name.into()),
            runtime_deps: vec![],
            provides: vec![],
            arch: "x86_64".into(),
            staged: staged.path().to_path_buf(),
            out_dir: out.to_path_buf(),
            source_date_epoch: 1700000000,
            signing_key: None,
            signing_passphrase: String::new(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn index_lists_all_archives() {
        let out = TempDir::new().unwrap();
        let a = emit_fixture("liba", out.path()).await;
        let b = emit_fixture("libb", out.path()).await;

        let opts = IndexOptions {
            package_files: vec![a, b],
            signing_key: None,
            signing_passphrase: String::new(),
            merge_existing: false,
            index_file: out.path().join("APKINDEX.tar.gz"),
        };
        let entries = generate_index(&opts).await.unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "liba");
        assert_eq!(entries[1].name, "libb");
        assert!(opts.index_file.exists());
    }

    #[tokio::test]
    async fn index_roundtrips_through_tar() {
        let out = TempDir::new().unwrap();
        let a = emit_fixture("liba", out.path()).await;

        let opts = IndexOptions {
            package_files: vec![a],
            signing_key: None,
            signing_passphrase: String::new(),
            merge_existing: false,
            index_file: out.path().join("APKINDEX.tar.gz"),
        };
        generate_index(&opts).await.unwrap();

        let entries = read_index(&opts.index_file).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].version, "1.0-r0");
        assert!(entries[0].checksum.starts_with("Q2"));
    }

    #[tokio::test]
    async fn merge_retains_other_packages() {
        let out = TempDir::new().unwrap();
        let a = emit_fixture("liba", out.path()).await;
        let b = emit_fixture("libb", out.path()).await;
        let index_file = out.path().join("APKINDEX.tar.gz");

        generate_index(&IndexOptions {
            package_files: vec![a.clone(), b],
            signing_key: None,
            signing_passphrase: String::new(),
            merge_existing: false,
            index_file: index_file.clone(),
        })
        .await
        .unwrap();

        // Re-index only liba; libb must survive the merge.
        let entries = generate_index(&IndexOptions {
            package_files: vec![a],
            signing_key: None,
            signing_passphrase: String::new(),
            merge_existing: true,
            index_file,
        })
        .await
        .unwrap();

        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["liba", "libb"]);
    }

    #[tokio::test]
    async fn json_index_written() {
        let out = TempDir::new().unwrap();
        let a = emit_fixture("liba", out.path()).await;

        let entries = generate_index(&IndexOptions {
            package_files: vec![a],
            signing_key: None,
            signing_passphrase: String::new(),
            merge_existing: false,
            index_file: out.path().join("APKINDEX.tar.gz"),
        })
        .await
        .unwrap();

        let json_path = out.path().join("APKINDEX.json");
        write_json_index(&entries, &json_path).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(json_path).unwrap()).unwrap();
        assert_eq!(parsed[0]["name"], "liba");
    }
}
