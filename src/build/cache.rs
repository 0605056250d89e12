//! Remote cache population
//!
//! Mirrors a `gs://bucket/prefix` object-store prefix into the local
//! cache directory, filtered down to the digest-named objects the
//! recipe actually references. Listing and reads go through the GCS
//! JSON API; authentication comes from the gcloud CLI when available
//! and silently downgrades to anonymous access otherwise.

use crate::error::{ForgeError, ForgeResult};
use crate::recipe::schema::{Pipeline, Recipe};
use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Object names the current recipe requires from the remote cache
pub type CacheMembershipSet = HashSet<String>;

/// Scan the recipe for digest references (`expected-sha256` /
/// `expected-sha512` pipeline inputs) and derive the membership set of
/// object names under `prefix`.
pub fn cache_items_for_recipe(recipe: &Recipe, prefix: &str) -> CacheMembershipSet {
    let mut digests = HashSet::new();

    fn scan(steps: &[Pipeline], digests: &mut HashSet<String>) {
        for step in steps {
            for (key, value) in &step.with {
                match key.as_str() {
                    "expected-sha256" => {
                        digests.insert(format!("sha256:{value}"));
                    }
                    "expected-sha512" => {
                        digests.insert(format!("sha512:{value}"));
                    }
                    _ => {}
                }
            }
            scan(&step.pipeline, digests);
        }
    }

    scan(&recipe.pipeline, &mut digests);
    for sp in &recipe.subpackages {
        scan(&sp.pipeline, &mut digests);
    }

    digests
        .into_iter()
        .map(|digest| {
            if prefix.is_empty() {
                digest
            } else {
                format!("{prefix}/{digest}")
            }
        })
        .collect()
}

/// Populate `cache_dir` from `cache_source`.
///
/// Non-`gs://` sources are currently no-ops. Objects are staged into a
/// temporary directory first; only regular files whose basename starts
/// with `sha256:` or `sha512:` are copied into the cache (anything else
/// is a misplaced object and is silently ignored).
pub async fn populate_cache(
    cache_dir: &Path,
    cache_source: &str,
    recipe: &Recipe,
) -> ForgeResult<()> {
    let Some(bucket_and_prefix) = cache_source.strip_prefix("gs://") else {
        return Ok(());
    };

    debug!("populating cache from {cache_source}");

    let (bucket, prefix) = bucket_and_prefix
        .split_once('/')
        .unwrap_or((bucket_and_prefix, ""));

    let membership = cache_items_for_recipe(recipe, prefix);

    let staging = tempfile::Builder::new()
        .prefix("apkforge-cache-")
        .tempdir()
        .map_err(|e| ForgeError::io("creating cache staging dir", e))?;

    fetch_bucket(bucket, prefix, &membership, staging.path()).await?;
    info!("cache bucket copied to {}", staging.path().display());

    std::fs::create_dir_all(cache_dir)
        .map_err(|e| ForgeError::io(format!("mkdir -p {}", cache_dir.display()), e))?;

    for entry in WalkDir::new(staging.path()).min_depth(1) {
        let entry = entry.map_err(|e| {
            ForgeError::io("walking cache staging dir", std::io::Error::other(e))
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        // Screen misplaced objects: only digest-named files are cached.
        let base = entry.file_name().to_string_lossy();
        if !base.starts_with("sha256:") && !base.starts_with("sha512:") {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(staging.path())
            .expect("walkdir yields children of staging dir");

        debug!("  -> {}", rel.display());
        crate::build::workspace::copy_file(staging.path(), rel, cache_dir)?;
    }

    // staging TempDir is removed on drop
    Ok(())
}

/// Mirror every membership object under `prefix` into `staging`.
async fn fetch_bucket(
    bucket: &str,
    prefix: &str,
    membership: &CacheMembershipSet,
    staging: &Path,
) -> ForgeResult<()> {
    let token = match gcloud_access_token().await {
        Ok(token) => Some(token),
        Err(e) => {
            info!("downgrading to anonymous mode: {e}");
            None
        }
    };

    let client = reqwest::Client::new();
    let mut page_token: Option<String> = None;

    loop {
        let mut request = client
            .get(format!(
                "https://storage.googleapis.com/storage/v1/b/{bucket}/o"
            ))
            .query(&[("prefix", prefix)]);
        if let Some(token) = &page_token {
            request = request.query(&[("pageToken", token.as_str())]);
        }
        if let Some(token) = &token {
            request = request.bearer_auth(token);
        }

        let listing: ObjectList = request.send().await?.error_for_status()?.json().await?;

        for object in &listing.items {
            if !membership.contains(&object.name) {
                continue;
            }

            let mut request = client
                .get(format!(
                    "https://storage.googleapis.com/storage/v1/b/{bucket}/o/{}",
                    encode_object_name(&object.name)
                ))
                .query(&[("alt", "media")]);
            if let Some(token) = &token {
                request = request.bearer_auth(token);
            }

            let body = request
                .send()
                .await?
                .error_for_status()
                .map_err(|e| ForgeError::CacheFetch {
                    object: object.name.clone(),
                    reason: e.to_string(),
                })?
                .bytes()
                .await
                .map_err(|e| ForgeError::CacheFetch {
                    object: object.name.clone(),
                    reason: e.to_string(),
                })?;

            let dest = staging.join(&object.name);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ForgeError::io(format!("mkdir -p {}", parent.display()), e))?;
            }
            std::fs::write(&dest, &body).map_err(|e| ForgeError::CacheFetch {
                object: object.name.clone(),
                reason: e.to_string(),
            })?;

            info!("cached gs://{bucket}/{} -> {}", object.name, dest.display());
        }

        match listing.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    Ok(())
}

#[derive(Debug, Default, serde::Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectInfo>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct ObjectInfo {
    name: String,
}

/// Percent-encode an object name for the JSON API path
fn encode_object_name(name: &str) -> String {
    name.replace('%', "%25")
        .replace('/', "%2F")
        .replace(':', "%3A")
        .replace('+', "%2B")
}

/// Obtain an access token from the gcloud CLI
async fn gcloud_access_token() -> ForgeResult<String> {
    let output = Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ForgeError::command_failed("gcloud auth print-access-token", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ForgeError::command_exec(
            "gcloud auth print-access-token",
            stderr.trim().to_string(),
        ));
    }

    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(ForgeError::command_exec(
            "gcloud auth print-access-token",
            "empty token returned",
        ));
    }

    Ok(token)
}
