//! Archive signing
//!
//! Signatures are RSA-SHA256 over the control segment (or index),
//! produced by the `openssl` CLI so key handling stays outside this
//! process. The signature is embedded as a `.SIGN.RSA256.<key>.pub`
//! entry per APK convention.

use crate::error::{ForgeError, ForgeResult};
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// The in-archive entry name for a signature made with `key_path`
pub fn signature_name(key_path: &Path) -> String {
    let key_name = key_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    format!(".SIGN.RSA256.{key_name}.pub")
}

/// Sign `data` with the RSA private key at `key_path`.
pub async fn sign_blob(
    key_path: &Path,
    passphrase: &str,
    data: &[u8],
) -> ForgeResult<Vec<u8>> {
    let mut cmd = Command::new("openssl");
    cmd.args(["dgst", "-sha256", "-sign"])
        .arg(key_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if !passphrase.is_empty() {
        cmd.arg("-passin").arg(format!("pass:{passphrase}"));
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ForgeError::command_failed("openssl dgst", e))?;

    let mut stdin = child.stdin.take().expect("stdin piped");
    stdin.write_all(data).await.map_err(|e| ForgeError::Sign {
        path: key_path.to_path_buf(),
        reason: e.to_string(),
    })?;
    drop(stdin);

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| ForgeError::command_failed("openssl dgst", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ForgeError::Sign {
            path: key_path.to_path_buf(),
            reason: stderr.trim().to_string(),
        });
    }

    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_entry_name() {
        assert_eq!(
            signature_name(Path::new("/keys/melange.rsa")),
            ".SIGN.RSA256.melange.rsa.pub"
        );
    }
}
