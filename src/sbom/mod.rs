//! SBOM generation
//!
//! One SPDX JSON document per (sub)package, written into the staged
//! tree at `var/lib/db/sbom/`. Timestamps derive from the source date
//! epoch so documents are reproducible.

use crate::error::{ForgeError, ForgeResult};
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::PathBuf;
use tracing::debug;

/// Inputs for one SBOM document
#[derive(Debug, Clone)]
pub struct Spec {
    /// Staged tree of the (sub)package
    pub path: PathBuf,
    pub package_name: String,
    /// Versioned release, e.g. `1.2.3-r0`
    pub package_version: String,
    pub license: String,
    pub copyright: String,
    pub namespace: String,
    pub arch: String,
}

/// SPDX document generator
pub struct Generator {
    created: DateTime<Utc>,
}

impl Generator {
    /// Create a generator whose document timestamps are pinned to the
    /// given source date epoch.
    pub fn new(source_date_epoch: i64) -> Self {
        let created = DateTime::from_timestamp(source_date_epoch, 0).unwrap_or_default();
        Self { created }
    }

    /// Generate and write the SBOM for one (sub)package
    pub fn generate(&self, spec: &Spec) -> ForgeResult<()> {
        let sbom_dir = spec.path.join("var/lib/db/sbom");
        std::fs::create_dir_all(&sbom_dir)
            .map_err(|e| ForgeError::io(format!("mkdir -p {}", sbom_dir.display()), e))?;

        let purl = format!(
            "pkg:apk/{}/{}@{}?arch={}",
            spec.namespace, spec.package_name, spec.package_version, spec.arch
        );
        let pkg_id = format!(
            "SPDXRef-Package-{}",
            spec.package_name.replace(|c: char| !c.is_alphanumeric(), "-")
        );

        let license = if spec.license.is_empty() {
            "NOASSERTION"
        } else {
            spec.license.as_str()
        };

        let doc = serde_json::json!({
            "SPDXID": "SPDXRef-DOCUMENT",
            "spdxVersion": "SPDX-2.3",
            "dataLicense": "CC0-1.0",
            "name": format!("apk-{}-{}", spec.package_name, spec.package_version),
            "documentNamespace": format!(
                "https://spdx.org/spdxdocs/apkforge/{}/{}-{}",
                spec.namespace, spec.package_name, spec.package_version
            ),
            "creationInfo": {
                "created": self.created.to_rfc3339_opts(SecondsFormat::Secs, true),
                "creators": ["Tool: apkforge"],
                "licenseListVersion": "3.22",
            },
            "packages": [{
                "SPDXID": pkg_id,
                "name": spec.package_name,
                "versionInfo": spec.package_version,
                "licenseDeclared": license,
                "copyrightText": if spec.copyright.is_empty() { "NOASSERTION" } else { spec.copyright.as_str() },
                "downloadLocation": "NOASSERTION",
                "externalRefs": [{
                    "referenceCategory": "PACKAGE-MANAGER",
                    "referenceType": "purl",
                    "referenceLocator": purl,
                }],
            }],
            "relationships": [{
                "spdxElementId": "SPDXRef-DOCUMENT",
                "relatedSpdxElement": pkg_id,
                "relationshipType": "DESCRIBES",
            }],
        });

        let out_path = sbom_dir.join(format!(
            "{}-{}.spdx.json",
            spec.package_name, spec.package_version
        ));
        let file = std::fs::File::create(&out_path)
            .map_err(|e| ForgeError::io(format!("create {}", out_path.display()), e))?;
        serde_json::to_writer_pretty(file, &doc)?;

        debug!("wrote SBOM to {}", out_path.display());
        Ok(())
    }
}
