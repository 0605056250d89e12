//! Target architecture names
//!
//! Architectures are carried in their APK spelling (`x86_64`, `aarch64`)
//! and converted to autoconf / Rust triplets for pipeline substitution.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A CPU architecture a package can be built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X86_64,
    Aarch64,
    Armv7,
    Riscv64,
    S390x,
    Ppc64le,
}

impl Arch {
    /// The APK index / repository spelling
    pub fn to_apk(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
            Self::Armv7 => "armv7",
            Self::Riscv64 => "riscv64",
            Self::S390x => "s390x",
            Self::Ppc64le => "ppc64le",
        }
    }

    /// GNU autoconf build triplet, e.g. `x86_64-pc-linux-gnu`
    pub fn to_triplet_gnu(self, flavor: &str) -> String {
        match self {
            Self::X86_64 => format!("x86_64-pc-linux-{flavor}"),
            Self::Aarch64 => format!("aarch64-unknown-linux-{flavor}"),
            Self::Armv7 => format!("armv7l-unknown-linux-{flavor}eabihf"),
            Self::Riscv64 => format!("riscv64-unknown-linux-{flavor}"),
            Self::S390x => format!("s390x-unknown-linux-{flavor}"),
            Self::Ppc64le => format!("powerpc64le-unknown-linux-{flavor}"),
        }
    }

    /// Rust/Cargo target triplet, e.g. `x86_64-unknown-linux-gnu`
    pub fn to_triplet_rust(self, flavor: &str) -> String {
        match self {
            Self::X86_64 => format!("x86_64-unknown-linux-{flavor}"),
            Self::Aarch64 => format!("aarch64-unknown-linux-{flavor}"),
            Self::Armv7 => format!("armv7-unknown-linux-{flavor}eabihf"),
            Self::Riscv64 => format!("riscv64gc-unknown-linux-{flavor}"),
            Self::S390x => format!("s390x-unknown-linux-{flavor}"),
            Self::Ppc64le => format!("powerpc64le-unknown-linux-{flavor}"),
        }
    }

    /// The architecture of the host this process runs on
    pub fn host() -> Self {
        match std::env::consts::ARCH {
            "aarch64" => Self::Aarch64,
            "arm" => Self::Armv7,
            "riscv64" => Self::Riscv64,
            "s390x" => Self::S390x,
            "powerpc64" => Self::Ppc64le,
            _ => Self::X86_64,
        }
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" | "amd64" => Ok(Self::X86_64),
            "aarch64" | "arm64" => Ok(Self::Aarch64),
            "armv7" | "arm" => Ok(Self::Armv7),
            "riscv64" => Ok(Self::Riscv64),
            "s390x" => Ok(Self::S390x),
            "ppc64le" => Ok(Self::Ppc64le),
            other => Err(format!("unknown architecture: {other}")),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_apk())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apk_spelling_roundtrip() {
        for arch in [
            Arch::X86_64,
            Arch::Aarch64,
            Arch::Armv7,
            Arch::Riscv64,
            Arch::S390x,
            Arch::Ppc64le,
        ] {
            assert_eq!(arch.to_apk().parse::<Arch>().unwrap(), arch);
        }
    }

    #[test]
    fn docker_spellings_accepted() {
        assert_eq!("amd64".parse::<Arch>().unwrap(), Arch::X86_64);
        assert_eq!("arm64".parse::<Arch>().unwrap(), Arch::Aarch64);
    }

    #[test]
    fn triplets() {
        assert_eq!(Arch::X86_64.to_triplet_gnu("gnu"), "x86_64-pc-linux-gnu");
        assert_eq!(
            Arch::X86_64.to_triplet_rust("musl"),
            "x86_64-unknown-linux-musl"
        );
        assert_eq!(
            Arch::Armv7.to_triplet_rust("gnu"),
            "armv7-unknown-linux-gnueabihf"
        );
    }
}
