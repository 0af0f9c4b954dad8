use std::fmt;
use std::str::FromStr;

use crate::error::{DrydockError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    MacOS,
    Windows,
    FreeBSD,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    I686,
    Aarch64,
    Armv7l,
    Powerpc64le,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::I686 => "i686",
            Self::Aarch64 => "aarch64",
            Self::Armv7l => "armv7l",
            Self::Powerpc64le => "powerpc64le",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "x86_64" | "amd64" => Self::X86_64,
            "i686" | "i386" => Self::I686,
            "aarch64" | "arm64" => Self::Aarch64,
            "armv7l" | "arm" | "armv7" => Self::Armv7l,
            "powerpc64le" | "ppc64le" => Self::Powerpc64le,
            _ => return None,
        })
    }
}

/// C library flavour; only meaningful on Linux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Libc {
    Glibc,
    Musl,
}

/// Immutable description of a build target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
    pub libc: Option<Libc>,
}

impl Platform {
    pub fn linux(arch: Arch, libc: Libc) -> Self {
        Self { os: Os::Linux, arch, libc: Some(libc) }
    }

    pub fn macos(arch: Arch) -> Self {
        Self { os: Os::MacOS, arch, libc: None }
    }

    pub fn windows(arch: Arch) -> Self {
        Self { os: Os::Windows, arch, libc: None }
    }

    pub fn freebsd(arch: Arch) -> Self {
        Self { os: Os::FreeBSD, arch, libc: None }
    }

    /// Canonical `arch-os-libc` triplet, used for shard names and paths.
    pub fn triplet(&self) -> String {
        let arch = self.arch.as_str();
        match self.os {
            Os::Linux => {
                let libc = match self.libc.unwrap_or(Libc::Glibc) {
                    Libc::Glibc => "gnu",
                    Libc::Musl => "musl",
                };
                let abi = if self.arch == Arch::Armv7l { "eabihf" } else { "" };
                format!("{}-linux-{}{}", arch, libc, abi)
            }
            Os::MacOS => format!("{}-apple-darwin14", arch),
            Os::Windows => format!("{}-w64-mingw32", arch),
            Os::FreeBSD => format!("{}-unknown-freebsd11.1", arch),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.triplet())
    }
}

impl FromStr for Platform {
    type Err = DrydockError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || DrydockError::ParseError(format!("unrecognized platform triplet: {}", s));
        let mut parts = s.splitn(2, '-');
        let arch = parts.next().and_then(Arch::parse).ok_or_else(bad)?;
        let rest = parts.next().ok_or_else(bad)?;

        if let Some(libc) = rest.strip_prefix("linux-") {
            let libc = if libc.starts_with("musl") {
                Libc::Musl
            } else if libc.starts_with("gnu") {
                Libc::Glibc
            } else {
                return Err(bad());
            };
            return Ok(Self::linux(arch, libc));
        }
        if rest == "linux" {
            return Ok(Self::linux(arch, Libc::Glibc));
        }
        if rest.starts_with("apple-darwin") || rest == "darwin" || rest == "macos" {
            return Ok(Self::macos(arch));
        }
        if rest == "w64-mingw32" || rest == "windows" {
            return Ok(Self::windows(arch));
        }
        if rest.starts_with("unknown-freebsd") || rest == "freebsd" {
            return Ok(Self::freebsd(arch));
        }
        Err(bad())
    }
}
