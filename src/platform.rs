//! Platform detection for selecting the correct bottle

use crate::error::{Result, VeloError};

/// macOS major version → bottle codename, oldest first. Majors between two
/// entries (Apple skipped 16–25) take the newest codename at or below them;
/// majors below the table take the oldest, since no older bottles exist.
#[cfg(target_os = "macos")]
const MACOS_CODENAMES: &[(u32, &str)] = &[
    (11, "big_sur"),
    (12, "monterey"),
    (13, "ventura"),
    (14, "sonoma"),
    (15, "sequoia"),
    (26, "tahoe"),
];

/// Verify the running machine is a supported install target.
///
/// The core assumes a single target triple (Apple Silicon macOS); Linux
/// arm64/x86_64 is accepted for development use. Anything else is fatal at
/// startup.
pub fn check_architecture() -> Result<()> {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("macos", "aarch64") => Ok(()),
        ("linux", "aarch64") | ("linux", "x86_64") => Ok(()),
        (os, arch) => Err(VeloError::UnsupportedArchitecture(format!("{os}/{arch}"))),
    }
}

/// Detect the current platform tag for bottle selection, e.g.
/// `arm64_sonoma` or `x86_64_linux`.
pub fn detect_bottle_tag() -> Result<String> {
    #[cfg(target_os = "macos")]
    {
        let codename = macos_codename(&macos_product_version()?);
        Ok(format!("{}_{}", bottle_arch(), codename))
    }

    #[cfg(target_os = "linux")]
    {
        Ok(format!("{}_linux", bottle_arch()))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Err(VeloError::UnsupportedArchitecture(format!(
            "{}/{}",
            std::env::consts::OS,
            std::env::consts::ARCH
        )))
    }
}

/// Bottle tags spell Apple Silicon as `arm64`, not `aarch64`.
fn bottle_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        other => other,
    }
}

#[cfg(target_os = "macos")]
fn macos_product_version() -> Result<String> {
    let output = std::process::Command::new("sw_vers")
        .arg("-productVersion")
        .output()
        .map_err(|e| VeloError::ProcessError {
            command: "sw_vers -productVersion".to_string(),
            exit_code: -1,
            stderr: e.to_string(),
        })?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Map a `sw_vers` product version onto the codename bottles are tagged
/// with, clamping into the known table. Unparsable input (beta builds,
/// localised output) is treated as current.
#[cfg(target_os = "macos")]
fn macos_codename(product_version: &str) -> &'static str {
    let newest = MACOS_CODENAMES[MACOS_CODENAMES.len() - 1].1;
    let Some(major) = product_version
        .split('.')
        .next()
        .and_then(|part| part.parse::<u32>().ok())
    else {
        return newest;
    };

    MACOS_CODENAMES
        .iter()
        .rev()
        .find(|(known, _)| *known <= major)
        .map(|(_, codename)| *codename)
        .unwrap_or(MACOS_CODENAMES[0].1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bottle_tag_is_arch_then_os() {
        let tag = detect_bottle_tag().unwrap();
        let (arch, os) = tag.rsplit_once('_').expect("tag has an arch_os shape");
        assert!(matches!(arch, "arm64" | "x86_64"), "unexpected arch {arch}");
        assert!(!os.is_empty());
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn codename_lookup_clamps_into_the_table() {
        // Exact majors.
        assert_eq!(macos_codename("14.6.1"), "sonoma");
        assert_eq!(macos_codename("26.0"), "tahoe");
        // The 16–25 gap resolves to the newest codename at or below it.
        assert_eq!(macos_codename("16.0"), "sequoia");
        // Below the table there are no bottles; clamp to the oldest entry.
        assert_eq!(macos_codename("10.15.7"), "big_sur");
        // Unparsable output is treated as current.
        assert_eq!(macos_codename("not-a-version"), "tahoe");
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn codename_table_is_sorted_by_major() {
        let majors: Vec<u32> = MACOS_CODENAMES.iter().map(|(major, _)| *major).collect();
        let mut sorted = majors.clone();
        sorted.sort_unstable();
        assert_eq!(majors, sorted);
    }
}
