//! Locating and vetting the target binary before anything is spawned.
//!
//! Catches the classic footguns up front: shell-script wrappers, wrong file
//! format, missing instrumentation, or instrumented binaries run under the
//! emulator by mistake.

use std::{
    ffi::OsString,
    fs::File,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use libafl_bolts::Error;
use memmap2::Mmap;

use crate::config::{Config, DumbMode, SHM_ENV_VAR};

/// Resolve `name` to an absolute, executable, regular file, searching `PATH`
/// when it carries no slash.
pub fn find_binary(name: &str) -> Result<PathBuf, Error> {
    let candidate_ok = |path: &Path| {
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0 && m.len() >= 4)
            .unwrap_or(false)
    };

    if name.contains('/') {
        let path = PathBuf::from(name);
        if candidate_ok(&path) {
            return Ok(path);
        }
    } else if let Some(env_path) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&env_path) {
            let path = if dir.as_os_str().is_empty() {
                PathBuf::from(name)
            } else {
                dir.join(name)
            };
            if candidate_ok(&path) {
                return Ok(path);
            }
        }
    }

    Err(Error::illegal_argument(format!(
        "Program '{name}' not found or not executable"
    )))
}

/// What the on-disk scan of the target told us.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryTraits {
    /// The binary links a sanitizer runtime.
    pub uses_asan: bool,
}

/// Vet the resolved target: reject scripts and non-ELF files, demand
/// instrumentation unless it cannot be expected, and sniff for sanitizers.
///
/// `AFL_SKIP_BIN_CHECK` turns the whole pass into a no-op.
pub fn check_binary(cfg: &Config) -> Result<BinaryTraits, Error> {
    if cfg.skip_bin_check {
        return Ok(BinaryTraits::default());
    }

    log::info!("Validating target binary: {}", cfg.target_path.display());

    let file = File::open(&cfg.target_path)?;
    // Read-only view; the mapping drops at the end of the scan.
    let data = unsafe { Mmap::map(&file)? };

    if data.len() >= 2 && &data[..2] == b"#!" {
        log::error!(
            "The target looks like a shell script. Some build systems generate shell \
             stubs for dynamically linked programs; fuzz the real binary instead."
        );
        return Err(Error::illegal_argument(format!(
            "Program '{}' is a shell script",
            cfg.target_path.display()
        )));
    }

    if data.len() < 4 || data[0] != 0x7f || &data[1..4] != b"ELF" {
        return Err(Error::illegal_argument(format!(
            "Program '{}' is not an ELF binary",
            cfg.target_path.display()
        )));
    }

    let instrumented = contains(&data, SHM_ENV_VAR.as_bytes());

    if !cfg.qemu_mode && cfg.dumb_mode == DumbMode::Off && !instrumented {
        log::error!(
            "The target binary does not appear to be instrumented. Build it with the \
             instrumenting compiler, fall back to the emulator (-Q), or run as a dumb \
             fuzzer (-n)."
        );
        return Err(Error::illegal_argument("No instrumentation detected"));
    }

    if cfg.qemu_mode && instrumented {
        log::error!(
            "The target is compile-time instrumented but is being run under the \
             emulator (-Q); this would be slow for no benefit."
        );
        return Err(Error::illegal_argument("Instrumentation found in -Q mode"));
    }

    Ok(BinaryTraits {
        uses_asan: contains(&data, b"libasan.so") || contains(&data, b"__msan_init"),
    })
}

/// Rewrite every `@@` in the target argv to the test-case path.
pub fn substitute_input_path(args: &[String], input_path: &Path) -> Vec<OsString> {
    args.iter()
        .map(|arg| {
            if arg == "@@" {
                input_path.as_os_str().to_owned()
            } else {
                OsString::from(arg)
            }
        })
        .collect()
}

/// Whether the target argv wants the input as a file.
pub fn wants_input_file(args: &[String]) -> bool {
    args.iter().any(|arg| arg == "@@")
}

/// Locate the binary-only emulator for `-Q`, preferring `AFL_PATH`.
pub fn find_qemu() -> Result<PathBuf, Error> {
    if let Some(afl_path) = std::env::var_os("AFL_PATH") {
        let candidate = PathBuf::from(afl_path).join("afl-qemu-trace");
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    find_binary("afl-qemu-trace")
        .map_err(|_| Error::illegal_state("Unable to find 'afl-qemu-trace' (try setting AFL_PATH)"))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution_replaces_every_marker() {
        let args = vec!["-x".to_string(), "@@".to_string(), "@@".to_string()];
        let out = substitute_input_path(&args, Path::new("/tmp/out/.cur_input"));
        assert_eq!(out[0], "-x");
        assert_eq!(out[1], "/tmp/out/.cur_input");
        assert_eq!(out[2], "/tmp/out/.cur_input");
    }

    #[test]
    fn file_input_detection() {
        assert!(wants_input_file(&["@@".to_string()]));
        assert!(!wants_input_file(&["--stdin".to_string()]));
    }

    #[test]
    fn rejects_scripts_and_non_elf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script");
        std::fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();

        let found = find_binary(path.to_str().unwrap()).unwrap();
        assert_eq!(found, path);
    }
}
