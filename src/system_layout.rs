//! Reference mapping of the current keyboard layout
//!
//! Read from `xmodmap -pke`, whose lines look like
//! `keycode  38 = a A a A`. The symbol columns are kept as a list so a
//! symbol can be found regardless of the modifier column it sits in.

use anyhow::{Context, Result, bail};
use std::process::Command;
use tracing::{debug, warn};

use crate::mapping::Mapping;

/// Parse `xmodmap -pke` output into a mapping
///
/// Lines without symbols or with an unparsable keycode are skipped.
pub fn parse_xmodmap(output: &str) -> Mapping {
    let mut mapping = Mapping::new();
    for line in output.lines() {
        let Some(rest) = line.trim().strip_prefix("keycode") else {
            continue;
        };
        let Some((keycode, symbols)) = rest.split_once('=') else {
            continue;
        };
        let symbols: Vec<String> = symbols.split_whitespace().map(str::to_string).collect();
        if symbols.is_empty() {
            continue;
        }
        if !mapping.change(keycode, symbols, None) {
            debug!(line = %line, "Skipping xmodmap line");
        }
    }
    mapping.changed = false;
    mapping
}

fn run_xmodmap() -> Result<String> {
    let output = Command::new("xmodmap")
        .arg("-pke")
        .output()
        .context("Failed to run xmodmap")?;
    if !output.status.success() {
        bail!("xmodmap exited with {}", output.status);
    }
    String::from_utf8(output.stdout).context("xmodmap printed invalid UTF-8")
}

/// The system layout, or an empty mapping if xmodmap is unavailable
pub fn load() -> Mapping {
    match run_xmodmap() {
        Ok(output) => {
            let mapping = parse_xmodmap(&output);
            debug!(keys = mapping.len(), "Loaded system layout");
            mapping
        }
        Err(e) => {
            warn!(error = %e, "Could not read the system layout, symbols won't resolve");
            Mapping::new()
        }
    }
}
