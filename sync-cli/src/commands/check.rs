//! Validate a revision string.

use anyhow::{bail, Result};
use sync_types::{is_canonical, Revision};

/// Run the check command.
pub fn run(value: &str) -> Result<()> {
    match describe(value) {
        Ok(revision) => {
            println!("{}: canonical (u64 {})", value, revision.value());
            Ok(())
        }
        Err(reason) => bail!("{:?} is not a canonical revision: {}", value, reason),
    }
}

fn describe(value: &str) -> Result<Revision, &'static str> {
    if is_canonical(value) {
        return Revision::parse(value).map_err(|_| "out of range");
    }
    if value.is_empty() {
        Err("empty")
    } else if !value.bytes().all(|b| b.is_ascii_digit()) {
        Err("not a decimal integer")
    } else if value.len() > 1 && value.starts_with('0') {
        Err("leading zero")
    } else {
        Err("exceeds u64 range")
    }
}
