//! Order two revision strings.

use anyhow::{Context, Result};
use std::cmp::Ordering;
use sync_types::{compare_revisions, Revision};

/// Run the compare command.
pub fn run(a: &str, b: &str) -> Result<()> {
    Revision::parse(a).with_context(|| format!("left operand {:?}", a))?;
    Revision::parse(b).with_context(|| format!("right operand {:?}", b))?;
    println!("{} {} {}", a, symbol(compare_revisions(a, b)), b);
    Ok(())
}

fn symbol(ordering: Ordering) -> &'static str {
    match ordering {
        Ordering::Less => "<",
        Ordering::Equal => "=",
        Ordering::Greater => ">",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_follow_length_first_order() {
        assert_eq!(symbol(compare_revisions("9", "10")), "<");
        assert_eq!(symbol(compare_revisions("10", "10")), "=");
        assert_eq!(symbol(compare_revisions("100", "99")), ">");
    }

    #[test]
    fn rejects_non_canonical_operands() {
        assert!(run("1", "2").is_ok());
        assert!(run("01", "2").is_err());
        assert!(run("1", "x").is_err());
    }
}
