//! Extension set: which optional record fields accompany emitted flows.
//!
//! Parsed once from the `-T` option and written into the head of every flow
//! file so readers know which fields were populated when the file was cut.

use serde::{Deserialize, Serialize};

pub const DEFAULT_TAGS: &str = "1,2";

const TAG_INTERFACES: u32 = 1;
const TAG_FRAGMENTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionSet {
    bits: u32,
}

impl ExtensionSet {
    /// Parse a `-T` argument: `all`, or comma-separated numeric tags.
    pub fn parse(tags: &str) -> Result<Self, String> {
        let tags = tags.trim();
        if tags.eq_ignore_ascii_case("all") {
            return Ok(Self {
                bits: 1 << TAG_INTERFACES | 1 << TAG_FRAGMENTS,
            });
        }
        let mut bits = 0u32;
        for tag in tags.split(',') {
            let tag = tag.trim();
            match tag.parse::<u32>() {
                Ok(n @ (TAG_INTERFACES | TAG_FRAGMENTS)) => bits |= 1 << n,
                Ok(n) => return Err(format!("unknown extension tag '{n}'")),
                Err(_) => return Err(format!("bad extension tag '{tag}'")),
            }
        }
        Ok(Self { bits })
    }

    pub fn interfaces(&self) -> bool {
        self.bits & (1 << TAG_INTERFACES) != 0
    }

    pub fn fragments(&self) -> bool {
        self.bits & (1 << TAG_FRAGMENTS) != 0
    }
}

impl Default for ExtensionSet {
    fn default() -> Self {
        Self::parse(DEFAULT_TAGS).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_enables_both_extensions() {
        let set = ExtensionSet::default();
        assert!(set.interfaces());
        assert!(set.fragments());
    }

    #[test]
    fn parse_single_tag() {
        let set = ExtensionSet::parse("1").unwrap();
        assert!(set.interfaces());
        assert!(!set.fragments());
    }

    #[test]
    fn parse_all_keyword() {
        assert_eq!(ExtensionSet::parse("all").unwrap(), ExtensionSet::default());
    }

    #[test]
    fn parse_rejects_unknown_and_garbage() {
        assert!(ExtensionSet::parse("7").is_err());
        assert!(ExtensionSet::parse("1,x").is_err());
    }
}
