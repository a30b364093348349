//! Per-version address translation.
//!
//! A game ships in several revisions whose functions sit at slightly
//! different addresses. Rather than maintaining one object-file build per
//! revision, the same build is linked once per revision and every address
//! that matters is pushed through an `AddressMapper` first.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
struct Rule {
    start: u32,
    end: u32,
    delta: i64,
}

/// An ordered list of `(start, end) -> delta` rules, optionally chained to a
/// parent mapper.
///
/// `remap` walks this mapper's own rules first; if none match, and a parent
/// is present, the parent is consulted on the *original* address. A mapper
/// built for a named version in a version map is always a child of the root
/// mapper, so version-specific rules take priority over shared ones.
#[derive(Debug, Clone, Default)]
pub struct AddressMapper {
    rules: Vec<Rule>,
    parent: Option<Box<AddressMapper>>,
}

impl AddressMapper {
    pub fn new() -> Self {
        AddressMapper::default()
    }

    /// Builds a mapper that first tries `self`'s own rules, falling back to
    /// `parent` for addresses none of them cover.
    pub fn child_of(parent: AddressMapper) -> Self {
        AddressMapper {
            rules: Vec::new(),
            parent: Some(Box::new(parent)),
        }
    }

    /// Appends a translation rule covering `[start, end]` (inclusive).
    ///
    /// Rules must be added in non-decreasing, non-overlapping order; this
    /// mirrors the source file format, which lists ranges top to bottom.
    pub fn add_rule(&mut self, start: u32, end: u32, delta: i64) -> Result<()> {
        if end < start {
            return Err(Error::InvalidData(format!(
                "mapping range {start:#x}-{end:#x} has end before start"
            )));
        }
        if let Some(last) = self.rules.last() {
            if start <= last.end {
                return Err(Error::InvalidData(format!(
                    "mapping range {start:#x}-{end:#x} overlaps or precedes prior range {:#x}-{:#x}",
                    last.start, last.end
                )));
            }
        }
        self.rules.push(Rule { start, end, delta });
        Ok(())
    }

    pub fn remap(&self, address: u32) -> u32 {
        for rule in &self.rules {
            if address >= rule.start && address <= rule.end {
                return (address as i64 + rule.delta) as u32;
            }
        }
        match &self.parent {
            Some(parent) => parent.remap(address),
            None => address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mapper_is_identity() {
        let mapper = AddressMapper::new();
        assert_eq!(mapper.remap(0x1234), 0x1234);
        assert_eq!(mapper.remap(0), 0);
    }

    #[test]
    fn single_rule_applies_inside_range_only() {
        let mut mapper = AddressMapper::new();
        mapper.add_rule(0x1000, 0x1FFF, 0x10).unwrap();
        assert_eq!(mapper.remap(0x1500), 0x1510);
        assert_eq!(mapper.remap(0x0FFF), 0x0FFF);
        assert_eq!(mapper.remap(0x2000), 0x2000);
    }

    #[test]
    fn overlapping_rules_rejected() {
        let mut mapper = AddressMapper::new();
        mapper.add_rule(0x1000, 0x1FFF, 0x10).unwrap();
        assert!(mapper.add_rule(0x1500, 0x2000, 0x20).is_err());
    }

    #[test]
    fn backwards_range_rejected() {
        let mut mapper = AddressMapper::new();
        assert!(mapper.add_rule(0x2000, 0x1000, 0x10).is_err());
    }

    #[test]
    fn child_falls_back_to_parent() {
        let mut root = AddressMapper::new();
        root.add_rule(0x8000_0000, 0x8000_0FFF, 0x4).unwrap();

        let mut child = AddressMapper::child_of(root);
        child.add_rule(0x9000_0000, 0x9000_0FFF, 0x8).unwrap();

        assert_eq!(child.remap(0x9000_0010), 0x9000_0018);
        assert_eq!(child.remap(0x8000_0010), 0x8000_0014);
        assert_eq!(child.remap(0x1234), 0x1234);
    }

    #[test]
    fn negative_delta_supported() {
        let mut mapper = AddressMapper::new();
        mapper.add_rule(0x8000_1000, 0x8000_1FFF, -0x10).unwrap();
        assert_eq!(mapper.remap(0x8000_1050), 0x8000_1040);
    }
}
