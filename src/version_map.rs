//! Loads the text file that names every game version this patch targets and
//! the address rules specific to each.
//!
//! ```text
//! # shared rules apply to every version
//! 80001000-80001fff: 4
//!
//! [PAL]
//! 80010000-80010fff: -8
//!
//! [NTSC-U]
//! 80010000-80010fff: 10
//! ```
//!
//! Lines before the first `[version]` header populate the root mapper that
//! every named version inherits from.

use std::collections::BTreeMap;
use std::path::Path;

use crate::address_mapper::AddressMapper;
use crate::error::{Error, Result};

/// An ordered `version_name -> AddressMapper` table.
///
/// Iteration order matches the order versions appeared in the file (or the
/// single synthetic `"default"` entry when no file was given).
#[derive(Debug, Default)]
pub struct VersionMap {
    order: Vec<String>,
    mappers: BTreeMap<String, AddressMapper>,
}

impl VersionMap {
    /// The version map used when no `--versionmap` file is given: a single
    /// version named `"default"` with an identity mapper.
    pub fn default_single() -> Self {
        let mut map = VersionMap::default();
        map.order.push("default".to_string());
        map.mappers
            .insert("default".to_string(), AddressMapper::new());
        map
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut map = VersionMap::default();
        let mut root = AddressMapper::new();
        let mut current: Option<(String, AddressMapper)> = None;

        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                if let Some((name, mapper)) = current.take() {
                    map.push(name, mapper);
                }
                current = Some((name.trim().to_string(), AddressMapper::child_of(root.clone())));
                continue;
            }

            let (start, end, delta) = parse_mapping_line(line, lineno + 1)?;
            match &mut current {
                Some((_, mapper)) => mapper.add_rule(start, end, delta)?,
                None => root.add_rule(start, end, delta)?,
            }
        }

        if let Some((name, mapper)) = current.take() {
            map.push(name, mapper);
        }

        if map.order.is_empty() {
            map.push("default".to_string(), root);
        }

        Ok(map)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        VersionMap::parse(&text)
    }

    fn push(&mut self, name: String, mapper: AddressMapper) {
        self.order.push(name.clone());
        self.mappers.insert(name, mapper);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AddressMapper)> {
        self.order
            .iter()
            .map(move |name| (name.as_str(), &self.mappers[name]))
    }
}

fn parse_mapping_line(line: &str, lineno: usize) -> Result<(u32, u32, i64)> {
    let (range, delta) = line.split_once(':').ok_or_else(|| {
        Error::InvalidData(format!("version map line {lineno}: missing ':' in {line:?}"))
    })?;
    let (start, end) = range.split_once('-').ok_or_else(|| {
        Error::InvalidData(format!(
            "version map line {lineno}: missing '-' in range {range:?}"
        ))
    })?;

    let start = u32::from_str_radix(start.trim(), 16).map_err(|_| {
        Error::InvalidData(format!(
            "version map line {lineno}: {:?} is not hexadecimal",
            start.trim()
        ))
    })?;
    let end = u32::from_str_radix(end.trim(), 16).map_err(|_| {
        Error::InvalidData(format!(
            "version map line {lineno}: {:?} is not hexadecimal",
            end.trim()
        ))
    })?;
    let delta_str = delta.trim();
    let delta: i64 = if let Some(stripped) = delta_str.strip_prefix('-') {
        -(i64::from_str_radix(stripped, 16)
            .or_else(|_| stripped.parse::<i64>())
            .map_err(|_| {
                Error::InvalidData(format!(
                    "version map line {lineno}: {delta_str:?} is not an integer delta"
                ))
            })?)
    } else {
        i64::from_str_radix(delta_str, 16)
            .or_else(|_| delta_str.parse::<i64>())
            .map_err(|_| {
                Error::InvalidData(format!(
                    "version map line {lineno}: {delta_str:?} is not an integer delta"
                ))
            })?
    };

    Ok((start, end, delta))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_file_yields_single_default_identity_version() {
        let map = VersionMap::default_single();
        let versions: Vec<_> = map.iter().collect();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].0, "default");
        assert_eq!(versions[0].1.remap(0x1234), 0x1234);
    }

    #[test]
    fn versions_inherit_shared_root_rules() {
        let text = "\
            80001000-80001fff: 4\n\
            [PAL]\n\
            80010000-80010fff: -8\n\
            [NTSC-U]\n\
            80010000-80010fff: 10\n";

        let map = VersionMap::parse(text).unwrap();
        let versions: Vec<_> = map.iter().collect();
        assert_eq!(versions.iter().map(|(n, _)| *n).collect::<Vec<_>>(), [
            "PAL", "NTSC-U"
        ]);

        let (_, pal) = versions[0];
        let (_, ntsc) = versions[1];

        // shared rule applies to both
        assert_eq!(pal.remap(0x80001500), 0x80001504);
        assert_eq!(ntsc.remap(0x80001500), 0x80001504);

        // version-specific rule differs
        assert_eq!(pal.remap(0x80010500), 0x800104f8);
        assert_eq!(ntsc.remap(0x80010500), 0x8001050a);
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let err = VersionMap::parse("not a valid line\n").unwrap_err();
        assert!(format!("{err}").contains("line 1"));
    }
}
