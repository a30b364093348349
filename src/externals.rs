//! Loads externally-supplied symbol values (`--extern name=0xVALUE` files).
//!
//! These are addresses the caller already knows — usually functions or data
//! inside the base game — that object files may reference but that no
//! object file in this link defines.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::word::Word;

#[derive(Debug, Default, Clone)]
pub struct Externals {
    values: HashMap<String, Word>,
}

impl Externals {
    pub fn new() -> Self {
        Externals::default()
    }

    pub fn get(&self, name: &str) -> Option<Word> {
        self.values.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Word) {
        self.values.insert(name.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Word)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Parses one `name = 0xVALUE` per line. Blank lines and lines starting
    /// with `#` or `//` (after trimming) are skipped. A trailing `# comment`
    /// after a valid entry is allowed. Later duplicate names overwrite
    /// earlier ones.
    pub fn parse(text: &str) -> Result<Self> {
        let mut externals = Externals::new();
        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }

            let (name, rest) = line.split_once('=').ok_or_else(|| {
                Error::InvalidData(format!("externs line {}: missing '=' in {line:?}", lineno + 1))
            })?;
            let name = name.trim();
            if name.is_empty() || !is_valid_symbol_name(name) {
                return Err(Error::InvalidData(format!(
                    "externs line {}: {name:?} is not a valid symbol name",
                    lineno + 1
                )));
            }

            let value_field = rest.split('#').next().unwrap_or("").trim();
            let value_str = value_field.strip_prefix("0x").or_else(|| value_field.strip_prefix("0X")).ok_or_else(|| {
                Error::InvalidData(format!(
                    "externs line {}: value {value_field:?} must be hexadecimal (0x...)",
                    lineno + 1
                ))
            })?;
            let value = u32::from_str_radix(value_str, 16).map_err(|_| {
                Error::InvalidData(format!(
                    "externs line {}: {value_str:?} is not hexadecimal",
                    lineno + 1
                ))
            })?;

            externals.insert(name, Word::abs(value));
        }
        Ok(externals)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Externals::parse(&text)
    }
}

/// Mirrors the accepted symbol-name character class: alphanumerics,
/// underscore, and the handful of punctuation marks C++ name mangling uses
/// (`<>,-$`).
fn is_valid_symbol_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || "_<>,-$:".contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_entries() {
        let externals = Externals::parse("foo = 0x80001234\nbar=0xdeadbeef\n").unwrap();
        assert_eq!(externals.get("foo"), Some(Word::abs(0x8000_1234u32)));
        assert_eq!(externals.get("bar"), Some(Word::abs(0xdead_beefu32)));
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        let externals = Externals::parse("# a comment\n\nfoo = 0x1\n// another\n").unwrap();
        assert_eq!(externals.get("foo"), Some(Word::abs(1u32)));
    }

    #[test]
    fn allows_trailing_comment() {
        let externals = Externals::parse("foo = 0x1 # the thing\n").unwrap();
        assert_eq!(externals.get("foo"), Some(Word::abs(1u32)));
    }

    #[test]
    fn accepts_mangled_template_names() {
        let externals = Externals::parse("Foo<int,char>::Bar = 0x10\n").unwrap();
        assert_eq!(externals.get("Foo<int,char>::Bar"), Some(Word::abs(0x10u32)));
    }

    #[test]
    fn later_duplicate_wins() {
        let externals = Externals::parse("foo = 0x1\nfoo = 0x2\n").unwrap();
        assert_eq!(externals.get("foo"), Some(Word::abs(2u32)));
    }

    #[test]
    fn rejects_missing_0x_prefix() {
        assert!(Externals::parse("foo = 1234\n").is_err());
    }

    #[test]
    fn rejects_missing_equals() {
        assert!(Externals::parse("foo 0x1234\n").is_err());
    }
}
