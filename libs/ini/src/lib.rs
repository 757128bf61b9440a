//! Hierarchical INI reader.
//!
//! A small, strict reader for the configuration files starmer consumes.
//!
//! # Format
//!
//! ```text
//! ; comment
//! listenaddr = :1337
//!
//! [relay]
//! addr = localhost:9050
//!
//! [relay.fallback]
//! addr = localhost:9150
//! ```
//!
//! - Keys before the first section header belong to the global section.
//! - Dotted section names nest: `[a.b]` is subsection `b` of section `a`,
//!   always resolved from the global root.
//! - Values are taken verbatim after leading whitespace. There is no quoting
//!   and no escape processing, so regular expressions survive untouched.

use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

/// INI parse errors. Line numbers are 1-based.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IniError {
    /// A line starts with a character that cannot begin a statement.
    #[error("line {line}: unexpected '{ch}'")]
    Unexpected { line: usize, ch: char },

    /// Section header without a closing bracket.
    #[error("line {line}: expected ']'")]
    MissingBracket { line: usize },

    /// Something follows the closing bracket of a section header.
    #[error("line {line}: trailing characters after ']'")]
    TrailingCharacters { line: usize },

    /// Section header with an empty name.
    #[error("line {line}: empty section name")]
    EmptySection { line: usize },

    /// Dotted section name with an empty component (`[a..b]`).
    #[error("line {line}: empty subsection name")]
    EmptySubsection { line: usize },

    /// A statement that is neither a header nor `key = value`.
    #[error("line {line}: expected key = value")]
    ExpectedKeyValue { line: usize },
}

impl IniError {
    /// The line the error was found on.
    pub fn line(&self) -> usize {
        match self {
            IniError::Unexpected { line, .. }
            | IniError::MissingBracket { line }
            | IniError::TrailingCharacters { line }
            | IniError::EmptySection { line }
            | IniError::EmptySubsection { line }
            | IniError::ExpectedKeyValue { line } => *line,
        }
    }
}

/// A section of an INI document. The document root is the global section,
/// whose name is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ini {
    name: String,
    /// Keys in order of first appearance.
    keys: Vec<String>,
    /// Subsection names in order of first appearance.
    sections: Vec<String>,
    values: HashMap<String, String>,
    children: HashMap<String, Ini>,
}

impl Ini {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Parse a document.
    pub fn parse(text: &str) -> Result<Self, IniError> {
        let mut root = Ini::default();
        // Path from the root to the section receiving assignments.
        let mut current: Vec<String> = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let stmt = raw.trim_start_matches([' ', '\t']);
            let Some(first) = stmt.chars().next() else {
                continue;
            };

            match first {
                ';' => continue,
                ']' | '=' => return Err(IniError::Unexpected { line, ch: first }),
                '[' => {
                    let close = stmt.find(']').ok_or(IniError::MissingBracket { line })?;
                    if close != stmt.len() - 1 {
                        return Err(IniError::TrailingCharacters { line });
                    }

                    let name = stmt[1..close].trim_matches([' ', '\t']);
                    if name.is_empty() {
                        return Err(IniError::EmptySection { line });
                    }

                    let path: Vec<String> = name.split('.').map(str::to_string).collect();
                    if path.iter().any(String::is_empty) {
                        return Err(IniError::EmptySubsection { line });
                    }

                    root.section_mut(&path);
                    current = path;
                }
                _ => {
                    let (key, value) = match stmt.split_once('=') {
                        Some((key, value)) if !value.is_empty() => (key, value),
                        _ => return Err(IniError::ExpectedKeyValue { line }),
                    };

                    let key = key.trim_end_matches([' ', '\t']);
                    let value = value.trim_start_matches([' ', '\t']);
                    root.section_mut(&current).set(key, value);
                }
            }
        }

        Ok(root)
    }

    /// Walk to the section at `path`, creating missing sections on the way.
    fn section_mut(&mut self, path: &[String]) -> &mut Ini {
        let mut section = self;
        for name in path {
            if !section.children.contains_key(name) {
                section.sections.push(name.clone());
            }
            section = section
                .children
                .entry(name.clone())
                .or_insert_with(|| Ini::named(name));
        }
        section
    }

    fn set(&mut self, key: &str, value: &str) {
        if !self.values.contains_key(key) {
            self.keys.push(key.to_string());
        }
        self.values.insert(key.to_string(), value.to_string());
    }

    /// Section name; empty for the global section.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value of `key` in this section.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Value of `key` in this section, or the empty string when missing.
    pub fn value(&self, key: &str) -> &str {
        self.get(key).unwrap_or_default()
    }

    /// Direct subsection by name.
    pub fn section(&self, name: &str) -> Option<&Ini> {
        self.children.get(name)
    }

    /// Keys of this section in order of first appearance.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Direct subsection names in order of first appearance.
    pub fn sections(&self) -> &[String] {
        &self.sections
    }
}

impl FromStr for Ini {
    type Err = IniError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const STARMER_DEFAULT: &str = "listenaddr = :1337\n\
                                   toraddr    = localhost:9050\n\
                                   patt       = (imgur|sci-?hub|\\.onion$)\n";

    #[test]
    fn test_parse_global_keys() {
        let ini = Ini::parse(STARMER_DEFAULT).unwrap();
        assert_eq!(ini.name(), "");
        assert_eq!(ini.get("listenaddr"), Some(":1337"));
        assert_eq!(ini.get("toraddr"), Some("localhost:9050"));
        assert_eq!(ini.keys(), ["listenaddr", "toraddr", "patt"]);
    }

    #[test]
    fn test_value_backslashes_kept_verbatim() {
        let ini = Ini::parse(STARMER_DEFAULT).unwrap();
        assert_eq!(ini.value("patt"), r"(imgur|sci-?hub|\.onion$)");
    }

    #[test]
    fn test_value_keeps_inner_equals_and_trailing_text() {
        let ini = Ini::parse("patt = a=b ; not a comment").unwrap();
        assert_eq!(ini.value("patt"), "a=b ; not a comment");
    }

    #[test]
    fn test_missing_key_is_empty() {
        let ini = Ini::parse("listenaddr = :1337").unwrap();
        assert_eq!(ini.get("patt"), None);
        assert_eq!(ini.value("patt"), "");
    }

    #[test]
    fn test_comments_blank_lines_and_crlf() {
        let ini = Ini::parse("; header\r\n\r\n   \t\r\n  key = v\r\n").unwrap();
        assert_eq!(ini.value("key"), "v");
        assert_eq!(ini.keys().len(), 1);
    }

    #[test]
    fn test_nested_sections() {
        let text = "top = 1\n[relay]\naddr = a\n[relay.fallback]\naddr = b\n[ other ]\nx = y\n";
        let ini = Ini::parse(text).unwrap();

        assert_eq!(ini.value("top"), "1");
        assert_eq!(ini.sections(), ["relay", "other"]);

        let relay = ini.section("relay").unwrap();
        assert_eq!(relay.name(), "relay");
        assert_eq!(relay.value("addr"), "a");

        let fallback = relay.section("fallback").unwrap();
        assert_eq!(fallback.value("addr"), "b");
        assert_eq!(ini.section("other").unwrap().value("x"), "y");

        // Section keys do not leak into the global section.
        assert_eq!(ini.get("addr"), None);
    }

    #[test]
    fn test_reopened_section_is_reused() {
        let ini = Ini::parse("[a]\nx = 1\n[b]\n[a]\ny = 2\n").unwrap();
        assert_eq!(ini.sections(), ["a", "b"]);
        let a = ini.section("a").unwrap();
        assert_eq!(a.keys(), ["x", "y"]);
    }

    #[test]
    fn test_later_assignment_wins() {
        let ini = Ini::parse("k = 1\nk = 2\n").unwrap();
        assert_eq!(ini.value("k"), "2");
        assert_eq!(ini.keys(), ["k"]);
    }

    #[test]
    fn test_whitespace_only_value_is_empty() {
        let ini = Ini::parse("k = \n").unwrap();
        assert_eq!(ini.get("k"), Some(""));
    }

    #[rstest]
    #[case("] oops", IniError::Unexpected { line: 1, ch: ']' })]
    #[case("= oops", IniError::Unexpected { line: 1, ch: '=' })]
    #[case("[open", IniError::MissingBracket { line: 1 })]
    #[case("[a] x", IniError::TrailingCharacters { line: 1 })]
    #[case("[  ]", IniError::EmptySection { line: 1 })]
    #[case("[a..b]", IniError::EmptySubsection { line: 1 })]
    #[case("ok = 1\nnovalue", IniError::ExpectedKeyValue { line: 2 })]
    #[case("ok = 1\n\nkey =", IniError::ExpectedKeyValue { line: 3 })]
    fn test_parse_errors(#[case] text: &str, #[case] expected: IniError) {
        let err = Ini::parse(text).unwrap_err();
        assert_eq!(err.line(), expected.line());
        assert_eq!(err, expected);
    }
}
