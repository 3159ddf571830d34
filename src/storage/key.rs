//! Series keys
//!
//! A key is an application name plus an ordered label set, written as
//! `app.cpu{env=prod,host=web-1}`. Labels are kept sorted so that any
//! permutation of the same label set renders to one canonical string,
//! which is what every index and persisted object is keyed by.
//!
//! # Grammar
//!
//! ```text
//! key    := name [ '{' [ label ( ',' label )* ] '}' ]
//! label  := lname '=' lvalue
//! name   := any chars except { } , =      (non-empty after trimming)
//! lname  := any chars except { } , =      (non-empty after trimming)
//! lvalue := any chars except { } ,        (non-empty after trimming)
//! ```

use nom::{
    bytes::complete::take_while1,
    character::complete::char,
    combinator::opt,
    multi::separated_list0,
    sequence::{delimited, separated_pair},
    IResult,
};

use crate::storage::error::{StorageError, StorageResult};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Reserved label carrying the application name
pub const NAME_LABEL: &str = "__name__";

/// A parsed series key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    /// All labels including `__name__`, sorted by label name
    labels: BTreeMap<String, String>,
}

impl Key {
    /// Create a key with only an application name
    pub fn new(app_name: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(NAME_LABEL.to_string(), app_name.into());
        Self { labels }
    }

    /// Parse the canonical string form, see [`parse_key`]
    pub fn parse(input: &str) -> StorageResult<Self> {
        parse_key(input)
    }

    /// Builder method: add a label
    pub fn label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    /// Application name (`__name__` label)
    pub fn app_name(&self) -> &str {
        self.labels.get(NAME_LABEL).map(String::as_str).unwrap_or("")
    }

    /// Look up a label value
    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    /// Iterate over every `(name, value)` pair, `__name__` included
    pub fn labels(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Canonical string form: `name{a=1,b=2}` with labels sorted
    pub fn normalized(&self) -> String {
        let mut out = String::with_capacity(64);
        out.push_str(self.app_name());
        out.push('{');
        let mut first = true;
        for (name, value) in self.labels.iter().filter(|(k, _)| k.as_str() != NAME_LABEL) {
            if !first {
                out.push(',');
            }
            first = false;
            out.push_str(name);
            out.push('=');
            out.push_str(value);
        }
        out.push('}');
        out
    }

    /// Stable 64-bit FNV-1a hash of the canonical form
    pub fn fingerprint(&self) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in self.normalized().as_bytes() {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        hash
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized())
    }
}

impl FromStr for Key {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_key(s)
    }
}

/// Parse a key string into a [`Key`]
///
/// Fails with [`StorageError::InvalidKey`] on an empty name, unbalanced
/// braces, malformed labels or trailing input.
pub fn parse_key(input: &str) -> StorageResult<Key> {
    let input = input.trim();

    let (remaining, (name, labels)) = parse_full_key(input)
        .map_err(|e| StorageError::InvalidKey(format!("'{}': {:?}", input, e)))?;

    if !remaining.trim().is_empty() {
        return Err(StorageError::InvalidKey(format!(
            "'{}': unexpected input '{}'",
            input,
            remaining.trim()
        )));
    }

    let name = name.trim();
    if name.is_empty() {
        return Err(StorageError::InvalidKey(format!("'{}': empty name", input)));
    }

    let mut key = Key::new(name);
    for (label, value) in labels.unwrap_or_default() {
        let (label, value) = (label.trim(), value.trim());
        if label.is_empty() || value.is_empty() {
            return Err(StorageError::InvalidKey(format!(
                "'{}': empty label name or value",
                input
            )));
        }
        if label == NAME_LABEL {
            return Err(StorageError::InvalidKey(format!(
                "'{}': label {} is reserved",
                input, NAME_LABEL
            )));
        }
        key = key.label(label, value);
    }

    Ok(key)
}

type RawLabels<'a> = Vec<(&'a str, &'a str)>;

fn parse_full_key(input: &str) -> IResult<&str, (&str, Option<RawLabels<'_>>)> {
    let (input, name) = parse_name(input)?;
    let (input, labels) = opt(delimited(
        char('{'),
        separated_list0(char(','), parse_label),
        char('}'),
    ))(input)?;
    Ok((input, (name, labels)))
}

fn parse_name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !matches!(c, '{' | '}' | ',' | '='))(input)
}

fn parse_label(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(
        parse_name,
        char('='),
        take_while1(|c: char| !matches!(c, '{' | '}' | ',')),
    )(input)
}
