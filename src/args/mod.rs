//! LaTeX-style key-value argument lists.
//!
//! An argument group like `[margin = 2cm, landscape]` or
//! `{a = 1, b = {c = 2}}` parses into a [`KeyValList`]: an ordered list of
//! keys with optional values, where a value is either an opaque scalar or a
//! nested list. Lists render back to a canonical form and merge recursively.

mod parser;

pub(crate) use parser::{find_matching, parse_list};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Characters with structural meaning inside an argument list. A backslash
/// in front of one of these removes that meaning; a backslash in front of
/// anything else is ordinary text.
pub(crate) const STRUCTURAL: &[char] = &['{', '}', '[', ']', ',', '='];

/// The value side of a `key = value` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgValue {
    /// Opaque text, kept verbatim apart from trimming and escape removal.
    Scalar(String),
    /// A nested key-value list, from a value written as `{...}` or `[...]`.
    List(KeyValList),
}

impl ArgValue {
    /// Parses raw argument text (the inside of a delimiter group) into a
    /// list value.
    pub fn parse(text: &str) -> Result<ArgValue> {
        Ok(ArgValue::List(parse_list(text, 0)?))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ArgValue::Scalar(s) => s.is_empty(),
            ArgValue::List(l) => l.is_empty(),
        }
    }

    /// Canonical rendering, without enclosing delimiters.
    pub fn render(&self) -> String {
        match self {
            ArgValue::Scalar(s) => s.clone(),
            ArgValue::List(l) => l.render(),
        }
    }

    /// Merges `incoming` into `existing` and returns the combined value.
    pub fn merge(existing: Option<ArgValue>, incoming: ArgValue) -> Result<ArgValue> {
        let mut slot = existing;
        merge_value(&mut slot, Some(incoming))?;
        Ok(slot.unwrap_or_else(|| ArgValue::List(KeyValList::default())))
    }
}

/// A single entry of an argument list: a key with an optional value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyVal {
    pub key: String,
    pub value: Option<ArgValue>,
}

impl KeyVal {
    pub fn new(key: impl Into<String>, value: Option<ArgValue>) -> Self {
        KeyVal {
            key: key.into(),
            value,
        }
    }

    /// A bare key without a value.
    pub fn flag(key: impl Into<String>) -> Self {
        KeyVal::new(key, None)
    }

    /// Renders as `key`, `key = value`, or `key = {list}`. Stored text is
    /// emitted literally; escapes were already removed at parse time.
    pub fn render(&self) -> String {
        match &self.value {
            None => self.key.clone(),
            Some(ArgValue::Scalar(s)) => format!("{} = {}", self.key, s),
            Some(ArgValue::List(l)) => format!("{} = {{{}}}", self.key, l.render()),
        }
    }
}

/// An ordered key-value list. Keys are unique; inserting an existing key
/// replaces its value in place, keeping the original position.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KeyValList(Vec<KeyVal>);

impl KeyValList {
    /// Parses the inside of an argument group.
    pub fn parse(text: &str) -> Result<Self> {
        parse_list(text, 0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, KeyVal> {
        self.0.iter()
    }

    pub fn get(&self, key: &str) -> Option<&KeyVal> {
        self.0.iter().find(|kv| kv.key == key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut KeyVal> {
        self.0.iter_mut().find(|kv| kv.key == key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Inserts an entry. If the key is already present, its value is
    /// replaced and the entry stays where it was.
    pub fn push(&mut self, entry: KeyVal) {
        match self.get_mut(&entry.key) {
            Some(existing) => existing.value = entry.value,
            None => self.0.push(entry),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<KeyVal> {
        let idx = self.0.iter().position(|kv| kv.key == key)?;
        Some(self.0.remove(idx))
    }

    /// Merges another list into this one. Entries with new keys are
    /// appended in their incoming order; entries with known keys have
    /// their values merged recursively via [`merge_value`].
    pub fn merge(&mut self, incoming: KeyValList) -> Result<()> {
        for entry in incoming.0 {
            match self.get_mut(&entry.key) {
                Some(existing) => merge_value(&mut existing.value, entry.value)?,
                None => self.0.push(entry),
            }
        }
        Ok(())
    }

    /// Canonical rendering: `key`, `key = scalar`, or `key = {list}`,
    /// joined by `, `.
    pub fn render(&self) -> String {
        self.0
            .iter()
            .map(KeyVal::render)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl IntoIterator for KeyValList {
    type Item = KeyVal;
    type IntoIter = std::vec::IntoIter<KeyVal>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<KeyVal> for KeyValList {
    fn from_iter<T: IntoIterator<Item = KeyVal>>(iter: T) -> Self {
        let mut list = KeyValList::default();
        for entry in iter {
            list.push(entry);
        }
        list
    }
}

/// Merges an incoming value into an existing slot.
///
/// An absent or empty existing value adopts the incoming one; an absent
/// incoming value clears the slot. Two scalars replace; two lists merge
/// keywise. A scalar meeting a non-empty list (either way) is a conflict.
pub(crate) fn merge_value(
    existing: &mut Option<ArgValue>,
    incoming: Option<ArgValue>,
) -> Result<()> {
    let Some(incoming) = incoming else {
        *existing = None;
        return Ok(());
    };
    match existing {
        None => *existing = Some(incoming),
        Some(value) if value.is_empty() => *existing = Some(incoming),
        Some(ArgValue::Scalar(s)) => match incoming {
            ArgValue::Scalar(new) => *s = new,
            ArgValue::List(_) => {
                return Err(Error::MergeConflict {
                    existing: s.clone(),
                    incoming: incoming.render(),
                })
            }
        },
        Some(ArgValue::List(l)) => match incoming {
            ArgValue::Scalar(new) => {
                return Err(Error::MergeConflict {
                    existing: l.render(),
                    incoming: new,
                })
            }
            ArgValue::List(inc) => l.merge(inc)?,
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> KeyValList {
        KeyValList::parse(text).expect("parse error")
    }

    #[test]
    fn merge_recursive() {
        let mut base = parse("a = 1, b = {c = 2, d}");
        base.merge(parse("b = {c = 3, e = 5}")).unwrap();
        assert_eq!("a = 1, b = {c = 3, d, e = 5}", base.render());
    }

    #[test]
    fn merge_appends_new_keys_in_order() {
        let mut base = parse("x, y = 1");
        base.merge(parse("z = 2, w")).unwrap();
        assert_eq!("x, y = 1, z = 2, w", base.render());
    }

    #[test]
    fn merge_is_idempotent() {
        let mut base = parse("a = 1, b = {c = 2, d}");
        let copy = base.clone();
        base.merge(copy.clone()).unwrap();
        assert_eq!(copy.render(), base.render());
    }

    #[test]
    fn merge_scalar_replaces_scalar() {
        let mut base = parse("margin = 2cm");
        base.merge(parse("margin = 3cm")).unwrap();
        assert_eq!("margin = 3cm", base.render());
    }

    #[test]
    fn merge_empty_value_adopts_incoming() {
        let mut base = parse("a =, b = {}");
        base.merge(parse("a = {x = 1}, b = 2")).unwrap();
        assert_eq!("a = {x = 1}, b = 2", base.render());
    }

    #[test]
    fn merge_bare_key_clears_value() {
        let mut base = parse("geometry = {margin = 2cm}");
        base.merge(parse("geometry")).unwrap();
        assert_eq!("geometry", base.render());
    }

    #[test]
    fn merge_scalar_into_list_conflicts() {
        let mut base = parse("b = {c = 2}");
        let err = base.merge(parse("b = 7")).unwrap_err();
        assert!(matches!(err, Error::MergeConflict { .. }), "{err:?}");
    }

    #[test]
    fn merge_list_into_scalar_conflicts() {
        let mut base = parse("b = 7");
        let err = base.merge(parse("b = {c = 2}")).unwrap_err();
        assert!(matches!(err, Error::MergeConflict { .. }), "{err:?}");
    }

    #[test]
    fn push_replaces_in_place() {
        let mut list = parse("a = 1, b = 2");
        list.push(KeyVal::new("a", Some(ArgValue::Scalar("9".into()))));
        assert_eq!("a = 9, b = 2", list.render());
    }

    #[test]
    fn remove_returns_entry() {
        let mut list = parse("a = 1, b");
        let removed = list.remove("a").unwrap();
        assert_eq!("a = 1", removed.render());
        assert_eq!("b", list.render());
        assert!(list.remove("a").is_none());
    }

    #[test]
    fn test_serialize() {
        let list = parse("a = 1, b = {c = 2, d}");
        let json = serde_json::to_string(&list).unwrap();
        let back: KeyValList = serde_json::from_str(&json).unwrap();
        assert_eq!(list, back);
    }
}
