//! Structural diff and patch for records.
//!
//! A [`Delta`] describes how to turn one record into another. Field names of the
//! base object are sorted lexicographically; modified, deleted and nested fields
//! are referenced by their position in that sorted list, encoded as a single
//! character (position `n` maps to code point `48 + n`). Added fields are stored
//! under their literal name.
//!
//! Deltas are only meaningful against the exact base they were computed from and
//! do not commute with concurrent edits.

use crate::{error::Result, Error, Fields};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

const TOKEN_BASE: u32 = 48;
const SURROGATE_START: u32 = 0xD800;
const SURROGATE_LEN: u32 = 0x800;

/// Compact description of the differences between two records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Positional tokens of fields present only in the base
    #[serde(rename = "d", default, skip_serializing_if = "Vec::is_empty")]
    pub delete: Vec<String>,
    /// Fields present only in the target, by literal name
    #[serde(rename = "a", default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub add: Fields,
    /// New values of changed fields, by positional token
    #[serde(rename = "m", default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub modify: Fields,
    /// Nested deltas of structured fields, by positional token
    #[serde(rename = "r", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub recurse: BTreeMap<String, Delta>,
}

impl Delta {
    /// True when applying the delta changes nothing.
    pub fn is_empty(&self) -> bool {
        self.delete.is_empty()
            && self.add.is_empty()
            && self.modify.is_empty()
            && self.recurse.is_empty()
    }
}

/// Encode a position in a sorted name list as a one-character token.
pub fn position_token(position: usize) -> String {
    let mut code = TOKEN_BASE + position as u32;
    if code >= SURROGATE_START {
        code += SURROGATE_LEN;
    }
    char::from_u32(code)
        .map(String::from)
        .unwrap_or_default()
}

/// Decode a positional token back into a position.
pub fn token_position(token: &str) -> Result<usize> {
    let mut chars = token.chars();
    let (Some(c), None) = (chars.next(), chars.next()) else {
        return Err(Error::InvalidDelta(format!(
            "positional token must be one character: {:?}",
            token
        )));
    };
    let mut code = c as u32;
    if code < TOKEN_BASE {
        return Err(Error::InvalidDelta(format!("invalid positional token: {:?}", token)));
    }
    if code >= SURROGATE_START + SURROGATE_LEN {
        code -= SURROGATE_LEN;
    }
    Ok((code - TOKEN_BASE) as usize)
}

/// Compute the delta that turns `a` into `b`.
pub fn diff(a: &Fields, b: &Fields) -> Delta {
    let a_names = sorted_names(a.keys().map(String::as_str));
    let b_names = sorted_names(b.keys().map(String::as_str));
    diff_entries(&a_names, &b_names, |n| a.get(n), |n| b.get(n))
}

/// Apply a delta to a record in place.
pub fn patch(obj: &mut Fields, delta: &Delta) -> Result<()> {
    if delta.is_empty() {
        return Ok(());
    }
    let names: Vec<String> = sorted_names(obj.keys().map(String::as_str))
        .into_iter()
        .map(str::to_string)
        .collect();

    for (token, value) in &delta.modify {
        let name = resolve(&names, token)?;
        obj.insert(name.to_string(), value.clone());
    }
    for (token, nested) in &delta.recurse {
        let name = resolve(&names, token)?;
        let target = obj.get_mut(name).ok_or_else(|| {
            Error::InvalidDelta(format!("nested delta targets missing field '{}'", name))
        })?;
        patch_value(target, nested)?;
    }
    for token in &delta.delete {
        let name = resolve(&names, token)?;
        obj.remove(name);
    }
    for (name, value) in &delta.add {
        obj.insert(name.clone(), value.clone());
    }
    Ok(())
}

fn sorted_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut names: Vec<&str> = names.collect();
    names.sort_unstable();
    names
}

fn resolve<'n>(names: &'n [String], token: &str) -> Result<&'n str> {
    let position = token_position(token)?;
    names.get(position).map(String::as_str).ok_or_else(|| {
        Error::InvalidDelta(format!(
            "token {:?} points past the last of {} fields",
            token,
            names.len()
        ))
    })
}

/// Merge-walk two sorted name lists and collect the differences.
fn diff_entries<'v>(
    a_names: &[&str],
    b_names: &[&str],
    a_get: impl Fn(&str) -> Option<&'v Value>,
    b_get: impl Fn(&str) -> Option<&'v Value>,
) -> Delta {
    let mut delta = Delta::default();
    let (mut i, mut j) = (0, 0);

    while i < a_names.len() || j < b_names.len() {
        match (a_names.get(i), b_names.get(j)) {
            (Some(&an), Some(&bn)) if an == bn => {
                if let (Some(av), Some(bv)) = (a_get(an), b_get(bn)) {
                    compare(&mut delta, i, av, bv);
                }
                i += 1;
                j += 1;
            }
            (Some(&an), Some(&bn)) if an < bn => {
                delta.delete.push(position_token(i));
                i += 1;
            }
            (Some(_), Some(&bn)) | (None, Some(&bn)) => {
                if let Some(bv) = b_get(bn) {
                    delta.add.insert(bn.to_string(), bv.clone());
                }
                j += 1;
            }
            (Some(_), None) => {
                delta.delete.push(position_token(i));
                i += 1;
            }
            (None, None) => break,
        }
    }
    delta
}

fn compare(delta: &mut Delta, position: usize, a: &Value, b: &Value) {
    match (a, b) {
        (Value::Object(_), Value::Object(_)) | (Value::Array(_), Value::Array(_)) => {
            let nested = diff_value(a, b);
            if !nested.is_empty() {
                delta.recurse.insert(position_token(position), nested);
            }
        }
        _ if a != b => {
            delta.modify.insert(position_token(position), b.clone());
        }
        _ => {}
    }
}

fn diff_value(a: &Value, b: &Value) -> Delta {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => diff(a, b),
        (Value::Array(a), Value::Array(b)) => {
            let a_idx: Vec<String> = (0..a.len()).map(|i| i.to_string()).collect();
            let b_idx: Vec<String> = (0..b.len()).map(|i| i.to_string()).collect();
            let a_names = sorted_names(a_idx.iter().map(String::as_str));
            let b_names = sorted_names(b_idx.iter().map(String::as_str));
            diff_entries(
                &a_names,
                &b_names,
                |n| n.parse::<usize>().ok().and_then(|i| a.get(i)),
                |n| n.parse::<usize>().ok().and_then(|i| b.get(i)),
            )
        }
        _ => Delta::default(),
    }
}

fn patch_value(target: &mut Value, delta: &Delta) -> Result<()> {
    match target {
        Value::Object(map) => patch(map, delta),
        Value::Array(items) => patch_array(items, delta),
        _ if delta.is_empty() => Ok(()),
        other => Err(Error::InvalidDelta(format!(
            "cannot apply a nested delta to {}",
            other
        ))),
    }
}

/// Arrays are patched like objects keyed by their indices as strings.
fn patch_array(items: &mut Vec<Value>, delta: &Delta) -> Result<()> {
    let idx: Vec<String> = (0..items.len()).map(|i| i.to_string()).collect();
    let names: Vec<String> = sorted_names(idx.iter().map(String::as_str))
        .into_iter()
        .map(str::to_string)
        .collect();
    let index_of = |token: &str| -> Result<usize> {
        resolve(&names, token)?
            .parse::<usize>()
            .map_err(|e| Error::InvalidDelta(e.to_string()))
    };

    for (token, value) in &delta.modify {
        let i = index_of(token.as_str())?;
        items[i] = value.clone();
    }
    for (token, nested) in &delta.recurse {
        let i = index_of(token.as_str())?;
        patch_value(&mut items[i], nested)?;
    }

    let mut removed = delta
        .delete
        .iter()
        .map(|t| index_of(t.as_str()))
        .collect::<Result<Vec<_>>>()?;
    removed.sort_unstable_by(|x, y| y.cmp(x));
    removed.dedup();
    for i in removed {
        items.remove(i);
    }

    let mut added = delta
        .add
        .iter()
        .map(|(name, value)| {
            name.parse::<usize>()
                .map(|i| (i, value))
                .map_err(|_| Error::InvalidDelta(format!("array index expected, got '{}'", name)))
        })
        .collect::<Result<Vec<_>>>()?;
    added.sort_unstable_by_key(|(i, _)| *i);
    for (i, value) in added {
        match i.cmp(&items.len()) {
            std::cmp::Ordering::Less => items[i] = value.clone(),
            std::cmp::Ordering::Equal => items.push(value.clone()),
            std::cmp::Ordering::Greater => {
                return Err(Error::InvalidDelta(format!(
                    "array add at {} leaves a gap after {} items",
                    i,
                    items.len()
                )))
            }
        }
    }
    Ok(())
}
