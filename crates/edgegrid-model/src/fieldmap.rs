//! Field maps for partial updates.
//!
//! Update requests name the fields the client intends to change as dotted
//! paths ("node_pools.num_nodes"). A parent field being present implies
//! all of its children are present. Per-API allowlists decide which fields
//! may actually be written.

use std::collections::BTreeSet;

/// The set of dotted field names a client is updating.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    fields: BTreeSet<String>,
}

impl FieldMap {
    pub fn new(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn count(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }

    pub fn insert(&mut self, field: impl Into<String>) {
        self.fields.insert(field.into());
    }

    /// True if `field` is set, either directly or because one of its
    /// ancestors is set (parent implies child).
    pub fn has(&self, field: &str) -> bool {
        if self.fields.contains(field) {
            return true;
        }
        // Walk ancestors: "a.b.c" is set if "a.b" or "a" is.
        let mut prefix = field;
        while let Some(idx) = prefix.rfind('.') {
            prefix = &prefix[..idx];
            if self.fields.contains(prefix) {
                return true;
            }
        }
        false
    }

    /// True if `field`, an ancestor, or any descendant of `field` is set.
    pub fn has_or_has_child(&self, field: &str) -> bool {
        if self.has(field) {
            return true;
        }
        let child_prefix = format!("{field}.");
        self.fields.iter().any(|f| f.starts_with(&child_prefix))
    }

    /// Fields present in the map that are not in the allowlist, considering
    /// ancestors (an allowlisted parent admits all of its children).
    pub fn disallowed<'a>(&'a self, allowed: &'a [&'a str]) -> Vec<&'a str> {
        let allow = FieldMap::new(allowed.iter().copied());
        self.fields
            .iter()
            .filter(|f| !allow.has(f))
            .map(String::as_str)
            .collect()
    }
}

impl<S: Into<String>> FromIterator<S> for FieldMap {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self::new(iter)
    }
}
