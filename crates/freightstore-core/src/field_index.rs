//! Secondary string-field index with prefix search.
//!
//! For every box, field name, and distinct string value, holds the set of
//! tags whose current value carries that string at that top-level field.
//! Only string fields contribute; everything else is invisible here. The
//! per-field map is a BTreeMap so a prefix query is a range scan.
//!
//! The index is in-memory only: the truck rebuilds it at startup from the
//! live record set and maintains it incrementally afterwards.

use std::collections::{BTreeMap, HashSet};

use hashbrown::HashMap;

use crate::value::Value;

#[derive(Debug, Default)]
pub struct FieldIndex {
    // box -> field -> string value -> tags
    boxes: HashMap<String, HashMap<String, BTreeMap<String, HashSet<String>>>>,
}

impl FieldIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contributions of one tag: the pre-image's strings are
    /// removed before the new value's strings are added. Either side may be
    /// `None` (fresh insert / delete).
    pub fn update(&mut self, box_id: &str, tag: &str, old: Option<&Value>, new: Option<&Value>) {
        if let Some(old) = old {
            self.remove_contributions(box_id, tag, old);
        }
        if let Some(new) = new {
            self.add_contributions(box_id, tag, new);
        }
    }

    fn add_contributions(&mut self, box_id: &str, tag: &str, value: &Value) {
        let Some(entries) = value.as_map() else { return };
        let fields = self.boxes.entry_ref(box_id).or_default();
        for (field, field_value) in entries {
            if let Value::Str(s) = field_value {
                fields
                    .entry_ref(field.as_str())
                    .or_default()
                    .entry(s.clone())
                    .or_default()
                    .insert(tag.to_string());
            }
        }
    }

    fn remove_contributions(&mut self, box_id: &str, tag: &str, value: &Value) {
        let Some(entries) = value.as_map() else { return };
        let Some(fields) = self.boxes.get_mut(box_id) else { return };
        for (field, field_value) in entries {
            if let Value::Str(s) = field_value {
                if let Some(by_value) = fields.get_mut(field) {
                    if let Some(tags) = by_value.get_mut(s) {
                        tags.remove(tag);
                        if tags.is_empty() {
                            by_value.remove(s);
                        }
                    }
                    if by_value.is_empty() {
                        fields.remove(field);
                    }
                }
            }
        }
        if fields.is_empty() {
            self.boxes.remove(box_id);
        }
    }

    pub fn remove_box(&mut self, box_id: &str) {
        self.boxes.remove(box_id);
    }

    pub fn clear(&mut self) {
        self.boxes.clear();
    }

    /// Tags whose stored string at `field` starts with `prefix`. A tag maps
    /// to at most one string per field, so the result holds no duplicates.
    pub fn query_tags(&self, box_id: &str, field: &str, prefix: &str) -> Vec<String> {
        let Some(by_value) = self.boxes.get(box_id).and_then(|fields| fields.get(field)) else {
            return Vec::new();
        };

        let mut tags = Vec::new();
        for (stored, members) in by_value.range(prefix.to_string()..) {
            if !stored.starts_with(prefix) {
                break;
            }
            tags.extend(members.iter().cloned());
        }
        tags
    }
}
