//! Persistent offset index: (box, tag) → (offset, length) in the data file.
//!
//! The in-memory form is the authority for reads; the on-disk snapshot
//! (`<id>.idx`) is rewritten in full on save. A snapshot that is missing,
//! empty, or unparseable loads as an empty index — the recovery scan then
//! rebuilds it from the data file.
//!
//! On-disk layout, all integers little-endian:
//!
//! ```text
//! u32 box count
//!   per box:  u32 id length, UTF-8 id, u32 tag count
//!     per tag:  u32 tag length, UTF-8 tag, u32 offset, u32 length
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use hashbrown::HashMap;
use tracing::warn;

use crate::durability::durable_sync;
use crate::error::{io_err, FreightResult};

/// Address of the latest committed record for one tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u32,
    pub len: u32,
}

/// In-memory offset index for one truck.
#[derive(Debug, Default)]
pub struct OffsetIndex {
    boxes: HashMap<String, HashMap<String, IndexEntry>>,
}

impl OffsetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot. Absent or empty files produce an empty index; so
    /// does a snapshot that fails to parse, with a warning.
    pub fn load(path: &Path) -> Self {
        let mut bytes = Vec::new();
        match File::open(path) {
            Ok(mut file) => {
                if let Err(e) = file.read_to_end(&mut bytes) {
                    warn!(path = %path.display(), error = %e, "failed to read index snapshot, starting empty");
                    return Self::new();
                }
            }
            Err(_) => return Self::new(),
        }
        if bytes.is_empty() {
            return Self::new();
        }

        match Self::parse(&bytes) {
            Some(index) => index,
            None => {
                warn!(path = %path.display(), "index snapshot unparseable, starting empty");
                Self::new()
            }
        }
    }

    fn parse(bytes: &[u8]) -> Option<Self> {
        let mut pos = 0usize;

        let read_u32 = |bytes: &[u8], pos: &mut usize| -> Option<u32> {
            let end = pos.checked_add(4)?;
            if bytes.len() < end {
                return None;
            }
            let n = u32::from_le_bytes(bytes[*pos..end].try_into().ok()?);
            *pos = end;
            Some(n)
        };
        let read_str = |bytes: &[u8], pos: &mut usize| -> Option<String> {
            let len = read_u32(bytes, pos)? as usize;
            let end = pos.checked_add(len)?;
            if bytes.len() < end {
                return None;
            }
            let s = std::str::from_utf8(&bytes[*pos..end]).ok()?.to_string();
            *pos = end;
            Some(s)
        };

        let mut boxes = HashMap::new();
        let box_count = read_u32(bytes, &mut pos)?;
        for _ in 0..box_count {
            let box_id = read_str(bytes, &mut pos)?;
            let tag_count = read_u32(bytes, &mut pos)?;
            let mut tags = HashMap::with_capacity(tag_count as usize);
            for _ in 0..tag_count {
                let tag = read_str(bytes, &mut pos)?;
                let offset = read_u32(bytes, &mut pos)?;
                let len = read_u32(bytes, &mut pos)?;
                tags.insert(tag, IndexEntry { offset, len });
            }
            boxes.insert(box_id, tags);
        }
        if pos != bytes.len() {
            return None;
        }
        Some(Self { boxes })
    }

    /// Rewrite the snapshot in full and sync it to persistent storage.
    pub fn save(&self, path: &Path) -> FreightResult<()> {
        let mut buf = Vec::with_capacity(4 + self.boxes.len() * 32);
        buf.extend_from_slice(&(self.boxes.len() as u32).to_le_bytes());
        for (box_id, tags) in &self.boxes {
            buf.extend_from_slice(&(box_id.len() as u32).to_le_bytes());
            buf.extend_from_slice(box_id.as_bytes());
            buf.extend_from_slice(&(tags.len() as u32).to_le_bytes());
            for (tag, entry) in tags {
                buf.extend_from_slice(&(tag.len() as u32).to_le_bytes());
                buf.extend_from_slice(tag.as_bytes());
                buf.extend_from_slice(&entry.offset.to_le_bytes());
                buf.extend_from_slice(&entry.len.to_le_bytes());
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| io_err(path, "open index snapshot", e))?;
        file.write_all(&buf)
            .map_err(|e| io_err(path, "write index snapshot", e))?;
        durable_sync(&file).map_err(|e| io_err(path, "sync index snapshot", e))?;
        Ok(())
    }

    pub fn get(&self, box_id: &str, tag: &str) -> Option<IndexEntry> {
        self.boxes.get(box_id)?.get(tag).copied()
    }

    pub fn contains(&self, box_id: &str, tag: &str) -> bool {
        self.get(box_id, tag).is_some()
    }

    pub fn insert(&mut self, box_id: &str, tag: &str, entry: IndexEntry) {
        self.boxes
            .entry_ref(box_id)
            .or_default()
            .insert(tag.to_string(), entry);
    }

    /// Remove one tag; an emptied box disappears from the index.
    pub fn remove(&mut self, box_id: &str, tag: &str) {
        if let Some(tags) = self.boxes.get_mut(box_id) {
            tags.remove(tag);
            if tags.is_empty() {
                self.boxes.remove(box_id);
            }
        }
    }

    pub fn remove_box(&mut self, box_id: &str) {
        self.boxes.remove(box_id);
    }

    /// Tags of one box, unordered.
    pub fn tags(&self, box_id: &str) -> Vec<String> {
        self.boxes
            .get(box_id)
            .map(|tags| tags.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn boxes(&self) -> Vec<String> {
        self.boxes.keys().cloned().collect()
    }

    /// Iterate every (box, tag, entry).
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, IndexEntry)> {
        self.boxes.iter().flat_map(|(box_id, tags)| {
            tags.iter()
                .map(move |(tag, entry)| (box_id.as_str(), tag.as_str(), *entry))
        })
    }

    /// One past the end of the highest-addressed record, i.e. where the
    /// recovery scan begins. Zero for an empty index.
    pub fn max_offset(&self) -> u64 {
        self.iter()
            .map(|(_, _, entry)| entry.offset as u64 + entry.len as u64)
            .max()
            .unwrap_or(0)
    }

    pub fn tag_count(&self) -> usize {
        self.boxes.values().map(|tags| tags.len()).sum()
    }
}
