//! The per-truck storage engine.
//!
//! A truck owns one append-only data file (`<id>.dat`) and one index
//! snapshot (`<id>.idx`). All mutations stage through an in-memory write
//! buffer and reach disk as transaction-framed batches:
//!
//! 1. append TX_START, one record per buffered entry, TX_COMMIT
//! 2. one durable sync
//! 3. apply the address updates to the offset index
//!
//! A crash between 1 and 3 is repaired by the recovery scan, which only
//! applies envelopes whose commit marker landed intact.
//!
//! The truck is exclusively owned by its worker thread (or by the test
//! that built it); single-threaded ownership is what serializes mutations.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::cache::Lru;
use crate::codec::{
    decode_value, encode_record, encode_value, parse_record, RecordParseError, MAX_ID_LEN,
    SYS_BOX, TX_COMMIT_PREFIX, TX_START_PREFIX,
};
use crate::config::Config;
use crate::durability::durable_sync;
use crate::error::{io_err, FreightError, FreightResult};
use crate::field_index::FieldIndex;
use crate::index::{IndexEntry, OffsetIndex};
use crate::value::Value;

/// Per-process transaction id counter. Strictly increasing, never persisted.
static TX_COUNTER: AtomicU64 = AtomicU64::new(1);

/// One staged mutation; `value` of `None` is the tombstone sentinel.
#[derive(Debug, Clone)]
struct BufferedEntry {
    box_id: String,
    tag: String,
    value: Option<Value>,
}

fn buffer_key(box_id: &str, tag: &str) -> String {
    format!("{}:{}", box_id, tag)
}

/// Reject identifiers a record could not frame, plus the reserved system
/// box, before anything is staged.
fn check_box(box_id: &str) -> FreightResult<()> {
    if box_id == SYS_BOX {
        return Err(FreightError::Codec {
            reason: format!("box id '{}' is reserved", SYS_BOX),
        });
    }
    if box_id.is_empty() || box_id.len() > MAX_ID_LEN {
        return Err(FreightError::Codec {
            reason: format!("box id length {} out of range", box_id.len()),
        });
    }
    Ok(())
}

fn check_ids(box_id: &str, tag: &str) -> FreightResult<()> {
    check_box(box_id)?;
    if tag.is_empty() || tag.len() > MAX_ID_LEN {
        return Err(FreightError::Codec {
            reason: format!("tag length {} out of range", tag.len()),
        });
    }
    Ok(())
}

/// One logical database instance.
pub struct Truck {
    id: String,
    data_path: PathBuf,
    index_path: PathBuf,
    /// Append handle; `None` once closed or mid-compaction swap
    writer: Option<File>,
    /// Random-read handle
    reader: Option<File>,
    /// Current data file length, i.e. the next append offset
    data_len: u64,
    index: OffsetIndex,
    cache: Lru<String, Value>,
    fields: FieldIndex,
    buffer: HashMap<String, BufferedEntry>,
    flush_deadline: Option<Instant>,
    dirty_since_save: u64,
    ops_since_compact: u64,
    config: Config,
}

impl Truck {
    /// Open or create the truck under `root`, run recovery, and rebuild the
    /// field index from the live record set.
    pub fn open(root: &Path, id: &str, config: Config) -> FreightResult<Self> {
        let data_path = root.join(format!("{}.dat", id));
        let index_path = root.join(format!("{}.idx", id));

        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)
            .map_err(|e| io_err(&data_path, "open data file", e))?;
        let reader = File::open(&data_path).map_err(|e| io_err(&data_path, "open data reader", e))?;
        let data_len = writer
            .metadata()
            .map_err(|e| io_err(&data_path, "stat data file", e))?
            .len();

        let index = OffsetIndex::load(&index_path);

        let mut truck = Self {
            id: id.to_string(),
            data_path,
            index_path,
            writer: Some(writer),
            reader: Some(reader),
            data_len,
            index,
            cache: Lru::new(config.truck_cache_capacity),
            fields: FieldIndex::new(),
            buffer: HashMap::new(),
            flush_deadline: None,
            dirty_since_save: 0,
            ops_since_compact: 0,
            config,
        };

        let tail = truck.index.max_offset();
        if truck.data_len > tail {
            truck.recover(tail)?;
        }
        truck.rebuild_field_index()?;

        debug!(truck = %truck.id, tags = truck.index.tag_count(), "truck opened");
        Ok(truck)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Deadline of the pending scheduled flush, if one is armed.
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.flush_deadline
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Stage a value for (box, tag). With `sync` the write is durable before
    /// this returns; otherwise it is buffered and a flush is scheduled.
    pub fn write(&mut self, box_id: &str, tag: &str, value: Value, sync: bool) -> FreightResult<()> {
        check_ids(box_id, tag)?;
        if !value.is_map() {
            return Err(FreightError::Codec {
                reason: format!("top-level value must be a map, found {}", value.kind()),
            });
        }

        let old = self.read(box_id, tag)?;
        self.fields.update(box_id, tag, old.as_ref(), Some(&value));

        let key = buffer_key(box_id, tag);
        self.cache.put(key.clone(), value.clone());
        self.buffer.insert(
            key,
            BufferedEntry {
                box_id: box_id.to_string(),
                tag: tag.to_string(),
                value: Some(value),
            },
        );
        self.after_mutation(sync)
    }

    /// Stage a tombstone for (box, tag).
    pub fn remove_tag(&mut self, box_id: &str, tag: &str, sync: bool) -> FreightResult<()> {
        check_ids(box_id, tag)?;
        let old = self.read(box_id, tag)?;
        self.fields.update(box_id, tag, old.as_ref(), None);

        let key = buffer_key(box_id, tag);
        self.cache.remove(&key);
        self.buffer.insert(
            key,
            BufferedEntry {
                box_id: box_id.to_string(),
                tag: tag.to_string(),
                value: None,
            },
        );
        self.after_mutation(sync)
    }

    /// Tombstone every live tag of a box and drop the box from the indexes.
    pub fn remove_box(&mut self, box_id: &str, sync: bool) -> FreightResult<()> {
        check_box(box_id)?;
        let mut tags = self.index.tags(box_id);
        for entry in self.buffer.values() {
            if entry.box_id == box_id && entry.value.is_some() {
                tags.push(entry.tag.clone());
            }
        }
        tags.sort();
        tags.dedup();

        for tag in tags {
            let key = buffer_key(box_id, &tag);
            self.cache.remove(&key);
            self.buffer.insert(
                key,
                BufferedEntry {
                    box_id: box_id.to_string(),
                    tag,
                    value: None,
                },
            );
        }
        self.fields.remove_box(box_id);
        self.after_mutation(sync)
    }

    /// Append all entries inside one transaction envelope, durably flushed
    /// before return. A pending buffer is flushed first as its own envelope.
    pub fn batch(&mut self, box_id: &str, entries: BTreeMap<String, Value>) -> FreightResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        for (tag, value) in &entries {
            check_ids(box_id, tag)?;
            if !value.is_map() {
                return Err(FreightError::Codec {
                    reason: format!("top-level value must be a map, found {}", value.kind()),
                });
            }
        }

        if !self.buffer.is_empty() {
            self.flush()?;
        }

        for (tag, value) in entries {
            let old = self.read(box_id, &tag)?;
            self.fields.update(box_id, &tag, old.as_ref(), Some(&value));

            let key = buffer_key(box_id, &tag);
            self.cache.put(key.clone(), value.clone());
            self.buffer.insert(
                key,
                BufferedEntry {
                    box_id: box_id.to_string(),
                    tag,
                    value: Some(value),
                },
            );
        }
        self.flush()
    }

    /// Compare-and-swap on one field. Returns true and writes iff the
    /// current value's `field` entry deeply equals `expected`; otherwise
    /// returns false with no side effect.
    pub fn put_cas(
        &mut self,
        box_id: &str,
        tag: &str,
        value: Value,
        field: &str,
        expected: &Value,
        sync: bool,
    ) -> FreightResult<bool> {
        let current = match self.read(box_id, tag)? {
            Some(current) => current,
            None => return Ok(false),
        };
        match current.field(field) {
            Some(actual) if actual == expected => {
                self.write(box_id, tag, value, sync)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn after_mutation(&mut self, sync: bool) -> FreightResult<()> {
        if sync || self.buffer.len() >= self.config.flush_count_threshold {
            self.flush()
        } else {
            if self.flush_deadline.is_none() {
                self.flush_deadline = Some(Instant::now() + self.config.flush_interval);
            }
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Latest committed or buffered value, or `None`. Unreadable records
    /// (CRC mismatch, undecodable payload) read as absent with a warning.
    pub fn read(&mut self, box_id: &str, tag: &str) -> FreightResult<Option<Value>> {
        let key = buffer_key(box_id, tag);
        if let Some(entry) = self.buffer.get(&key) {
            return Ok(entry.value.clone());
        }
        if let Some(value) = self.cache.get(&key) {
            return Ok(Some(value.clone()));
        }

        let entry = match self.index.get(box_id, tag) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let value = match self.read_record(entry)? {
            Some(value) => value,
            None => return Ok(None),
        };
        self.cache.put(key, value.clone());
        Ok(Some(value))
    }

    /// Buffer-aware membership probe; never touches the data file.
    pub fn contains(&self, box_id: &str, tag: &str) -> bool {
        if let Some(entry) = self.buffer.get(&buffer_key(box_id, tag)) {
            return entry.value.is_some();
        }
        self.index.contains(box_id, tag)
    }

    /// All live tags of a box. Buffered tombstones hide indexed tags,
    /// buffered values override, buffered new tags appear.
    pub fn read_box(&mut self, box_id: &str) -> FreightResult<BTreeMap<String, Value>> {
        let mut out = BTreeMap::new();

        for tag in self.index.tags(box_id) {
            if self.buffer.contains_key(&buffer_key(box_id, &tag)) {
                continue; // buffered entries handled below
            }
            if let Some(value) = self.read(box_id, &tag)? {
                out.insert(tag, value);
            }
        }
        let buffered: Vec<(String, Option<Value>)> = self
            .buffer
            .values()
            .filter(|entry| entry.box_id == box_id)
            .map(|entry| (entry.tag.clone(), entry.value.clone()))
            .collect();
        for (tag, value) in buffered {
            if let Some(value) = value {
                out.insert(tag, value);
            }
        }
        Ok(out)
    }

    /// Values whose stored string at `field` starts with `prefix`.
    pub fn query(&mut self, box_id: &str, field: &str, prefix: &str) -> FreightResult<Vec<Value>> {
        let tags = self.fields.query_tags(box_id, field, prefix);
        let mut out = Vec::with_capacity(tags.len());
        for tag in tags {
            if let Some(value) = self.read(box_id, &tag)? {
                out.push(value);
            }
        }
        Ok(out)
    }

    /// Box ids in the index, excluding the reserved system box.
    pub fn boxes(&self) -> Vec<String> {
        let mut boxes: Vec<String> = self
            .index
            .boxes()
            .into_iter()
            .filter(|id| id != SYS_BOX)
            .collect();
        boxes.sort();
        boxes
    }

    fn read_record(&mut self, entry: IndexEntry) -> FreightResult<Option<Value>> {
        let block = self.read_block(entry.offset as u64, entry.len as usize)?;
        let record = match parse_record(&block) {
            Ok(record) => record,
            Err(RecordParseError::Crc { stored, computed }) => {
                let err = FreightError::Integrity {
                    path: self.data_path.clone(),
                    offset: entry.offset as u64,
                    expected: stored,
                    actual: computed,
                };
                warn!(truck = %self.id, error = %err, "record failed CRC validation, treating as absent");
                return Ok(None);
            }
            Err(e) => {
                warn!(truck = %self.id, offset = entry.offset, error = ?e, "unparseable record, treating as absent");
                return Ok(None);
            }
        };
        let data = match record.data {
            Some(data) => data,
            None => return Ok(None),
        };
        match decode_value(&data) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(truck = %self.id, offset = entry.offset, error = %e, "undecodable payload, treating as absent");
                Ok(None)
            }
        }
    }

    fn read_block(&mut self, offset: u64, len: usize) -> FreightResult<Vec<u8>> {
        let reader = self.reader.as_mut().ok_or_else(|| FreightError::NotInitialized {
            truck: self.id.clone(),
        })?;
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| io_err(&self.data_path, "seek data file", e))?;
        let mut block = vec![0u8; len];
        reader
            .read_exact(&mut block)
            .map_err(|e| io_err(&self.data_path, "read record block", e))?;
        Ok(block)
    }

    // -----------------------------------------------------------------------
    // Flush pipeline
    // -----------------------------------------------------------------------

    /// Serialize the write buffer as one transaction envelope, sync it, and
    /// apply the address updates. No-op on an empty buffer.
    pub fn flush(&mut self) -> FreightResult<()> {
        self.flush_deadline = None;
        if self.buffer.is_empty() {
            return Ok(());
        }

        let entries: Vec<BufferedEntry> = self.buffer.drain().map(|(_, entry)| entry).collect();
        let tx_id = TX_COUNTER.fetch_add(1, Ordering::Relaxed);

        let mut count_payload = BTreeMap::new();
        count_payload.insert("count".to_string(), Value::Int(entries.len() as i64));

        let mut batch = encode_record(
            SYS_BOX,
            &format!("{}{}", TX_START_PREFIX, tx_id),
            &encode_value(&Value::Map(count_payload)),
        )?;

        // (box, tag, offset, len) per data record, tombstones with len 0 data.
        let mut updates: Vec<(String, String, Option<IndexEntry>)> = Vec::with_capacity(entries.len());
        for entry in &entries {
            let data = entry.value.as_ref().map(encode_value);
            let record = encode_record(&entry.box_id, &entry.tag, data.as_deref().unwrap_or(&[]))?;
            let offset = self.data_len + batch.len() as u64;
            let update = entry.value.as_ref().map(|_| IndexEntry {
                offset: offset as u32,
                len: record.len() as u32,
            });
            updates.push((entry.box_id.clone(), entry.tag.clone(), update));
            batch.extend_from_slice(&record);
        }
        batch.extend_from_slice(&encode_record(
            SYS_BOX,
            &format!("{}{}", TX_COMMIT_PREFIX, tx_id),
            &[],
        )?);

        if let Err(e) = self.append_and_sync(&batch) {
            // The file may hold a partial envelope; the index never points
            // at it and recovery will skip it. Re-stage the entries so the
            // in-memory view stays ahead of disk.
            for entry in entries {
                self.buffer
                    .insert(buffer_key(&entry.box_id, &entry.tag), entry);
            }
            if let Ok(meta) = fs::metadata(&self.data_path) {
                self.data_len = meta.len();
            }
            return Err(e);
        }
        self.data_len += batch.len() as u64;

        let record_count = updates.len() as u64;
        for (box_id, tag, update) in updates {
            match update {
                Some(entry) => self.index.insert(&box_id, &tag, entry),
                None => self.index.remove(&box_id, &tag),
            }
        }
        self.dirty_since_save += record_count;
        self.ops_since_compact += record_count;
        debug!(truck = %self.id, tx = tx_id, records = record_count, "flushed envelope");

        self.run_maintenance();
        Ok(())
    }

    fn append_and_sync(&mut self, bytes: &[u8]) -> FreightResult<()> {
        let writer = self.writer.as_mut().ok_or_else(|| FreightError::NotInitialized {
            truck: self.id.clone(),
        })?;
        writer
            .write_all(bytes)
            .map_err(|e| io_err(&self.data_path, "append envelope", e))?;
        durable_sync(writer).map_err(|e| io_err(&self.data_path, "sync data file", e))?;
        Ok(())
    }

    fn run_maintenance(&mut self) {
        if self.dirty_since_save >= self.config.save_threshold {
            if let Err(e) = self.save_index() {
                warn!(truck = %self.id, error = %e, "background index save failed");
            }
        }
        if self.ops_since_compact >= self.config.compact_threshold {
            if let Err(e) = self.compact() {
                warn!(truck = %self.id, error = %e, "background compaction failed");
            }
        }
    }

    fn save_index(&mut self) -> FreightResult<()> {
        self.index.save(&self.index_path)?;
        self.dirty_since_save = 0;
        Ok(())
    }

    /// Flush, save the index, and drop the file handles.
    pub fn close(&mut self) -> FreightResult<()> {
        self.flush()?;
        self.save_index()?;
        self.writer = None;
        self.reader = None;
        debug!(truck = %self.id, "truck closed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Walk the data file from `start` to EOF, applying committed envelopes
    /// and standalone records. Anything unparseable advances one byte.
    fn recover(&mut self, start: u64) -> FreightResult<()> {
        let tail = self.read_tail(start)?;
        let mut pos = 0usize;
        let mut applied = 0u64;
        let mut skipped_bytes = 0u64;
        // Open envelope: (tx id, buffered address updates)
        let mut tx: Option<(u64, Vec<(String, String, Option<IndexEntry>)>)> = None;

        while pos < tail.len() {
            let record = match parse_record(&tail[pos..]) {
                Ok(record) => record,
                Err(_) => {
                    pos += 1;
                    skipped_bytes += 1;
                    continue;
                }
            };
            // Payload must decode before the record is classified.
            let value = match record.data.as_deref().map(decode_value).transpose() {
                Ok(value) => value,
                Err(_) => {
                    pos += 1;
                    skipped_bytes += 1;
                    continue;
                }
            };

            let abs = start + pos as u64;
            if record.box_id == SYS_BOX {
                if let Some(id) = record.tag.strip_prefix(TX_START_PREFIX) {
                    if let Ok(id) = id.parse::<u64>() {
                        tx = Some((id, Vec::new()));
                        pos += record.len;
                        continue;
                    }
                } else if let Some(id) = record.tag.strip_prefix(TX_COMMIT_PREFIX) {
                    if let Ok(id) = id.parse::<u64>() {
                        match tx.take() {
                            Some((open_id, updates)) if open_id == id => {
                                for (box_id, tag, update) in updates {
                                    match update {
                                        Some(entry) => self.index.insert(&box_id, &tag, entry),
                                        None => self.index.remove(&box_id, &tag),
                                    }
                                    applied += 1;
                                }
                            }
                            Some((open_id, updates)) => {
                                warn!(
                                    truck = %self.id,
                                    open = open_id,
                                    commit = id,
                                    records = updates.len(),
                                    "commit id does not match open envelope, discarding"
                                );
                            }
                            // A lone commit marker is the normal tail of a
                            // flushed file whose index already covers the
                            // envelope's records.
                            None => {}
                        }
                        pos += record.len;
                        continue;
                    }
                }
                // System record with an unparseable id: skip the record.
                pos += record.len;
                continue;
            }

            let update = value.map(|_| IndexEntry {
                offset: abs as u32,
                len: record.len as u32,
            });
            match tx.as_mut() {
                Some((_, updates)) => updates.push((record.box_id, record.tag, update)),
                None => {
                    match update {
                        Some(entry) => self.index.insert(&record.box_id, &record.tag, entry),
                        None => self.index.remove(&record.box_id, &record.tag),
                    }
                    applied += 1;
                }
            }
            pos += record.len;
        }

        if let Some((id, updates)) = tx {
            warn!(truck = %self.id, tx = id, records = updates.len(), "uncommitted envelope at tail, discarding");
        }
        if skipped_bytes > 0 {
            warn!(truck = %self.id, skipped_bytes, "recovery skipped unreadable bytes");
        }
        info!(truck = %self.id, start_offset = start, applied, "recovery scan complete");
        self.save_index()
    }

    fn read_tail(&mut self, start: u64) -> FreightResult<Vec<u8>> {
        let reader = self.reader.as_mut().ok_or_else(|| FreightError::NotInitialized {
            truck: self.id.clone(),
        })?;
        reader
            .seek(SeekFrom::Start(start))
            .map_err(|e| io_err(&self.data_path, "seek recovery tail", e))?;
        let mut tail = Vec::new();
        reader
            .read_to_end(&mut tail)
            .map_err(|e| io_err(&self.data_path, "read recovery tail", e))?;
        Ok(tail)
    }

    fn rebuild_field_index(&mut self) -> FreightResult<()> {
        self.fields.clear();
        let keys: Vec<(String, String)> = self
            .index
            .iter()
            .map(|(box_id, tag, _)| (box_id.to_string(), tag.to_string()))
            .collect();
        for (box_id, tag) in keys {
            if let Some(value) = self.read(&box_id, &tag)? {
                self.fields.update(&box_id, &tag, None, Some(&value));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Compaction
    // -----------------------------------------------------------------------

    /// Rewrite the data file to contain only the latest live records, then
    /// atomically swap it in with crash-safe backups.
    pub fn compact(&mut self) -> FreightResult<()> {
        if !self.buffer.is_empty() {
            self.flush()?;
        }
        let before = self.data_len;

        let dir = self.data_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let temp_dat = dir.join(format!("{}_temp.dat", self.id));
        let temp_idx = dir.join(format!("{}_temp.idx", self.id));
        let bak_dat = dir.join(format!("{}_bak.dat", self.id));
        let bak_idx = dir.join(format!("{}_bak.idx", self.id));

        // Build the rewritten file; any failure here leaves the live files
        // untouched.
        let build = self.build_compacted(&temp_dat, &temp_idx);
        let (fresh, new_len) = match build {
            Ok(result) => result,
            Err(e) => {
                let _ = fs::remove_file(&temp_dat);
                let _ = fs::remove_file(&temp_idx);
                return Err(e);
            }
        };

        // Swap. Handles must be closed around the renames.
        self.writer = None;
        self.reader = None;
        let had_index = self.index_path.exists();
        let swap = (|| -> FreightResult<()> {
            fs::rename(&self.data_path, &bak_dat)
                .map_err(|e| io_err(&self.data_path, "back up data file", e))?;
            if had_index {
                fs::rename(&self.index_path, &bak_idx)
                    .map_err(|e| io_err(&self.index_path, "back up index", e))?;
            }
            fs::rename(&temp_dat, &self.data_path)
                .map_err(|e| io_err(&temp_dat, "install compacted data file", e))?;
            fs::rename(&temp_idx, &self.index_path)
                .map_err(|e| io_err(&temp_idx, "install compacted index", e))?;
            Ok(())
        })();

        if let Err(e) = swap {
            warn!(truck = %self.id, error = %e, "compaction swap failed, restoring backups");
            if !self.data_path.exists() && bak_dat.exists() {
                let _ = fs::rename(&bak_dat, &self.data_path);
            }
            if had_index && !self.index_path.exists() && bak_idx.exists() {
                let _ = fs::rename(&bak_idx, &self.index_path);
            }
            let _ = fs::remove_file(&temp_dat);
            let _ = fs::remove_file(&temp_idx);
            self.reopen()?;
            return Err(e);
        }

        self.index = fresh;
        self.cache.clear();
        self.reopen()?;
        debug_assert_eq!(self.data_len, new_len);
        let _ = fs::remove_file(&bak_dat);
        let _ = fs::remove_file(&bak_idx);
        self.ops_since_compact = 0;
        self.dirty_since_save = 0;

        info!(truck = %self.id, before, after = new_len, "compaction complete");
        Ok(())
    }

    fn build_compacted(
        &mut self,
        temp_dat: &Path,
        temp_idx: &Path,
    ) -> FreightResult<(OffsetIndex, u64)> {
        let mut temp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(temp_dat)
            .map_err(|e| io_err(temp_dat, "create temp data file", e))?;

        let mut fresh = OffsetIndex::new();
        let mut pos = 0u64;
        let keys: Vec<(String, String)> = self
            .index
            .iter()
            .map(|(box_id, tag, _)| (box_id.to_string(), tag.to_string()))
            .collect();

        for (box_id, tag) in keys {
            let value = match self.read(&box_id, &tag)? {
                Some(value) => value,
                None => continue, // unreadable or tombstoned under our feet
            };
            let record = encode_record(&box_id, &tag, &encode_value(&value))?;
            temp.write_all(&record)
                .map_err(|e| io_err(temp_dat, "write compacted record", e))?;
            fresh.insert(
                &box_id,
                &tag,
                IndexEntry {
                    offset: pos as u32,
                    len: record.len() as u32,
                },
            );
            pos += record.len() as u64;
        }

        durable_sync(&temp).map_err(|e| io_err(temp_dat, "sync temp data file", e))?;
        drop(temp);
        fresh.save(temp_idx)?;
        Ok((fresh, pos))
    }

    fn reopen(&mut self) -> FreightResult<()> {
        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.data_path)
            .map_err(|e| io_err(&self.data_path, "reopen data file", e))?;
        let reader =
            File::open(&self.data_path).map_err(|e| io_err(&self.data_path, "reopen data reader", e))?;
        self.data_len = writer
            .metadata()
            .map_err(|e| io_err(&self.data_path, "stat data file", e))?
            .len();
        self.writer = Some(writer);
        self.reader = Some(reader);
        Ok(())
    }

    /// Data file length in bytes.
    pub fn data_len(&self) -> u64 {
        self.data_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_record_v1;
    use crate::value_map;
    use tempfile::TempDir;

    fn test_truck(dir: &TempDir) -> Truck {
        Truck::open(dir.path(), "t", Config::default()).unwrap()
    }

    #[test]
    fn test_put_get() {
        let dir = TempDir::new().unwrap();
        let mut truck = test_truck(&dir);

        let v = value_map! { "name" => "Alice", "age" => 30i64 };
        truck.write("users", "u1", v.clone(), false).unwrap();
        assert_eq!(truck.read("users", "u1").unwrap(), Some(v.clone()));

        truck.flush().unwrap();
        assert_eq!(truck.read("users", "u1").unwrap(), Some(v));
    }

    #[test]
    fn test_non_map_value_rejected() {
        let dir = TempDir::new().unwrap();
        let mut truck = test_truck(&dir);
        assert!(matches!(
            truck.write("users", "u1", Value::Int(1), false),
            Err(FreightError::Codec { .. })
        ));
    }

    #[test]
    fn test_reserved_box_rejected() {
        let dir = TempDir::new().unwrap();
        let mut truck = test_truck(&dir);
        assert!(truck.write(SYS_BOX, "t", value_map! { "v" => 1i64 }, false).is_err());
        assert!(truck.remove_box(SYS_BOX, false).is_err());
    }

    #[test]
    fn test_sync_write_survives_crash() {
        let dir = TempDir::new().unwrap();
        let v = value_map! { "durable" => true };
        {
            let mut truck = test_truck(&dir);
            truck.write("users", "u1", v.clone(), true).unwrap();
            // No close: simulated process kill. The index snapshot was never
            // saved, so reopen must replay the envelope.
        }
        let mut truck = test_truck(&dir);
        assert_eq!(truck.read("users", "u1").unwrap(), Some(v));
    }

    #[test]
    fn test_unsynced_buffer_lost_on_crash() {
        let dir = TempDir::new().unwrap();
        {
            let mut truck = test_truck(&dir);
            truck
                .write("users", "u1", value_map! { "v" => 1i64 }, false)
                .unwrap();
        }
        let mut truck = test_truck(&dir);
        assert_eq!(truck.read("users", "u1").unwrap(), None);
    }

    #[test]
    fn test_delete_shadows_and_persists() {
        let dir = TempDir::new().unwrap();
        let mut truck = test_truck(&dir);

        truck
            .write("users", "u1", value_map! { "v" => 1i64 }, true)
            .unwrap();
        truck.remove_tag("users", "u1", false).unwrap();
        assert_eq!(truck.read("users", "u1").unwrap(), None);
        assert!(!truck.contains("users", "u1"));

        truck.flush().unwrap();
        assert_eq!(truck.read("users", "u1").unwrap(), None);

        truck.close().unwrap();
        let mut truck = test_truck(&dir);
        assert_eq!(truck.read("users", "u1").unwrap(), None);
    }

    #[test]
    fn test_overwrite_returns_latest() {
        let dir = TempDir::new().unwrap();
        let mut truck = test_truck(&dir);

        truck.write("k", "t", value_map! { "v" => 1i64 }, true).unwrap();
        truck.write("k", "t", value_map! { "v" => 2i64 }, true).unwrap();
        assert_eq!(
            truck.read("k", "t").unwrap(),
            Some(value_map! { "v" => 2i64 })
        );
    }

    #[test]
    fn test_read_box_applies_buffer_shadowing() {
        let dir = TempDir::new().unwrap();
        let mut truck = test_truck(&dir);

        truck.write("b", "flushed", value_map! { "v" => 1i64 }, false).unwrap();
        truck.write("b", "doomed", value_map! { "v" => 2i64 }, false).unwrap();
        truck.flush().unwrap();

        truck.remove_tag("b", "doomed", false).unwrap();
        truck.write("b", "fresh", value_map! { "v" => 3i64 }, false).unwrap();
        truck.write("b", "flushed", value_map! { "v" => 10i64 }, false).unwrap();

        let snapshot = truck.read_box("b").unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["flushed"], value_map! { "v" => 10i64 });
        assert_eq!(snapshot["fresh"], value_map! { "v" => 3i64 });
        assert!(!snapshot.contains_key("doomed"));
    }

    #[test]
    fn test_cas_success_then_miss() {
        let dir = TempDir::new().unwrap();
        let mut truck = test_truck(&dir);

        truck.write("k", "t", value_map! { "ver" => 1i64 }, false).unwrap();
        assert!(truck
            .put_cas("k", "t", value_map! { "ver" => 2i64 }, "ver", &Value::Int(1), false)
            .unwrap());
        assert!(!truck
            .put_cas("k", "t", value_map! { "ver" => 3i64 }, "ver", &Value::Int(1), false)
            .unwrap());
        assert_eq!(
            truck.read("k", "t").unwrap(),
            Some(value_map! { "ver" => 2i64 })
        );
    }

    #[test]
    fn test_cas_on_absent_tag_and_field() {
        let dir = TempDir::new().unwrap();
        let mut truck = test_truck(&dir);

        assert!(!truck
            .put_cas("k", "ghost", value_map! { "v" => 1i64 }, "v", &Value::Null, false)
            .unwrap());

        truck.write("k", "t", value_map! { "other" => 1i64 }, false).unwrap();
        assert!(!truck
            .put_cas("k", "t", value_map! { "v" => 1i64 }, "v", &Value::Null, false)
            .unwrap());
    }

    #[test]
    fn test_batch_durable_without_close() {
        let dir = TempDir::new().unwrap();
        {
            let mut truck = test_truck(&dir);
            let mut entries = BTreeMap::new();
            entries.insert("a".to_string(), value_map! { "v" => 1i64 });
            entries.insert("b".to_string(), value_map! { "v" => 2i64 });
            entries.insert("c".to_string(), value_map! { "v" => 3i64 });
            truck.batch("batched", entries).unwrap();
        }
        let mut truck = test_truck(&dir);
        assert_eq!(truck.read_box("batched").unwrap().len(), 3);
    }

    #[test]
    fn test_torn_batch_applies_nothing() {
        let dir = TempDir::new().unwrap();
        // An envelope with two records but no commit marker, as a crash
        // mid-batch would leave it.
        {
            let mut count = BTreeMap::new();
            count.insert("count".to_string(), Value::Int(3));
            let mut bytes =
                encode_record(SYS_BOX, "TX_START_7", &encode_value(&Value::Map(count)))
                    .unwrap();
            for tag in ["a", "b"] {
                let data = encode_value(&value_map! { "v" => 1i64 });
                bytes.extend_from_slice(&encode_record("b", tag, &data).unwrap());
            }
            fs::write(dir.path().join("t.dat"), &bytes).unwrap();
        }

        let mut truck = test_truck(&dir);
        assert_eq!(truck.read("b", "a").unwrap(), None);
        assert_eq!(truck.read("b", "b").unwrap(), None);
        assert_eq!(truck.read("b", "c").unwrap(), None);
    }

    #[test]
    fn test_committed_envelope_recovers_fully() {
        let dir = TempDir::new().unwrap();
        {
            let mut truck = test_truck(&dir);
            let mut entries = BTreeMap::new();
            for i in 0..5i64 {
                entries.insert(format!("t{}", i), value_map! { "v" => i });
            }
            truck.batch("b", entries).unwrap();
            // simulated kill: no close, no index save
        }
        let mut truck = test_truck(&dir);
        let snapshot = truck.read_box("b").unwrap();
        assert_eq!(snapshot.len(), 5);
        assert_eq!(snapshot["t3"], value_map! { "v" => 3i64 });
    }

    #[test]
    fn test_recovery_skips_trailing_garbage() {
        let dir = TempDir::new().unwrap();
        let v = value_map! { "keep" => true };
        {
            let mut truck = test_truck(&dir);
            truck.write("users", "u1", v.clone(), true).unwrap();
            truck.close().unwrap();
        }
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join("t.dat"))
                .unwrap();
            file.write_all(&[0xA5; 137]).unwrap();
        }
        let mut truck = test_truck(&dir);
        assert_eq!(truck.read("users", "u1").unwrap(), Some(v));
        assert_eq!(truck.boxes(), ["users"]);
    }

    #[test]
    fn test_corrupted_record_reads_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.dat");
        {
            let mut truck = test_truck(&dir);
            truck
                .write("users", "u1", value_map! { "name" => "Alice" }, true)
                .unwrap();
            truck.close().unwrap();
        }
        // Flip one byte in the payload region of the stored record.
        {
            let mut bytes = fs::read(&path).unwrap();
            let at = bytes.windows(5).position(|w| w == b"Alice").unwrap();
            bytes[at] ^= 0xFF;
            fs::write(&path, &bytes).unwrap();
        }
        let mut truck = test_truck(&dir);
        assert_eq!(truck.read("users", "u1").unwrap(), None);
    }

    #[test]
    fn test_legacy_v1_records_applied() {
        let dir = TempDir::new().unwrap();
        let v = value_map! { "legacy" => true };
        {
            let data = encode_value(&v);
            let mut bytes = encode_record_v1("old", "t1", &data);
            bytes.extend_from_slice(&encode_record_v1("old", "t2", &data));
            // v1 tombstone for t2
            bytes.extend_from_slice(&encode_record_v1("old", "t2", &[]));
            fs::write(dir.path().join("t.dat"), &bytes).unwrap();
        }
        let mut truck = test_truck(&dir);
        assert_eq!(truck.read("old", "t1").unwrap(), Some(v));
        assert_eq!(truck.read("old", "t2").unwrap(), None);
    }

    #[test]
    fn test_remove_box() {
        let dir = TempDir::new().unwrap();
        let mut truck = test_truck(&dir);

        truck.write("a", "t1", value_map! { "v" => 1i64 }, false).unwrap();
        truck.write("a", "t2", value_map! { "v" => 2i64 }, true).unwrap();
        truck.write("keep", "t", value_map! { "v" => 3i64 }, true).unwrap();

        truck.remove_box("a", true).unwrap();
        assert_eq!(truck.read("a", "t1").unwrap(), None);
        assert_eq!(truck.read("a", "t2").unwrap(), None);
        assert_eq!(truck.boxes(), ["keep"]);
        assert!(truck.read_box("a").unwrap().is_empty());
    }

    #[test]
    fn test_query_after_reopen_rebuilds_field_index() {
        let dir = TempDir::new().unwrap();
        {
            let mut truck = test_truck(&dir);
            truck.write("users", "u1", value_map! { "name" => "Alice" }, false).unwrap();
            truck.write("users", "u2", value_map! { "name" => "Alba" }, false).unwrap();
            truck.write("users", "u3", value_map! { "name" => "Bob" }, false).unwrap();
            truck.close().unwrap();
        }
        let mut truck = test_truck(&dir);
        let hits = truck.query("users", "name", "Al").unwrap();
        assert_eq!(hits.len(), 2);
        assert!(truck.query("users", "name", "Bo").unwrap().len() == 1);
    }

    #[test]
    fn test_query_sees_buffered_overwrites() {
        let dir = TempDir::new().unwrap();
        let mut truck = test_truck(&dir);

        truck.write("users", "u1", value_map! { "name" => "Alice" }, true).unwrap();
        truck.write("users", "u1", value_map! { "name" => "Zoe" }, false).unwrap();

        assert!(truck.query("users", "name", "Al").unwrap().is_empty());
        assert_eq!(truck.query("users", "name", "Zo").unwrap().len(), 1);
    }

    #[test]
    fn test_compact_shrinks_and_preserves() {
        let dir = TempDir::new().unwrap();
        let mut truck = test_truck(&dir);

        for i in 0..100i64 {
            let tag = format!("t{}", i);
            for round in 0..3i64 {
                truck
                    .write("churn", &tag, value_map! { "round" => round, "i" => i }, false)
                    .unwrap();
            }
        }
        for i in 0..50i64 {
            truck.remove_tag("churn", &format!("t{}", i), false).unwrap();
        }
        truck.flush().unwrap();
        let before = truck.data_len();

        truck.compact().unwrap();
        assert!(truck.data_len() < before);

        let snapshot = truck.read_box("churn").unwrap();
        assert_eq!(snapshot.len(), 50);
        for i in 50..100i64 {
            assert_eq!(
                snapshot[&format!("t{}", i)],
                value_map! { "round" => 2i64, "i" => i }
            );
        }

        // Backups and temp files are gone.
        assert!(!dir.path().join("t_bak.dat").exists());
        assert!(!dir.path().join("t_temp.dat").exists());

        // The truck keeps accepting writes on the reopened handle.
        truck.write("churn", "new", value_map! { "v" => 1i64 }, true).unwrap();
        assert!(truck.read("churn", "new").unwrap().is_some());
    }

    #[test]
    fn test_compact_then_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut truck = test_truck(&dir);
            for i in 0..20i64 {
                truck.write("b", &format!("t{}", i), value_map! { "v" => i }, false).unwrap();
            }
            truck.flush().unwrap();
            truck.remove_tag("b", "t0", true).unwrap();
            truck.compact().unwrap();
            truck.close().unwrap();
        }
        let mut truck = test_truck(&dir);
        assert_eq!(truck.read_box("b").unwrap().len(), 19);
        assert_eq!(truck.read("b", "t7").unwrap(), Some(value_map! { "v" => 7i64 }));
    }

    #[test]
    fn test_flush_count_threshold_triggers() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.flush_count_threshold = 3;
        let mut truck = Truck::open(dir.path(), "t", config).unwrap();

        truck.write("b", "t1", value_map! { "v" => 1i64 }, false).unwrap();
        truck.write("b", "t2", value_map! { "v" => 2i64 }, false).unwrap();
        assert!(truck.flush_deadline().is_some());
        truck.write("b", "t3", value_map! { "v" => 3i64 }, false).unwrap();

        // Third write crossed the threshold and flushed inline.
        assert!(truck.flush_deadline().is_none());
        assert!(truck.data_len() > 0);
    }

    #[test]
    fn test_auto_compact_after_churn() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.compact_threshold = 40;
        config.flush_count_threshold = 10;
        let mut truck = Truck::open(dir.path(), "t", config).unwrap();

        for round in 0..6i64 {
            for i in 0..10i64 {
                truck
                    .write("b", &format!("t{}", i), value_map! { "round" => round }, false)
                    .unwrap();
            }
        }
        truck.flush().unwrap();

        // Six rounds of ten records with a threshold of forty: compaction
        // ran at least once, so the file holds far fewer than 60 records.
        let live = truck.read_box("b").unwrap();
        assert_eq!(live.len(), 10);
        let one_record = encode_record("b", "t0", &encode_value(&value_map! { "round" => 5i64 }))
            .unwrap()
            .len() as u64;
        assert!(truck.data_len() < one_record * 60);
    }

    #[test]
    fn test_boxes_sorted_and_exclude_sys() {
        let dir = TempDir::new().unwrap();
        let mut truck = test_truck(&dir);
        truck.write("zebra", "t", value_map! { "v" => 1i64 }, false).unwrap();
        truck.write("apple", "t", value_map! { "v" => 2i64 }, false).unwrap();
        truck.flush().unwrap();

        assert_eq!(truck.boxes(), ["apple", "zebra"]);
    }
}
