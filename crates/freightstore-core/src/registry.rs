//! Multi-truck front-end.
//!
//! A FreightStore multiplexes many trucks inside one process: it spawns a
//! worker per truck on demand, keeps at most `max_active_trucks` of them
//! alive in least-recently-resolved order, layers a store-wide value cache
//! over the per-truck read paths, applies the value envelope, and publishes
//! every mutation on the change bus.
//!
//! The store's own state sits behind one mutex that is never held across a
//! worker round-trip; correctness of reads never depends on the cache,
//! which a miss simply routes through the owning truck.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::Lru;
use crate::config::Config;
use crate::envelope::{Cipher, EnvelopeHandler, Unwrapped};
use crate::error::{io_err, FreightResult};
use crate::events::{Broadcaster, ChangeEvent};
use crate::value::Value;
use crate::worker::{TruckWorker, WorkerClient};

type CacheKey = (String, String, String);

fn cache_key(truck: &str, box_id: &str, tag: &str) -> CacheKey {
    (truck.to_string(), box_id.to_string(), tag.to_string())
}

/// Per-write envelope options for [`FreightStore::put_with_options`].
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Run the value through the installed cipher
    pub encrypt: bool,
    /// Expire the value this long after the write
    pub ttl: Option<chrono::Duration>,
    /// Await a durable flush before returning
    pub sync: bool,
}

struct Inner {
    active: HashMap<String, TruckWorker>,
    /// Truck ids, least recently resolved first
    recency: Vec<String>,
    cache: Lru<CacheKey, Value>,
}

/// The multi-truck store front-end.
pub struct FreightStore {
    root: PathBuf,
    config: Config,
    inner: Mutex<Inner>,
    bus: Broadcaster,
    envelope: EnvelopeHandler,
}

impl FreightStore {
    /// Open a store rooted at `root`, creating the directory and probing it
    /// for write permission.
    pub fn open(root: impl AsRef<Path>, config: Config) -> FreightResult<Self> {
        config.validate().map_err(|reason| crate::error::FreightError::Io {
            path: None,
            kind: std::io::ErrorKind::InvalidInput,
            message: reason,
        })?;
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| io_err(&root, "create store root", e))?;
        probe_writable(&root)?;

        Ok(Self {
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                recency: Vec::new(),
                cache: Lru::new(config.store_cache_capacity),
            }),
            bus: Broadcaster::new(config.subscriber_queue_depth),
            envelope: EnvelopeHandler::default(),
            root,
            config,
        })
    }

    /// Install the cipher the envelope delegates encryption to.
    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.envelope = EnvelopeHandler::new(Some(cipher));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Subscribe to the change bus.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        self.bus.subscribe()
    }

    /// Resolve a truck to a live worker, spawning or evicting as needed.
    fn resolve(&self, truck: &str) -> FreightResult<WorkerClient> {
        let mut inner = self.inner.lock();
        if let Some(worker) = inner.active.get(truck) {
            let client = worker.client();
            if let Some(at) = inner.recency.iter().position(|id| id == truck) {
                let id = inner.recency.remove(at);
                inner.recency.push(id);
            }
            return Ok(client);
        }

        if inner.active.len() >= self.config.max_active_trucks && !inner.recency.is_empty() {
            let victim = inner.recency.remove(0);
            if let Some(mut worker) = inner.active.remove(&victim) {
                debug!(truck = %victim, "evicting least-recently-resolved worker");
                if let Err(e) = worker.close() {
                    warn!(truck = %victim, error = %e, "evicted worker close failed");
                }
            }
        }

        let worker = TruckWorker::spawn(&self.root, truck, self.config.clone())?;
        let client = worker.client();
        inner.active.insert(truck.to_string(), worker);
        inner.recency.push(truck.to_string());
        Ok(client)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Store a value. Publishes PUT for a fresh tag and UPDATE otherwise,
    /// classified best-effort against the store cache.
    pub fn put(
        &self,
        truck: &str,
        box_id: &str,
        tag: &str,
        value: Value,
        sync: bool,
    ) -> FreightResult<()> {
        self.put_stored(truck, box_id, tag, value, sync)
    }

    /// Store a value wrapped in the envelope: optional encryption and TTL.
    pub fn put_with_options(
        &self,
        truck: &str,
        box_id: &str,
        tag: &str,
        value: Value,
        options: WriteOptions,
    ) -> FreightResult<()> {
        let stored = self.envelope.wrap(value, options.encrypt, options.ttl)?;
        self.put_stored(truck, box_id, tag, stored, options.sync)
    }

    fn put_stored(
        &self,
        truck: &str,
        box_id: &str,
        tag: &str,
        stored: Value,
        sync: bool,
    ) -> FreightResult<()> {
        let client = self.resolve(truck)?;
        let key = cache_key(truck, box_id, tag);
        let is_update = self.inner.lock().cache.contains(&key);

        client.write(box_id, tag, stored.clone(), sync)?;
        self.inner.lock().cache.put(key, stored.clone());

        let (truck, box_id, tag) = (truck.to_string(), box_id.to_string(), tag.to_string());
        self.bus.publish(if is_update {
            ChangeEvent::Update { truck, box_id, tag, value: stored }
        } else {
            ChangeEvent::Put { truck, box_id, tag, value: stored }
        });
        Ok(())
    }

    /// Fire-and-forget put: returns once the worker has queued the write.
    pub fn put_nowait(&self, truck: &str, box_id: &str, tag: &str, value: Value) -> FreightResult<()> {
        let client = self.resolve(truck)?;
        let key = cache_key(truck, box_id, tag);
        let is_update = self.inner.lock().cache.contains(&key);

        client.write_nowait(box_id, tag, value.clone())?;
        self.inner.lock().cache.put(key, value.clone());

        let (truck, box_id, tag) = (truck.to_string(), box_id.to_string(), tag.to_string());
        self.bus.publish(if is_update {
            ChangeEvent::Update { truck, box_id, tag, value }
        } else {
            ChangeEvent::Put { truck, box_id, tag, value }
        });
        Ok(())
    }

    /// Compare-and-swap on one field of the current value. Publishes
    /// CAS_UPDATE only when the swap wins.
    pub fn put_cas(
        &self,
        truck: &str,
        box_id: &str,
        tag: &str,
        value: Value,
        field: &str,
        expected: Value,
        sync: bool,
    ) -> FreightResult<bool> {
        let client = self.resolve(truck)?;
        let won = client.put_cas(box_id, tag, value.clone(), field, expected, sync)?;
        if won {
            self.inner
                .lock()
                .cache
                .put(cache_key(truck, box_id, tag), value.clone());
            self.bus.publish(ChangeEvent::CasUpdate {
                truck: truck.to_string(),
                box_id: box_id.to_string(),
                tag: tag.to_string(),
                value,
            });
        }
        Ok(won)
    }

    /// Append all entries inside one transaction envelope, durably flushed
    /// before return.
    pub fn batch(
        &self,
        truck: &str,
        box_id: &str,
        entries: BTreeMap<String, Value>,
    ) -> FreightResult<()> {
        let client = self.resolve(truck)?;
        client.batch(box_id, entries.clone())?;

        {
            let mut inner = self.inner.lock();
            for (tag, value) in &entries {
                inner
                    .cache
                    .put(cache_key(truck, box_id, tag), value.clone());
            }
        }
        self.bus.publish(ChangeEvent::Batch {
            truck: truck.to_string(),
            box_id: box_id.to_string(),
            entries,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Latest value for (truck, box, tag), unwrapping the envelope. An
    /// expired value reads as absent and its tag is lazily deleted.
    pub fn get(&self, truck: &str, box_id: &str, tag: &str) -> FreightResult<Option<Value>> {
        let key = cache_key(truck, box_id, tag);
        let cached = self.inner.lock().cache.get(&key).cloned();
        let stored = match cached {
            Some(stored) => Some(stored),
            None => {
                let client = self.resolve(truck)?;
                let read = client.read(box_id, tag)?;
                if let Some(stored) = &read {
                    self.inner.lock().cache.put(key.clone(), stored.clone());
                }
                read
            }
        };
        let Some(stored) = stored else {
            return Ok(None);
        };

        match self.envelope.unwrap(stored)? {
            Unwrapped::Value(value) => Ok(Some(value)),
            Unwrapped::Expired => {
                self.inner.lock().cache.remove(&key);
                let client = self.resolve(truck)?;
                if let Err(e) = client.remove_tag_nowait(box_id, tag) {
                    warn!(truck, box_id, tag, error = %e, "lazy expiry delete failed");
                }
                self.bus.publish(ChangeEvent::Delete {
                    truck: truck.to_string(),
                    box_id: box_id.to_string(),
                    tag: tag.to_string(),
                });
                Ok(None)
            }
        }
    }

    /// All live tags of a box, envelopes unwrapped, expired tags skipped
    /// and lazily deleted.
    pub fn get_box(&self, truck: &str, box_id: &str) -> FreightResult<BTreeMap<String, Value>> {
        let client = self.resolve(truck)?;
        let snapshot = client.read_box(box_id)?;

        let mut out = BTreeMap::new();
        for (tag, stored) in snapshot {
            match self.envelope.unwrap(stored)? {
                Unwrapped::Value(value) => {
                    out.insert(tag, value);
                }
                Unwrapped::Expired => {
                    self.inner.lock().cache.remove(&cache_key(truck, box_id, &tag));
                    if let Err(e) = client.remove_tag_nowait(box_id, &tag) {
                        warn!(truck, box_id, tag = %tag, error = %e, "lazy expiry delete failed");
                    }
                }
            }
        }
        Ok(out)
    }

    /// Values whose stored string at `field` starts with `prefix`. Expired
    /// envelopes are skipped.
    pub fn query(
        &self,
        truck: &str,
        box_id: &str,
        field: &str,
        prefix: &str,
    ) -> FreightResult<Vec<Value>> {
        let client = self.resolve(truck)?;
        let mut out = Vec::new();
        for stored in client.query(box_id, field, prefix)? {
            if let Unwrapped::Value(value) = self.envelope.unwrap(stored)? {
                out.push(value);
            }
        }
        Ok(out)
    }

    /// Buffer-aware membership probe.
    pub fn contains(&self, truck: &str, box_id: &str, tag: &str) -> FreightResult<bool> {
        self.resolve(truck)?.contains(box_id, tag)
    }

    /// Box ids of a truck, excluding the reserved system box.
    pub fn boxes(&self, truck: &str) -> FreightResult<Vec<String>> {
        self.resolve(truck)?.boxes()
    }

    // -----------------------------------------------------------------------
    // Deletes
    // -----------------------------------------------------------------------

    pub fn delete(&self, truck: &str, box_id: &str, tag: &str, sync: bool) -> FreightResult<()> {
        let client = self.resolve(truck)?;
        client.remove_tag(box_id, tag, sync)?;
        self.finish_delete(truck, box_id, tag);
        Ok(())
    }

    pub fn delete_nowait(&self, truck: &str, box_id: &str, tag: &str) -> FreightResult<()> {
        let client = self.resolve(truck)?;
        client.remove_tag_nowait(box_id, tag)?;
        self.finish_delete(truck, box_id, tag);
        Ok(())
    }

    fn finish_delete(&self, truck: &str, box_id: &str, tag: &str) {
        self.inner.lock().cache.remove(&cache_key(truck, box_id, tag));
        self.bus.publish(ChangeEvent::Delete {
            truck: truck.to_string(),
            box_id: box_id.to_string(),
            tag: tag.to_string(),
        });
    }

    /// Delete every tag of a box. Invalidates the whole store cache, which
    /// is cheaper than tag-wise eviction and safe because reads fall
    /// through to the truck.
    pub fn delete_box(&self, truck: &str, box_id: &str, sync: bool) -> FreightResult<()> {
        let client = self.resolve(truck)?;
        client.remove_box(box_id, sync)?;
        self.finish_delete_box(truck, box_id);
        Ok(())
    }

    pub fn delete_box_nowait(&self, truck: &str, box_id: &str) -> FreightResult<()> {
        let client = self.resolve(truck)?;
        client.remove_box_nowait(box_id)?;
        self.finish_delete_box(truck, box_id);
        Ok(())
    }

    fn finish_delete_box(&self, truck: &str, box_id: &str) {
        self.inner.lock().cache.clear();
        self.bus.publish(ChangeEvent::DeleteBox {
            truck: truck.to_string(),
            box_id: box_id.to_string(),
        });
    }

    /// Close the truck's worker and remove both of its files from disk.
    pub fn delete_truck(&self, truck: &str) -> FreightResult<()> {
        let worker = {
            let mut inner = self.inner.lock();
            inner.recency.retain(|id| id != truck);
            inner.cache.retain(|key| key.0 != truck);
            inner.active.remove(truck)
        };
        if let Some(mut worker) = worker {
            if let Err(e) = worker.close() {
                warn!(truck, error = %e, "worker close before truck delete failed");
            }
        }
        for name in [format!("{}.dat", truck), format!("{}.idx", truck)] {
            let path = self.root.join(name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(&path, "remove truck file", e)),
            }
        }
        Ok(())
    }

    /// Close every worker, clear the caches, and reset the root directory.
    pub fn delete_all(&self) -> FreightResult<()> {
        self.shutdown_workers();
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&self.root, "reset store root", e)),
        }
        fs::create_dir_all(&self.root).map_err(|e| io_err(&self.root, "recreate store root", e))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Maintenance and lifecycle
    // -----------------------------------------------------------------------

    pub fn compact(&self, truck: &str) -> FreightResult<()> {
        self.resolve(truck)?.compact()
    }

    /// Flush and close every active worker.
    pub fn close(&self) -> FreightResult<()> {
        let mut first_error = None;
        for (id, mut worker) in self.drain_workers() {
            if let Err(e) = worker.close() {
                warn!(truck = %id, error = %e, "worker close failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn shutdown_workers(&self) {
        for (id, mut worker) in self.drain_workers() {
            if let Err(e) = worker.close() {
                warn!(truck = %id, error = %e, "worker close failed");
            }
        }
    }

    fn drain_workers(&self) -> Vec<(String, TruckWorker)> {
        let mut inner = self.inner.lock();
        inner.recency.clear();
        inner.cache.clear();
        inner.active.drain().collect()
    }

    // -----------------------------------------------------------------------
    // Watch streams
    // -----------------------------------------------------------------------

    /// Stream of values for one tag: the current value first, then a fresh
    /// re-read after every event affecting the tag. Ends when the receiver
    /// is dropped.
    pub fn watch(
        self: &Arc<Self>,
        truck: &str,
        box_id: &str,
        tag: &str,
    ) -> Receiver<Option<Value>> {
        let events = self.bus.subscribe();
        let (out_tx, out_rx) = mpsc::sync_channel(self.config.subscriber_queue_depth);
        let store = Arc::clone(self);
        let (truck, box_id, tag) = (truck.to_string(), box_id.to_string(), tag.to_string());

        thread::spawn(move || {
            let current = store.get(&truck, &box_id, &tag).unwrap_or_else(|e| {
                warn!(truck = %truck, error = %e, "watch initial read failed");
                None
            });
            if out_tx.send(current).is_err() {
                return;
            }
            for event in events.iter() {
                if !event.affects_tag(&truck, &box_id, &tag) {
                    continue;
                }
                let fresh = store.get(&truck, &box_id, &tag).unwrap_or_else(|e| {
                    warn!(truck = %truck, error = %e, "watch re-read failed");
                    None
                });
                if out_tx.send(fresh).is_err() {
                    break;
                }
            }
        });
        out_rx
    }

    /// Stream of full-box snapshots: the current snapshot first, then a
    /// fresh one after every event touching the box.
    pub fn watch_box(
        self: &Arc<Self>,
        truck: &str,
        box_id: &str,
    ) -> Receiver<BTreeMap<String, Value>> {
        let events = self.bus.subscribe();
        let (out_tx, out_rx) = mpsc::sync_channel(self.config.subscriber_queue_depth);
        let store = Arc::clone(self);
        let (truck, box_id) = (truck.to_string(), box_id.to_string());

        thread::spawn(move || {
            let current = store.get_box(&truck, &box_id).unwrap_or_else(|e| {
                warn!(truck = %truck, error = %e, "watch_box initial read failed");
                BTreeMap::new()
            });
            if out_tx.send(current).is_err() {
                return;
            }
            for event in events.iter() {
                if !event.affects_box(&truck, &box_id) {
                    continue;
                }
                let fresh = store.get_box(&truck, &box_id).unwrap_or_else(|e| {
                    warn!(truck = %truck, error = %e, "watch_box re-read failed");
                    BTreeMap::new()
                });
                if out_tx.send(fresh).is_err() {
                    break;
                }
            }
        });
        out_rx
    }
}

impl Drop for FreightStore {
    fn drop(&mut self) {
        // Workers flush and close via their own drop handlers; draining
        // here just makes the shutdown order deterministic.
        self.shutdown_workers();
    }
}

/// Write and remove a probe file to verify the root is writable.
fn probe_writable(root: &Path) -> FreightResult<()> {
    let probe = root.join(".test");
    let mut file = File::create(&probe).map_err(|e| io_err(&probe, "create probe file", e))?;
    file.write_all(b"ok")
        .map_err(|e| io_err(&probe, "write probe file", e))?;
    drop(file);
    fs::remove_file(&probe).map_err(|e| io_err(&probe, "remove probe file", e))?;
    Ok(())
}
