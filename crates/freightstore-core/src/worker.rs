//! Per-truck worker thread and its command channel.
//!
//! Each truck runs on a dedicated thread that exclusively owns the truck's
//! I/O handles and in-memory state. The front-end talks to it over an mpsc
//! channel; every request either carries a bounded reply slot the caller
//! waits on (with a timeout), or no slot at all for fire-and-forget sends.
//! The reply slot doubles as the correlation id: a reply to a slot whose
//! receiver gave up is silently dropped.
//!
//! Between commands the thread sleeps at most until the truck's scheduled
//! flush deadline, so buffered writes reach disk even on an idle channel.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::config::Config;
use crate::error::{FreightError, FreightResult};
use crate::truck::Truck;
use crate::value::Value;

type Reply = SyncSender<FreightResult<Response>>;

/// Commands a worker serves, in receipt order.
enum Command {
    Write { box_id: String, tag: String, value: Value, sync: bool, reply: Option<Reply> },
    PutCas { box_id: String, tag: String, value: Value, field: String, expected: Value, sync: bool, reply: Reply },
    Read { box_id: String, tag: String, reply: Reply },
    Batch { box_id: String, entries: BTreeMap<String, Value>, reply: Reply },
    ReadBox { box_id: String, reply: Reply },
    Query { box_id: String, field: String, prefix: String, reply: Reply },
    RemoveTag { box_id: String, tag: String, sync: bool, reply: Option<Reply> },
    RemoveBox { box_id: String, sync: bool, reply: Option<Reply> },
    Compact { reply: Reply },
    Contains { box_id: String, tag: String, reply: Reply },
    Boxes { reply: Reply },
    Close { reply: Reply },
}

#[derive(Debug)]
enum Response {
    Unit,
    Flag(bool),
    Maybe(Option<Value>),
    Snapshot(BTreeMap<String, Value>),
    Values(Vec<Value>),
    Names(Vec<String>),
}

/// Cloneable sending half of a worker's channel, with the request/response
/// protocol on top.
#[derive(Clone)]
pub struct WorkerClient {
    id: String,
    tx: Sender<Command>,
    timeout: Duration,
}

impl WorkerClient {
    fn request(
        &self,
        command: &'static str,
        build: impl FnOnce(Reply) -> Command,
    ) -> FreightResult<Response> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx
            .send(build(reply_tx))
            .map_err(|_| FreightError::NotInitialized { truck: self.id.clone() })?;
        match reply_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(FreightError::Timeout { command }),
            Err(RecvTimeoutError::Disconnected) => {
                Err(FreightError::NotInitialized { truck: self.id.clone() })
            }
        }
    }

    fn send_nowait(&self, command: Command) -> FreightResult<()> {
        self.tx
            .send(command)
            .map_err(|_| FreightError::NotInitialized { truck: self.id.clone() })
    }

    pub fn write(&self, box_id: &str, tag: &str, value: Value, sync: bool) -> FreightResult<()> {
        self.request("write", |reply| Command::Write {
            box_id: box_id.to_string(),
            tag: tag.to_string(),
            value,
            sync,
            reply: Some(reply),
        })
        .map(|_| ())
    }

    /// Write without awaiting completion; ordering on this truck is kept.
    pub fn write_nowait(&self, box_id: &str, tag: &str, value: Value) -> FreightResult<()> {
        self.send_nowait(Command::Write {
            box_id: box_id.to_string(),
            tag: tag.to_string(),
            value,
            sync: false,
            reply: None,
        })
    }

    pub fn put_cas(
        &self,
        box_id: &str,
        tag: &str,
        value: Value,
        field: &str,
        expected: Value,
        sync: bool,
    ) -> FreightResult<bool> {
        match self.request("putCAS", |reply| Command::PutCas {
            box_id: box_id.to_string(),
            tag: tag.to_string(),
            value,
            field: field.to_string(),
            expected,
            sync,
            reply,
        })? {
            Response::Flag(hit) => Ok(hit),
            _ => unreachable!("putCAS reply shape"),
        }
    }

    pub fn read(&self, box_id: &str, tag: &str) -> FreightResult<Option<Value>> {
        match self.request("read", |reply| Command::Read {
            box_id: box_id.to_string(),
            tag: tag.to_string(),
            reply,
        })? {
            Response::Maybe(value) => Ok(value),
            _ => unreachable!("read reply shape"),
        }
    }

    pub fn batch(&self, box_id: &str, entries: BTreeMap<String, Value>) -> FreightResult<()> {
        self.request("batch", |reply| Command::Batch {
            box_id: box_id.to_string(),
            entries,
            reply,
        })
        .map(|_| ())
    }

    pub fn read_box(&self, box_id: &str) -> FreightResult<BTreeMap<String, Value>> {
        match self.request("readBox", |reply| Command::ReadBox {
            box_id: box_id.to_string(),
            reply,
        })? {
            Response::Snapshot(snapshot) => Ok(snapshot),
            _ => unreachable!("readBox reply shape"),
        }
    }

    pub fn query(&self, box_id: &str, field: &str, prefix: &str) -> FreightResult<Vec<Value>> {
        match self.request("query", |reply| Command::Query {
            box_id: box_id.to_string(),
            field: field.to_string(),
            prefix: prefix.to_string(),
            reply,
        })? {
            Response::Values(values) => Ok(values),
            _ => unreachable!("query reply shape"),
        }
    }

    pub fn remove_tag(&self, box_id: &str, tag: &str, sync: bool) -> FreightResult<()> {
        self.request("removeTag", |reply| Command::RemoveTag {
            box_id: box_id.to_string(),
            tag: tag.to_string(),
            sync,
            reply: Some(reply),
        })
        .map(|_| ())
    }

    pub fn remove_tag_nowait(&self, box_id: &str, tag: &str) -> FreightResult<()> {
        self.send_nowait(Command::RemoveTag {
            box_id: box_id.to_string(),
            tag: tag.to_string(),
            sync: false,
            reply: None,
        })
    }

    pub fn remove_box(&self, box_id: &str, sync: bool) -> FreightResult<()> {
        self.request("removeBox", |reply| Command::RemoveBox {
            box_id: box_id.to_string(),
            sync,
            reply: Some(reply),
        })
        .map(|_| ())
    }

    pub fn remove_box_nowait(&self, box_id: &str) -> FreightResult<()> {
        self.send_nowait(Command::RemoveBox {
            box_id: box_id.to_string(),
            sync: false,
            reply: None,
        })
    }

    pub fn compact(&self) -> FreightResult<()> {
        self.request("compact", |reply| Command::Compact { reply }).map(|_| ())
    }

    pub fn contains(&self, box_id: &str, tag: &str) -> FreightResult<bool> {
        match self.request("contains", |reply| Command::Contains {
            box_id: box_id.to_string(),
            tag: tag.to_string(),
            reply,
        })? {
            Response::Flag(found) => Ok(found),
            _ => unreachable!("contains reply shape"),
        }
    }

    pub fn boxes(&self) -> FreightResult<Vec<String>> {
        match self.request("getAllBoxes", |reply| Command::Boxes { reply })? {
            Response::Names(names) => Ok(names),
            _ => unreachable!("getAllBoxes reply shape"),
        }
    }
}

/// Handle to a running truck worker. Dropping it closes the truck cleanly
/// and joins the thread.
pub struct TruckWorker {
    client: WorkerClient,
    join: Option<JoinHandle<()>>,
}

impl TruckWorker {
    /// Spawn the worker thread and wait for the truck to initialize.
    pub fn spawn(root: &Path, id: &str, config: Config) -> FreightResult<Self> {
        let (tx, rx) = mpsc::channel();
        let (init_tx, init_rx) = mpsc::sync_channel(1);
        let timeout = config.request_timeout;

        let thread_root: PathBuf = root.to_path_buf();
        let thread_id = id.to_string();
        let join = thread::Builder::new()
            .name(format!("freight-{}", id))
            .spawn(move || worker_loop(thread_root, thread_id, config, init_tx, rx))
            .map_err(|e| FreightError::Io {
                path: None,
                kind: std::io::ErrorKind::Other,
                message: format!("failed to spawn worker thread: {}", e),
            })?;

        match init_rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(Self {
                client: WorkerClient { id: id.to_string(), tx, timeout },
                join: Some(join),
            }),
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => Err(FreightError::Timeout { command: "init" }),
        }
    }

    pub fn client(&self) -> WorkerClient {
        self.client.clone()
    }

    /// Flush and close the truck, then join the worker thread.
    pub fn close(&mut self) -> FreightResult<()> {
        if self.join.is_none() {
            return Ok(());
        }
        let result = self
            .client
            .request("close", |reply| Command::Close { reply })
            .map(|_| ());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        result
    }
}

impl Drop for TruckWorker {
    fn drop(&mut self) {
        if self.join.is_some() {
            if let Err(e) = self.close() {
                error!(truck = %self.client.id, error = %e, "worker close on drop failed");
            }
        }
    }
}

fn worker_loop(
    root: PathBuf,
    id: String,
    config: Config,
    init_tx: SyncSender<FreightResult<()>>,
    rx: Receiver<Command>,
) {
    let mut truck = match Truck::open(&root, &id, config) {
        Ok(truck) => {
            let _ = init_tx.send(Ok(()));
            truck
        }
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };
    debug!(truck = %id, "worker started");

    let mut closed = false;
    loop {
        let command = match truck.flush_deadline() {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    run_scheduled_flush(&mut truck);
                    continue;
                }
                match rx.recv_timeout(deadline - now) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => {
                        run_scheduled_flush(&mut truck);
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };
        if dispatch(&mut truck, command) {
            closed = true;
            break;
        }
    }

    if !closed {
        // Front-end went away without a close command; shut down cleanly.
        if let Err(e) = truck.close() {
            error!(truck = %id, error = %e, "close on channel disconnect failed");
        }
    }
    debug!(truck = %id, "worker stopped");
}

fn run_scheduled_flush(truck: &mut Truck) {
    if let Err(e) = truck.flush() {
        error!(truck = %truck.id(), error = %e, "scheduled flush failed");
    }
}

/// Serve one command. Returns true when the worker should stop.
fn dispatch(truck: &mut Truck, command: Command) -> bool {
    match command {
        Command::Write { box_id, tag, value, sync, reply } => {
            let result = truck.write(&box_id, &tag, value, sync).map(|_| Response::Unit);
            finish("write", reply, result);
        }
        Command::PutCas { box_id, tag, value, field, expected, sync, reply } => {
            let result = truck
                .put_cas(&box_id, &tag, value, &field, &expected, sync)
                .map(Response::Flag);
            finish("putCAS", Some(reply), result);
        }
        Command::Read { box_id, tag, reply } => {
            let result = truck.read(&box_id, &tag).map(Response::Maybe);
            finish("read", Some(reply), result);
        }
        Command::Batch { box_id, entries, reply } => {
            let result = truck.batch(&box_id, entries).map(|_| Response::Unit);
            finish("batch", Some(reply), result);
        }
        Command::ReadBox { box_id, reply } => {
            let result = truck.read_box(&box_id).map(Response::Snapshot);
            finish("readBox", Some(reply), result);
        }
        Command::Query { box_id, field, prefix, reply } => {
            let result = truck.query(&box_id, &field, &prefix).map(Response::Values);
            finish("query", Some(reply), result);
        }
        Command::RemoveTag { box_id, tag, sync, reply } => {
            let result = truck.remove_tag(&box_id, &tag, sync).map(|_| Response::Unit);
            finish("removeTag", reply, result);
        }
        Command::RemoveBox { box_id, sync, reply } => {
            let result = truck.remove_box(&box_id, sync).map(|_| Response::Unit);
            finish("removeBox", reply, result);
        }
        Command::Compact { reply } => {
            let result = truck.compact().map(|_| Response::Unit);
            finish("compact", Some(reply), result);
        }
        Command::Contains { box_id, tag, reply } => {
            finish("contains", Some(reply), Ok(Response::Flag(truck.contains(&box_id, &tag))));
        }
        Command::Boxes { reply } => {
            finish("getAllBoxes", Some(reply), Ok(Response::Names(truck.boxes())));
        }
        Command::Close { reply } => {
            let result = truck.close().map(|_| Response::Unit);
            finish("close", Some(reply), result);
            return true;
        }
    }
    false
}

fn finish(command: &'static str, reply: Option<Reply>, result: FreightResult<Response>) {
    match reply {
        // An abandoned slot (timed-out caller) makes this send fail; the
        // late reply is dropped on the floor.
        Some(reply) => {
            let _ = reply.send(result);
        }
        None => {
            if let Err(e) = result {
                error!(command, error = %e, "fire-and-forget command failed");
            }
        }
    }
}
