//! FreightStore Core — embedded multi-truck key-value storage engine.
//!
//! Records live in per-truck append-only data files framed with a magic
//! byte and a CRC32 trailer, addressed through a persistent offset index,
//! and organized in a three-level namespace: truck → box → tag.
//!
//! # Architecture
//!
//! - **Write path**: mutations stage in an in-memory buffer and reach disk
//!   as transaction-framed envelopes with a single durable sync
//! - **Read path**: write buffer → value cache → offset index → CRC-checked
//!   record decode
//! - **Recovery**: a bounded-skip scan replays committed envelopes past the
//!   index tail and skips anything torn or corrupt
//! - **Concurrency**: one worker thread owns each truck; the front-end
//!   multiplexes trucks, keeps a store-wide cache, and broadcasts changes
//!
//! # Example
//!
//! ```no_run
//! use freightstore_core::{Config, FreightStore, value_map};
//!
//! let store = FreightStore::open("/var/lib/freight", Config::default())?;
//! store.put("app", "users", "u1", value_map! { "name" => "Alice" }, true)?;
//! assert!(store.get("app", "users", "u1")?.is_some());
//! # Ok::<(), freightstore_core::FreightError>(())
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod durability;
pub mod envelope;
pub mod error;
pub mod events;
pub mod field_index;
pub mod index;
pub mod registry;
pub mod truck;
pub mod value;
pub mod worker;

// Re-export key types for convenience
pub use config::Config;
pub use envelope::{Cipher, EnvelopeHandler, Unwrapped};
pub use error::{FreightError, FreightResult};
pub use events::{Broadcaster, ChangeEvent};
pub use registry::{FreightStore, WriteOptions};
pub use truck::Truck;
pub use value::Value;
pub use worker::{TruckWorker, WorkerClient};
