//! EZKV - Embedded Ordered Key-Value Store
//!
//! A single-file key-value store with per-key expiration, prefix scans and
//! typed accessors.
//!
//! ## Features
//! - **Ordered keys**: `BTreeMap` index, prefix scans in ascending key order
//! - **TTL Support**: lazy expiry on read, opportunistic purge on write,
//!   optional background sweeper
//! - **Transactions**: single writer, snapshot readers that never block
//! - **Durability**: every commit is one CRC32-checked frame, fsynced before
//!   it becomes visible; a torn final frame is dropped on open
//! - **Typed values**: int, bool, RFC3339 time and JSON codecs
//! - **Metrics**: lock-free atomic counters
//!
//! ## Example
//! ```no_run
//! use ezkv::Store;
//!
//! let store = Store::open("data/kv.db").unwrap();
//!
//! store.set("dance:harlem", "shake").unwrap();
//! store.set_ttl("session", "token", 3600).unwrap();
//! store.set_bool("feature:on", true).unwrap();
//!
//! assert_eq!(store.get("dance:harlem").unwrap(), "shake");
//! assert!(store.get_bool("feature:on").unwrap());
//! assert_eq!(store.get_or_default("missing", "fallback"), "fallback");
//!
//! let dances = store.scan_prefix("dance").unwrap();
//! assert_eq!(dances.len(), 1);
//!
//! store.close().unwrap();
//! ```

pub mod clock;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use engine::txn::{ReadTxn, TxState, WriteTxn};
pub use engine::Store;
pub use error::{EzkvError, Result};
pub use types::{Entry, Key, Value};
