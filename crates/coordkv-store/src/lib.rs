#![warn(missing_docs)]

//! coordkv store subsystem: one key/value coordination contract over embedded, etcd, consul and zookeeper backends

pub mod backends;
pub mod backoff;
pub mod config;
pub mod error;
pub mod handle;
pub mod http;
pub mod keys;
pub mod lock;
pub mod registry;
pub mod store;
pub mod types;
pub mod watch;

pub use config::{StoreConfig, TlsConfig};
pub use error::{Result, StoreError};
pub use registry::{default_registry, Registry, StoreUri};
pub use store::{Locker, Store, TreeWatchStream, WatchStream};
pub use types::{Backend, Capabilities, KvPair, LockOptions, WriteOptions};
