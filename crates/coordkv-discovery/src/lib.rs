#![warn(missing_docs)]

//! coordkv discovery subsystem: cluster membership over coordkv stores, static node lists and the hosted token service

pub mod discovery;
pub mod entry;
pub mod error;
pub mod health;
pub mod kv;
pub mod nodes;
pub mod token;
pub mod uri;

pub use discovery::{Discoverer, Discovery, DiscoveryOptions, MembershipChange};
pub use entry::{diff, same_members, Endpoint};
pub use error::{DiscoveryError, Result};
pub use health::Health;
pub use kv::KvDiscovery;
pub use nodes::NodesDiscovery;
pub use token::TokenDiscovery;
