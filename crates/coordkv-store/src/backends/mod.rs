//! Backend adapters.

pub mod boltdb;
pub mod consul;
pub mod etcd;
pub mod zookeeper;
