//! An embedded, single-file key/value storage engine: a hashed store
//! (`kv`) with journaled crash recovery and transactions, and an
//! ordered index (`okv`) layered on top of it.

pub mod block;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod consts;
pub mod error;
pub mod journal;
pub mod kv;
pub mod okv;
pub mod primes;
pub mod table;
pub mod txn;

pub use config::{CompressionType, Config, ConfigBuilder};
pub use error::{Error, Result};
pub use kv::Kv;
pub use okv::{Okv, OkvIterator};
