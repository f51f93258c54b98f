//! The hashed key/value layer: chained hash tables with Bloom-gated
//! lookups, a segregated free-list block allocator, a write buffer for
//! appended blocks, and journaled transactions.

mod db;
mod ops;

pub use db::Kv;
