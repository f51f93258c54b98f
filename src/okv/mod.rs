//! The ordered, B+-tree-style index layer. A key range is split across
//! a chain of nodes, each one a varint-encoded insert/delete change log
//! stored as an ordinary reserved-prefix entry in the underlying `Kv`.
//! A small in-memory master directory (first key and live count per
//! node) routes a key to its owning node without touching disk.

mod db;
mod iter;

pub use db::Okv;
pub use iter::OkvIterator;
