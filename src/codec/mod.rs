//! Endian, hash and varint helpers shared by the KV and OKV layers.
//!
//! All multi-byte KV on-disk fields are big-endian; this crate reaches
//! for `byteorder::{BigEndian, ReadBytesExt, WriteBytesExt}` directly
//! at call sites rather than re-wrapping it, since byteorder's API is
//! already the idiomatic Rust equivalent of the original engine's
//! hand-rolled `hton64`/`ntoh64` helpers.

pub mod hash;
pub mod varint;

pub use hash::{bloom_hashes, murmur_hash2};
