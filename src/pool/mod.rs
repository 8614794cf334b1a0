//! Client-side connection pooling: a generic engine plus the per-URL
//! wrapper and global registry built on top of it.

pub mod client;
pub mod engine;

pub use client::{get_all_pools, get_or_create_pool, get_pool, Channel, ConnectionPool, PoolConfig};
