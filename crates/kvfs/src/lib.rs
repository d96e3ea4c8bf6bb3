#![forbid(unsafe_code)]
//! A key-value store served over 9P2000 as a read-only file tree.
//!
//! Each stored key shows up as a file whose contents are the value. Keys
//! containing `/` appear as nested paths. The file `/ctl` is reserved.
//!
//! ```no_run
//! use kvfs::{fs::KvFs, store::MemStore};
//!
//! #[tokio::main]
//! async fn main() -> kv9p::Result<()> {
//!     let store: MemStore = [("greeting", "hello")].into_iter().collect();
//!     kv9p::srv::srv_async(KvFs::new(store), "tcp!127.0.0.1!5640").await
//! }
//! ```
pub mod fs;
pub mod store;
