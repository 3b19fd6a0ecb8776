//! The merge coordinator and its supporting pieces.

pub mod history;
pub mod keeper;
pub mod pool;
pub mod ranking;

pub use history::{Action, BlobStore, History, NoopBlobStore, Record};
pub use keeper::{KEEPER_CONTEXT, Keeper};
pub use pool::{PoolState, SubPool};
