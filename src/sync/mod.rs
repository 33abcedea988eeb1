//! The reentrant sync base and its small supporting primitives. Every
//! other coordination primitive in this crate embeds a [`SyncObject`]
//! rather than reaching for `std::sync::Mutex` directly.

mod base;
mod drops;
mod gate;

pub use base::{run_guarded, SyncGuard, SyncObject, UnlockGuard};
pub use drops::RunOnDrop;
pub use gate::Gate;
