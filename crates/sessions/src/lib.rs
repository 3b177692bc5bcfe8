//! PulseGrid session lifecycle
//!
//! Issues, caches, rotates, and invalidates per-platform automation
//! sessions. The durable store is the source of truth; a two-tier cache
//! (in-process map + Redis) sits in front of it as a rebuildable
//! accelerator. Rotation is time-based: one timer per active platform
//! forces a fresh session every interval, and a separate sweep retires
//! rows whose expiry has passed.

pub mod cache;
pub mod identity;
pub mod manager;
pub mod rotation;
pub mod store;

pub use cache::{FastCache, MemoryCache, SessionCache};
pub use manager::SessionManager;
pub use store::{MemoryStore, SessionStore};
