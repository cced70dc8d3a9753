//! Content-addressed layer storage.
//!
//! [`LayerStore`] is the on-disk blob store used by the broker as its canonical copy.
//! Workers wrap one in a [`LayerCache`], which adds LRU eviction and pinning.

pub mod cache;
pub mod store;

pub use cache::{CacheDelta, LayerCache, PinnedLayers};
pub use store::{LayerStore, LayerStoreError};
