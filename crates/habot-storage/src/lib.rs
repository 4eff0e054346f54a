//! Versioned JSON record store for durable bridge state
//!
//! Subscriptions and rate-limiter cooldowns must survive restarts. This
//! crate persists them as versioned JSON files under a `.storage/`
//! directory, written atomically (temp file + rename). The rest of the
//! system treats it as a get/put/delete record store and does not care
//! about the on-disk layout.

mod records;
mod store;

pub use records::{RateStateData, SubscriptionData, SubscriptionMode, SubscriptionRecord};
pub use store::{Storable, Storage, StorageError, StorageFile, StorageResult};
