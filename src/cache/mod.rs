//! Expiring caches shared by the messages of one protocol factory.

pub mod nonce;
pub mod time_bounded;
pub mod token;

pub use nonce::{InMemoryNonceCache, NonceCache, MIN_NONCE_LENGTH};
pub use time_bounded::{CacheOptions, OverflowPolicy, PurgeMode, TimeBoundedCache};
pub use token::SecurityContextTokenCache;
