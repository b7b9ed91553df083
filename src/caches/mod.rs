//! The three cache tiers, from the per-thread front end down to the page level.

pub mod central_cache;
pub mod page_cache;
pub mod thread_cache;

pub use central_cache::CentralCache;
pub use page_cache::PageCache;
pub use thread_cache::{ThreadCache, SPILL_THRESHOLD};
