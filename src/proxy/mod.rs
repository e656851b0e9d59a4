pub mod cache;
pub mod engine;
pub mod modifiers;

pub use cache::{CachedResponse, MemoryCache, NoopCache, ResponseCache};
pub use engine::ProxyEngine;
