//! Media info caching and paginated result navigation for an image-board browser.

pub mod backend;
pub mod config;
pub mod context;
pub mod data_source;
pub mod error;
pub mod events;
mod sync;

#[cfg(test)]
mod test_support;
