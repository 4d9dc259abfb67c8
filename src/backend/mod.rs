pub mod api;
pub mod coalescer;
pub mod extra_data;
pub mod media_cache;
pub mod media_id;
pub mod media_info;
pub mod media_store;
pub mod user_cache;

pub use media_cache::{InfoOptions, MediaCache};
pub use media_id::MediaId;
pub use media_info::MediaInfo;
pub use media_store::MediaEvent;
