pub mod dir_cache;
pub mod download;
pub mod entities;
pub mod sweeper;
