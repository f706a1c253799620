pub mod config;
pub mod error;
pub mod fs;
pub mod remote;
pub mod state;
