pub mod config;
pub mod downloader;
pub mod handoff;
pub mod progress;
pub mod pump;
pub mod session;
pub mod types;
