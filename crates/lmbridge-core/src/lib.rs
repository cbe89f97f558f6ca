pub mod config;
pub mod error;
pub mod jobs;
pub mod protocol;
pub mod storage;
