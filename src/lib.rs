pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod publisher;
pub mod reaper;
pub mod request;
pub mod wal;
pub mod wire;
