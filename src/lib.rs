pub mod config;
pub mod engine;
pub mod spool;
pub mod store;
pub mod timeline;
