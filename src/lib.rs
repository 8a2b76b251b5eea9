pub mod config;
pub mod error;
pub mod fetcher;
pub mod git;
pub mod indexer;
pub mod parser;
pub mod search;
pub mod service;
pub mod storage;

pub use error::RockskipError;
pub use service::Service;
