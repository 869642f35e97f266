pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod matcher;
pub mod notify;
pub mod output;
pub mod state;
