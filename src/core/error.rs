use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SkywatchError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Feed client error: {0}")]
    Client(String),
    #[error("Notification error: {0}")]
    Notify(String),
    #[error("State store error: {0}")]
    State(String),
    #[error("SQLite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("{0} scan(s) failed")]
    ScanFailures(usize),
}
