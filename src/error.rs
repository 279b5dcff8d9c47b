use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Errno(#[from] nix::errno::Errno),
    #[error("no server running on {}", .0.display())]
    NoServer(PathBuf),
    #[error("error connecting to {} ({source})", .path.display())]
    Connect { path: PathBuf, source: io::Error },
    #[error("{0}")]
    Command(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
