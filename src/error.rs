use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ArmorfsError>;

#[derive(Error, Debug)]
pub enum ArmorfsError {
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FUSE error: {0}")]
    Mount(String),

    #[error("Invalid recipient: {0}")]
    Recipient(#[from] crate::recipient::ParseRecipientError),

    #[error("Recipient list cannot change while {0} file(s) are open")]
    RecipientsInUse(usize),
}
