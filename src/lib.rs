pub mod cli;
pub mod error;
pub mod fs;
pub mod recipient;
pub mod subprocess;

pub use error::{ArmorfsError, Result};
pub use fs::{ArmorFs, FileInfo, MountOptions};
pub use recipient::Recipient;
