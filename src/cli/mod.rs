mod args;

pub use args::Args;

use crate::error::{ArmorfsError, Result};
use crate::recipient::Recipient;

/// Check the argument set before anything is mounted, and turn the raw
/// recipient strings into validated identifiers.
pub fn validate(args: &Args) -> Result<Vec<Recipient>> {
    if !args.backing.is_dir() {
        return Err(ArmorfsError::NotADirectory(args.backing.clone()));
    }
    if !args.mountpoint.is_dir() {
        return Err(ArmorfsError::NotADirectory(args.mountpoint.clone()));
    }

    args.recipients
        .iter()
        .map(|raw| raw.parse::<Recipient>().map_err(ArmorfsError::from))
        .collect()
}
