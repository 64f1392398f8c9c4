use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "armorfs")]
#[command(
    about = "Mount a directory of GPG-encrypted files as a transparent cleartext view"
)]
pub struct Args {
    #[arg(help = "Directory holding the encrypted backing files")]
    pub backing: PathBuf,

    #[arg(help = "Where to mount the cleartext view")]
    pub mountpoint: PathBuf,

    #[arg(
        short = 'r',
        long = "recipient",
        required = true,
        value_name = "FINGERPRINT",
        help = "Encrypt new content to this key (repeatable)"
    )]
    pub recipients: Vec<String>,

    #[arg(
        long,
        help = "Enable decryption; requires the matching secret key in the keyring"
    )]
    pub read: bool,

    #[arg(
        long,
        value_name = "DIR",
        help = "Keyring directory handed to gpg via GNUPGHOME"
    )]
    pub gnupghome: Option<PathBuf>,

    #[arg(
        long,
        default_value_t = 4,
        value_name = "N",
        help = "FUSE dispatch threads"
    )]
    pub threads: usize,
}
