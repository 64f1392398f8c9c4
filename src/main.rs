use clap::Parser;

use armorfs::fs::{mount, ArmorFs, MountOptions};
use armorfs::{cli, error};

fn main() {
    match run() {
        Ok(()) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> error::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("ARMORFS_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let args = cli::Args::parse();
    let recipients = cli::validate(&args)?;

    // Cipher children inherit the environment, so one export covers them all.
    if let Some(dir) = &args.gnupghome {
        std::env::set_var("GNUPGHOME", dir);
    }

    let fs = ArmorFs::new(MountOptions {
        backing_root: args.backing,
        read_enabled: args.read,
        recipients,
    })?;

    mount::mount(fs, &args.mountpoint, args.threads)
}
