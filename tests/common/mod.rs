//! Shared test fixtures: a throwaway GnuPG home with a freshly generated
//! keypair, plus small helpers for driving the façade the way the kernel
//! would.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::process::Command;
use std::sync::OnceLock;

use armorfs::subprocess::Subprocess;
use armorfs::{ArmorFs, MountOptions, Recipient};
use tempfile::TempDir;

pub struct GpgFixture {
    // Held for the lifetime of the test binary; GNUPGHOME points into it.
    _home: TempDir,
    pub fingerprint: String,
}

impl GpgFixture {
    pub fn recipient(&self) -> Recipient {
        self.fingerprint.parse().expect("gpg emits a valid fingerprint")
    }
}

/// Generate one transient key per test binary and export GNUPGHOME before
/// any cipher child runs. Returns None (and the caller should skip) when no
/// gpg binary is available.
pub fn gpg_fixture() -> Option<&'static GpgFixture> {
    static FIXTURE: OnceLock<Option<GpgFixture>> = OnceLock::new();
    FIXTURE
        .get_or_init(|| match generate_key() {
            Ok(fixture) => Some(fixture),
            Err(e) => {
                eprintln!("skipping gpg-backed tests: {}", e);
                None
            }
        })
        .as_ref()
}

fn generate_key() -> Result<GpgFixture, String> {
    if Command::new("gpg").arg("--version").output().is_err() {
        return Err("no gpg binary on PATH".to_string());
    }

    let home = tempfile::tempdir().map_err(|e| e.to_string())?;
    fs::set_permissions(home.path(), fs::Permissions::from_mode(0o700))
        .map_err(|e| e.to_string())?;
    let home_arg = home.path().to_str().ok_or("non-UTF8 tempdir")?.to_string();

    let batch = "\
Key-Type: RSA
Key-Length: 2048
Subkey-Type: RSA
Subkey-Length: 2048
Name-Real: Armorfs Test
Name-Email: test@example.com
Expire-Date: 0
%no-protection
%transient-key
%commit
";

    let args = [
        "--homedir",
        &home_arg,
        "--batch",
        "--no-tty",
        "--gen-key",
    ];
    let mut gpg = Subprocess::spawn("gpg", &args, None, None).map_err(|e| e.to_string())?;
    gpg.communicate(None, Some(batch.as_bytes()))
        .map_err(|e| e.to_string())?;
    if gpg.wait().map_err(|e| e.to_string())? != 0 {
        return Err("gpg --gen-key failed".to_string());
    }

    let args = [
        "--homedir",
        &home_arg,
        "--batch",
        "--no-tty",
        "--with-colons",
        "--list-keys",
    ];
    let mut gpg = Subprocess::spawn("gpg", &args, None, None).map_err(|e| e.to_string())?;
    let mut out = vec![0u8; 1 << 16];
    let progress = gpg
        .communicate(Some(&mut out), None)
        .map_err(|e| e.to_string())?;
    if gpg.wait().map_err(|e| e.to_string())? != 0 {
        return Err("gpg --list-keys failed".to_string());
    }
    out.truncate(progress.bytes_read);

    let listing = String::from_utf8_lossy(&out);
    let fingerprint = listing
        .lines()
        .find(|line| line.starts_with("fpr:"))
        .and_then(|line| line.split(':').nth(9))
        .ok_or("no fingerprint in gpg output")?
        .to_string();

    // Cipher children inherit the environment; exporting once up front keeps
    // every spawned gpg on this keyring.
    std::env::set_var("GNUPGHOME", home.path());

    Ok(GpgFixture {
        _home: home,
        fingerprint,
    })
}

#[allow(dead_code)]
pub fn read_write_fs(backing: &std::path::Path, recipient: Recipient) -> ArmorFs {
    ArmorFs::new(MountOptions {
        backing_root: backing.to_path_buf(),
        read_enabled: true,
        recipients: vec![recipient],
    })
    .expect("backing directory is valid")
}

#[allow(dead_code)]
pub fn write_only_fs(backing: &std::path::Path, recipient: Recipient) -> ArmorFs {
    ArmorFs::new(MountOptions {
        backing_root: backing.to_path_buf(),
        read_enabled: false,
        recipients: vec![recipient],
    })
    .expect("backing directory is valid")
}

/// A recipient for tests that never reach the cipher tool.
#[allow(dead_code)]
pub fn dummy_recipient() -> Recipient {
    "0123456789ABCDEF0123456789ABCDEF01234567"
        .parse()
        .unwrap()
}
