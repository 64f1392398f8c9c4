//! Write-only mode: no secret key is present, so pre-existing content can
//! never be surfaced, while fresh writes still encrypt on release.

mod common;

use std::fs;
use std::path::Path;

use armorfs::FileInfo;

#[test]
fn preexisting_files_cannot_be_opened_for_reading() {
    let backing = tempfile::tempdir().unwrap();
    fs::write(backing.path().join("secret"), b"ciphertext").unwrap();
    let fs = common::write_only_fs(backing.path(), common::dummy_recipient());

    let mut info = FileInfo {
        flags: libc::O_RDONLY,
        fh: 0,
    };
    assert_eq!(
        fs.open(Path::new("/secret"), &mut info).unwrap_err(),
        libc::EACCES
    );
    assert_eq!(fs.open_state_count(), 0);
}

#[test]
fn open_with_creat_refuses_an_existing_file() {
    let backing = tempfile::tempdir().unwrap();
    fs::write(backing.path().join("secret"), b"ciphertext").unwrap();
    let fs = common::write_only_fs(backing.path(), common::dummy_recipient());

    // O_CREAT plus read access gets O_EXCL forced, so the existing file
    // makes the open fail outright.
    let mut info = FileInfo {
        flags: libc::O_CREAT | libc::O_RDWR,
        fh: 0,
    };
    assert_eq!(
        fs.open(Path::new("/secret"), &mut info).unwrap_err(),
        libc::EEXIST
    );
}

#[test]
fn reads_through_a_rdwr_handle_are_refused() {
    let backing = tempfile::tempdir().unwrap();
    fs::write(backing.path().join("secret"), b"ciphertext").unwrap();
    let fs = common::write_only_fs(backing.path(), common::dummy_recipient());

    let mut info = FileInfo {
        flags: libc::O_RDWR,
        fh: 0,
    };
    fs.open(Path::new("/secret"), &mut info).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(info.fh, &mut buf, 0).unwrap_err(), libc::EACCES);
    fs.release(info.fh);
}

#[test]
fn access_denies_read_probes() {
    let backing = tempfile::tempdir().unwrap();
    fs::write(backing.path().join("x"), b"ciphertext").unwrap();
    let fs = common::write_only_fs(backing.path(), common::dummy_recipient());

    assert_eq!(
        fs.access(Path::new("/x"), libc::R_OK).unwrap_err(),
        libc::EACCES
    );
    fs.access(Path::new("/x"), libc::W_OK).unwrap();
    // Host errors still win over the mode check.
    assert_eq!(
        fs.access(Path::new("/missing"), libc::R_OK).unwrap_err(),
        libc::ENOENT
    );
}

#[test]
fn getattr_masks_the_read_bits() {
    let backing = tempfile::tempdir().unwrap();
    fs::write(backing.path().join("x"), b"ciphertext").unwrap();
    fs::create_dir(backing.path().join("sub")).unwrap();
    let fs = common::write_only_fs(backing.path(), common::dummy_recipient());

    let st = fs.getattr(Path::new("/x")).unwrap();
    assert_eq!(
        st.st_mode & (libc::S_IRUSR | libc::S_IRGRP | libc::S_IROTH),
        0
    );

    // Directories keep their bits; they must stay traversable.
    let st = fs.getattr(Path::new("/sub")).unwrap();
    assert_ne!(st.st_mode & libc::S_IRUSR, 0);
}

#[test]
fn fresh_files_can_be_written_and_read_back_before_release() {
    let backing = tempfile::tempdir().unwrap();
    let fs = common::write_only_fs(backing.path(), common::dummy_recipient());

    let mut info = FileInfo {
        flags: libc::O_CREAT | libc::O_RDWR,
        fh: 0,
    };
    fs.create(Path::new("/note"), 0o600, &mut info).unwrap();
    fs.write(info.fh, b"draft", 0).unwrap();

    // The buffer mirrors this mount's own writes, so reading is fine.
    let mut buf = [0u8; 16];
    let n = fs.read(info.fh, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"draft");

    // Attributes come from the buffer too.
    assert_eq!(fs.fgetattr(info.fh).unwrap().st_size, 5);

    // Sizes cannot be cut without decrypting, but zero is always possible.
    assert_eq!(fs.ftruncate(info.fh, 3).unwrap_err(), libc::EACCES);
    fs.ftruncate(info.fh, 0).unwrap();
    assert_eq!(fs.read(info.fh, &mut buf, 0).unwrap(), 0);
    fs.release(info.fh);
}

#[test]
fn truncate_by_path_needs_the_secret_key_except_to_zero() {
    let backing = tempfile::tempdir().unwrap();
    fs::write(backing.path().join("x"), b"ciphertext").unwrap();
    let fs = common::write_only_fs(backing.path(), common::dummy_recipient());

    assert_eq!(
        fs.truncate(Path::new("/x"), 4).unwrap_err(),
        libc::EACCES
    );
    fs.truncate(Path::new("/x"), 0).unwrap();
    assert_eq!(fs::read(backing.path().join("x")).unwrap().len(), 0);
}

#[test]
fn write_only_content_decrypts_under_a_read_mount() {
    let Some(key) = common::gpg_fixture() else {
        return;
    };
    let backing = tempfile::tempdir().unwrap();
    let path = Path::new("/dropbox");

    // Encrypt through a write-only mount; only the public key is needed.
    {
        let fs = common::write_only_fs(backing.path(), key.recipient());
        let mut info = FileInfo {
            flags: libc::O_CREAT | libc::O_WRONLY,
            fh: 0,
        };
        fs.create(path, 0o600, &mut info).unwrap();
        fs.write(info.fh, b"deposited", 0).unwrap();
        fs.release(info.fh);
    }

    let raw = fs::read(backing.path().join("dropbox")).unwrap();
    assert!(raw.starts_with(b"-----BEGIN PGP MESSAGE-----"));

    // Decrypt through a read/write mount over the same backing directory.
    let fs = common::read_write_fs(backing.path(), key.recipient());
    let mut info = FileInfo {
        flags: libc::O_RDONLY,
        fh: 0,
    };
    fs.open(path, &mut info).unwrap();
    let mut buf = [0u8; 32];
    let n = fs.read(info.fh, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"deposited");
    fs.release(info.fh);
}

#[test]
fn write_only_append_adds_a_block_without_reading() {
    let Some(key) = common::gpg_fixture() else {
        return;
    };
    let backing = tempfile::tempdir().unwrap();
    let path = Path::new("/log");

    {
        let fs = common::write_only_fs(backing.path(), key.recipient());
        let mut info = FileInfo {
            flags: libc::O_CREAT | libc::O_WRONLY,
            fh: 0,
        };
        fs.create(path, 0o600, &mut info).unwrap();
        fs.write(info.fh, b"first\n", 0).unwrap();
        fs.release(info.fh);
    }
    {
        let fs = common::write_only_fs(backing.path(), key.recipient());
        let mut info = FileInfo {
            flags: libc::O_APPEND | libc::O_WRONLY,
            fh: 0,
        };
        fs.open(path, &mut info).unwrap();
        fs.write(info.fh, b"second\n", 0).unwrap();
        fs.release(info.fh);
    }

    let fs = common::read_write_fs(backing.path(), key.recipient());
    let mut info = FileInfo {
        flags: libc::O_RDONLY,
        fh: 0,
    };
    fs.open(path, &mut info).unwrap();
    let mut buf = [0u8; 64];
    let n = fs.read(info.fh, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"first\nsecond\n");
    fs.release(info.fh);
}
