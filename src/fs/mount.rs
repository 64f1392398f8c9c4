//! FUSE bridge: translates `fuse_mt` callbacks into façade calls and mounts
//! the filesystem. Deliberately mechanical; all semantics live in
//! [`ArmorFs`].

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuse_mt::{
    CallbackResult, CreatedEntry, DirectoryEntry, FileType, FilesystemMT, FuseMT, RequestInfo,
    ResultCreate, ResultEmpty, ResultEntry, ResultOpen, ResultReaddir, ResultSlice, ResultStatfs,
    ResultWrite, ResultXattr, Xattr,
};

use super::convert::{stat_to_fileattr, statvfs_to_statfs};
use super::{ArmorFs, EntryKind, FileInfo};
use crate::error::{ArmorfsError, Result};

const TTL: Duration = Duration::from_secs(1);

pub struct FuseDriver {
    fs: Arc<ArmorFs>,
}

impl FuseDriver {
    pub fn new(fs: Arc<ArmorFs>) -> Self {
        FuseDriver { fs }
    }
}

impl FilesystemMT for FuseDriver {
    fn init(&self, _req: RequestInfo) -> ResultEmpty {
        tracing::info!("filesystem initialized");
        Ok(())
    }

    fn getattr(&self, _req: RequestInfo, path: &Path, fh: Option<u64>) -> ResultEntry {
        let st = match fh {
            Some(fh) => self.fs.fgetattr(fh)?,
            None => self.fs.getattr(path)?,
        };
        Ok((TTL, stat_to_fileattr(&st)))
    }

    fn chmod(&self, _req: RequestInfo, path: &Path, _fh: Option<u64>, mode: u32) -> ResultEmpty {
        self.fs.chmod(path, mode)
    }

    fn chown(
        &self,
        _req: RequestInfo,
        path: &Path,
        _fh: Option<u64>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> ResultEmpty {
        self.fs.chown(path, uid, gid)
    }

    fn truncate(&self, _req: RequestInfo, path: &Path, fh: Option<u64>, size: u64) -> ResultEmpty {
        match fh {
            Some(fh) => self.fs.ftruncate(fh, size as i64),
            None => self.fs.truncate(path, size as i64),
        }
    }

    fn utimens(
        &self,
        _req: RequestInfo,
        path: &Path,
        _fh: Option<u64>,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> ResultEmpty {
        self.fs.utimens(path, atime, mtime)
    }

    fn readlink(&self, _req: RequestInfo, path: &Path) -> std::result::Result<Vec<u8>, libc::c_int> {
        self.fs.readlink(path)
    }

    fn mkdir(&self, req: RequestInfo, parent: &Path, name: &OsStr, mode: u32) -> ResultEntry {
        let path = parent.join(name);
        self.fs.mkdir(&path, mode)?;
        self.getattr(req, &path, None)
    }

    fn unlink(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        self.fs.unlink(&parent.join(name))
    }

    fn rmdir(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        self.fs.rmdir(&parent.join(name))
    }

    fn symlink(
        &self,
        req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        target: &Path,
    ) -> ResultEntry {
        let path = parent.join(name);
        self.fs.symlink(target, &path)?;
        self.getattr(req, &path, None)
    }

    fn rename(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        newparent: &Path,
        newname: &OsStr,
    ) -> ResultEmpty {
        self.fs.rename(&parent.join(name), &newparent.join(newname))
    }

    fn link(
        &self,
        _req: RequestInfo,
        path: &Path,
        newparent: &Path,
        newname: &OsStr,
    ) -> ResultEntry {
        self.fs.link(path, &newparent.join(newname))?;
        Err(libc::EPERM)
    }

    fn open(&self, _req: RequestInfo, path: &Path, flags: u32) -> ResultOpen {
        let mut info = FileInfo {
            flags: flags as i32,
            fh: 0,
        };
        self.fs.open(path, &mut info)?;
        Ok((info.fh, info.flags as u32))
    }

    fn read(
        &self,
        _req: RequestInfo,
        _path: &Path,
        fh: u64,
        offset: u64,
        size: u32,
        callback: impl FnOnce(ResultSlice<'_>) -> CallbackResult,
    ) -> CallbackResult {
        let mut buf = vec![0u8; size as usize];
        match self.fs.read(fh, &mut buf, offset as i64) {
            Ok(n) => callback(Ok(&buf[..n])),
            Err(errno) => callback(Err(errno)),
        }
    }

    fn write(
        &self,
        _req: RequestInfo,
        _path: &Path,
        fh: u64,
        offset: u64,
        data: Vec<u8>,
        _flags: u32,
    ) -> ResultWrite {
        self.fs.write(fh, &data, offset as i64).map(|n| n as u32)
    }

    fn flush(&self, _req: RequestInfo, _path: &Path, _fh: u64, _lock_owner: u64) -> ResultEmpty {
        // Encryption happens on the final release, not per flush.
        Ok(())
    }

    fn release(
        &self,
        _req: RequestInfo,
        _path: &Path,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> ResultEmpty {
        self.fs.release(fh);
        Ok(())
    }

    fn opendir(&self, _req: RequestInfo, path: &Path, flags: u32) -> ResultOpen {
        self.fs.opendir(path)?;
        Ok((0, flags))
    }

    fn readdir(&self, _req: RequestInfo, path: &Path, _fh: u64) -> ResultReaddir {
        let mut entries = vec![
            DirectoryEntry {
                name: ".".into(),
                kind: FileType::Directory,
            },
            DirectoryEntry {
                name: "..".into(),
                kind: FileType::Directory,
            },
        ];
        for entry in self.fs.readdir(path)? {
            entries.push(DirectoryEntry {
                name: entry.name,
                kind: match entry.kind {
                    EntryKind::Regular => FileType::RegularFile,
                    EntryKind::Directory => FileType::Directory,
                    EntryKind::Symlink => FileType::Symlink,
                },
            });
        }
        Ok(entries)
    }

    fn releasedir(&self, _req: RequestInfo, path: &Path, _fh: u64, _flags: u32) -> ResultEmpty {
        self.fs.releasedir(path)
    }

    fn statfs(&self, _req: RequestInfo, _path: &Path) -> ResultStatfs {
        let sv = self.fs.statfs()?;
        Ok(statvfs_to_statfs(&sv))
    }

    fn setxattr(
        &self,
        _req: RequestInfo,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        _flags: u32,
        _position: u32,
    ) -> ResultEmpty {
        self.fs.setxattr(path, name, value)
    }

    fn listxattr(&self, _req: RequestInfo, path: &Path, size: u32) -> ResultXattr {
        use std::os::unix::ffi::OsStrExt;

        let mut data = Vec::new();
        for name in self.fs.listxattr(path)? {
            data.extend_from_slice(name.as_bytes());
            data.push(0);
        }

        if size == 0 {
            Ok(Xattr::Size(data.len() as u32))
        } else if size as usize >= data.len() {
            Ok(Xattr::Data(data))
        } else {
            Err(libc::ERANGE)
        }
    }

    fn removexattr(&self, _req: RequestInfo, path: &Path, name: &OsStr) -> ResultEmpty {
        self.fs.removexattr(path, name)
    }

    fn create(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> ResultCreate {
        let path = parent.join(name);
        let mut info = FileInfo {
            flags: flags as i32,
            fh: 0,
        };
        self.fs.create(&path, mode, &mut info)?;
        let st = self.fs.fgetattr(info.fh)?;
        Ok(CreatedEntry {
            ttl: TTL,
            attr: stat_to_fileattr(&st),
            fh: info.fh,
            flags: info.flags as u32,
        })
    }
}

/// Mount the filesystem and serve until unmounted.
pub fn mount(fs: ArmorFs, mountpoint: &Path, threads: usize) -> Result<()> {
    let options = [
        OsStr::new("-o"),
        OsStr::new("fsname=armorfs"),
        OsStr::new("-o"),
        OsStr::new("default_permissions"),
    ];

    tracing::info!("mounting at {}", mountpoint.display());
    let driver = FuseDriver::new(Arc::new(fs));
    fuse_mt::mount(FuseMT::new(driver, threads), &mountpoint, &options)
        .map_err(|e| ArmorfsError::Mount(e.to_string()))?;
    tracing::info!("unmounted");
    Ok(())
}
