//! The filesystem façade: path translation, the shared handle tables, and
//! the per-callback contracts.
//!
//! Metadata operations pass straight through to the backing directory; data
//! operations go through the handle table so every caller holding the same
//! logical path shares one plaintext buffer.

mod convert;
pub mod mount;
mod open_file;

use std::collections::HashMap;
use std::ffi::{CString, OsString};
use std::fs::{self, OpenOptions};
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

pub(crate) use convert::io_error_to_libc;
use convert::to_timespec;
use open_file::OpenFile;

use crate::error::{ArmorfsError, Result};
use crate::recipient::Recipient;

/// Mirror of the kernel's per-open bookkeeping handed through open/create.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileInfo {
    pub flags: i32,
    pub fh: u64,
}

/// A directory entry surfaced by `readdir`.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: EntryKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
}

/// Everything needed to serve a mount, fixed before serving begins.
#[derive(Debug)]
pub struct MountOptions {
    /// Directory holding the encrypted backing files.
    pub backing_root: PathBuf,
    /// True iff the secret key is available and decryption may be attempted.
    pub read_enabled: bool,
    /// Keys that all newly encrypted content is addressed to.
    pub recipients: Vec<Recipient>,
}

struct Tables {
    next_fh: u64,
    by_handle: HashMap<u64, OpenFile>,
    by_path: HashMap<PathBuf, u64>,
    recipients: Arc<Vec<Recipient>>,
}

impl Tables {
    fn alloc_fh(&mut self) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }
}

pub struct ArmorFs {
    /// Open handle on the backing directory; relative opens resolve beneath
    /// it. Immutable after construction.
    root: fs::File,
    root_path: PathBuf,
    read_enabled: bool,
    tables: Mutex<Tables>,
}

impl ArmorFs {
    pub fn new(opts: MountOptions) -> Result<Self> {
        if opts.recipients.is_empty() {
            return Err(ArmorfsError::Config(
                "at least one recipient is required".to_string(),
            ));
        }

        let root = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY)
            .open(&opts.backing_root)
            .map_err(|e| match e.raw_os_error() {
                Some(code) if code == libc::ENOTDIR => {
                    ArmorfsError::NotADirectory(opts.backing_root.clone())
                }
                _ => ArmorfsError::Io(e),
            })?;

        Ok(ArmorFs {
            root,
            root_path: opts.backing_root,
            read_enabled: opts.read_enabled,
            tables: Mutex::new(Tables {
                next_fh: 0,
                by_handle: HashMap::new(),
                by_path: HashMap::new(),
                recipients: Arc::new(opts.recipients),
            }),
        })
    }

    /// Replace the recipient list. Open files hold a reference to the list
    /// they were opened under, so swapping it with files open is refused.
    pub fn set_recipients(&self, recipients: Vec<Recipient>) -> Result<()> {
        if recipients.is_empty() {
            return Err(ArmorfsError::Config(
                "at least one recipient is required".to_string(),
            ));
        }
        let mut tables = self.tables.lock();
        if !tables.by_handle.is_empty() {
            return Err(ArmorfsError::RecipientsInUse(tables.by_handle.len()));
        }
        tables.recipients = Arc::new(recipients);
        Ok(())
    }

    /// Host path for passthrough operations on the translated path.
    fn backing_path(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("/") {
            Ok(rel) => self.root_path.join(rel),
            Err(_) => self.root_path.join(path),
        }
    }

    /// Write-only opens are upgraded to read/write when decryption is
    /// possible, so a later truncate or rewrite can load the plaintext.
    fn make_rdwr(&self, flags: i32) -> i32 {
        if self.read_enabled && flags & libc::O_ACCMODE == libc::O_WRONLY {
            (flags & !libc::O_ACCMODE) | libc::O_RDWR
        } else {
            flags
        }
    }

    fn open_backing(&self, path: &Path, flags: i32, mode: u32) -> io::Result<fs::File> {
        let rel = rel_cstring(path)?;
        // SAFETY: rel is NUL-terminated and the root descriptor stays open
        // for the lifetime of self.
        let fd = unsafe {
            libc::openat(
                self.root.as_raw_fd(),
                rel.as_ptr(),
                flags | libc::O_CLOEXEC,
                mode as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just opened and has no other owner.
        Ok(unsafe { fs::File::from_raw_fd(fd) })
    }

    /// Open with the read/write upgrade, falling back to the flags as given
    /// when the upgrade is refused with EACCES (write-only permission bits).
    fn open_upgraded(&self, path: &Path, flags: i32, mode: u32) -> std::result::Result<fs::File, libc::c_int> {
        match self.open_backing(path, self.make_rdwr(flags), mode) {
            Ok(file) => Ok(file),
            Err(e)
                if self.read_enabled
                    && flags & libc::O_ACCMODE == libc::O_WRONLY
                    && e.raw_os_error() == Some(libc::EACCES) =>
            {
                self.open_backing(path, flags, mode)
                    .map_err(|e| io_error_to_libc(&e))
            }
            Err(e) => Err(io_error_to_libc(&e)),
        }
    }

    // ── Data-path callbacks ──────────────────────────────────────────────

    pub fn create(
        &self,
        path: &Path,
        mode: u32,
        info: &mut FileInfo,
    ) -> std::result::Result<(), libc::c_int> {
        tracing::debug!("create({:?}, mode={:o}, flags={:#x})", path, mode, info.flags);
        info.flags |= libc::O_CREAT;

        let mut tables = self.tables.lock();
        if let Some(&fh) = tables.by_path.get(path) {
            // A create raced an existing open of the same path: share the
            // state rather than aliasing two buffers to one file.
            let state = tables.by_handle.get_mut(&fh).expect("tables agree");
            state.refs += 1;
            info.fh = fh;
            return Ok(());
        }

        let file = self.open_upgraded(path, info.flags, mode)?;

        let fh = tables.alloc_fh();
        let recipients = tables.recipients.clone();
        // A just-created file is empty, so its (empty) plaintext is known.
        let state = OpenFile::new(file, info.flags, path.to_path_buf(), true, recipients);
        tables.by_path.insert(path.to_path_buf(), fh);
        tables.by_handle.insert(fh, state);
        info.fh = fh;
        Ok(())
    }

    pub fn open(&self, path: &Path, info: &mut FileInfo) -> std::result::Result<(), libc::c_int> {
        tracing::debug!("open({:?}, flags={:#x})", path, info.flags);
        let mut flags = info.flags;

        let mut tables = self.tables.lock();
        if let Some(&fh) = tables.by_path.get(path) {
            // Already open: all callers share one state; the new flags are
            // ignored in favor of the first opener's.
            let state = tables.by_handle.get_mut(&fh).expect("tables agree");
            state.refs += 1;
            info.fh = fh;
            return Ok(());
        }

        let access_mode = flags & libc::O_ACCMODE;
        let for_reading = access_mode == libc::O_RDWR || access_mode == libc::O_RDONLY;
        if !self.read_enabled && for_reading && flags & libc::O_CREAT != 0 {
            // Without the secret key a pre-existing file could never be
            // served, so insist the open creates it.
            flags |= libc::O_EXCL;
        }

        let file = self.open_upgraded(path, flags, 0)?;

        if !self.read_enabled && access_mode == libc::O_RDONLY && flags & libc::O_CREAT == 0 {
            return Err(libc::EACCES);
        }

        // A zero-length backing file has a known (empty) plaintext; anything
        // else defers decryption until a read needs it. This is what lets
        // write-only callers grow a fresh file.
        let buffer_set = file.metadata().map(|m| m.len() == 0).unwrap_or(false);

        let fh = tables.alloc_fh();
        let recipients = tables.recipients.clone();
        let state = OpenFile::new(file, flags, path.to_path_buf(), buffer_set, recipients);
        tables.by_path.insert(path.to_path_buf(), fh);
        tables.by_handle.insert(fh, state);
        info.fh = fh;
        Ok(())
    }

    pub fn read(
        &self,
        fh: u64,
        buf: &mut [u8],
        offset: i64,
    ) -> std::result::Result<usize, libc::c_int> {
        let mut tables = self.tables.lock();
        let state = tables.by_handle.get_mut(&fh).ok_or(libc::EBADF)?;

        if offset < 0 {
            return Err(libc::EINVAL);
        }
        let offset = offset as usize;

        if self.read_enabled {
            state.load_buffer()?;
        } else if !state.buffer_set {
            // The buffer only mirrors content this mount wrote itself.
            return Err(libc::EACCES);
        }

        if state.buffer.len() <= offset {
            return Ok(0);
        }
        let n = (state.buffer.len() - offset).min(buf.len());
        buf[..n].copy_from_slice(&state.buffer[offset..offset + n]);
        Ok(n)
    }

    pub fn write(
        &self,
        fh: u64,
        data: &[u8],
        offset: i64,
    ) -> std::result::Result<usize, libc::c_int> {
        let mut tables = self.tables.lock();
        let state = tables.by_handle.get_mut(&fh).ok_or(libc::EBADF)?;

        if data.is_empty() {
            return Ok(0);
        }
        if offset < 0 {
            return Err(libc::EINVAL);
        }
        let offset = offset as usize;

        // No disk I/O here: the buffer is authoritative until release.
        let new_len = state.buffer.len().max(offset + data.len());
        state.buffer.resize(new_len, 0);
        state.buffer[offset..offset + data.len()].copy_from_slice(data);
        state.dirty = true;
        Ok(data.len())
    }

    pub fn ftruncate(&self, fh: u64, offset: i64) -> std::result::Result<(), libc::c_int> {
        tracing::debug!("ftruncate(fh={}, offset={})", fh, offset);
        let mut tables = self.tables.lock();
        self.truncate_handle(&mut tables, fh, offset)
    }

    fn truncate_handle(
        &self,
        tables: &mut Tables,
        fh: u64,
        offset: i64,
    ) -> std::result::Result<(), libc::c_int> {
        let state = tables.by_handle.get_mut(&fh).ok_or(libc::EBADF)?;

        if offset < 0 {
            Err(libc::EINVAL)
        } else if offset == 0 {
            state.file()?.set_len(0).map_err(|e| io_error_to_libc(&e))?;
            state.buffer.clear();
            state.buffer_set = true;
            // Still dirty: release must rewrite a valid (empty) container.
            state.dirty = true;
            Ok(())
        } else if self.read_enabled {
            // Decrypt, resize, lazily re-encrypt.
            state.load_buffer()?;
            state.buffer.resize(offset as usize, 0);
            state.dirty = true;
            Ok(())
        } else {
            Err(libc::EACCES)
        }
    }

    pub fn truncate(&self, path: &Path, offset: i64) -> std::result::Result<(), libc::c_int> {
        tracing::debug!("truncate({:?}, offset={})", path, offset);
        if offset < 0 {
            return Err(libc::EINVAL);
        }

        let mut tables = self.tables.lock();
        if let Some(&fh) = tables.by_path.get(path) {
            return self.truncate_handle(&mut tables, fh, offset);
        }

        if offset == 0 {
            // An empty backing file is a valid container on its own.
            let c_path = path_cstring(&self.backing_path(path)).map_err(|e| io_error_to_libc(&e))?;
            // SAFETY: c_path is NUL-terminated.
            let rc = unsafe { libc::truncate(c_path.as_ptr(), 0) };
            if rc != 0 {
                return Err(io_error_to_libc(&io::Error::last_os_error()));
            }
            return Ok(());
        }
        if !self.read_enabled {
            return Err(libc::EACCES);
        }

        // Not open: decrypt, truncate, and re-encrypt in one unit through a
        // transient state that never enters the tables.
        let file = self
            .open_backing(path, libc::O_RDWR, 0)
            .map_err(|e| io_error_to_libc(&e))?;
        let recipients = tables.recipients.clone();
        let mut state = OpenFile::new(file, libc::O_RDWR, path.to_path_buf(), false, recipients);
        state.load_buffer()?;
        state.buffer.resize(offset as usize, 0);
        state.dirty = true;
        state.close()
    }

    /// Drop one reference; the last one out flushes and destroys the state.
    /// The kernel ignores errors here, so flush failures are only logged.
    pub fn release(&self, fh: u64) {
        tracing::debug!("release(fh={})", fh);
        let mut tables = self.tables.lock();
        let Some(state) = tables.by_handle.get_mut(&fh) else {
            return;
        };

        state.refs -= 1;
        if state.refs > 0 {
            return;
        }

        let mut state = tables.by_handle.remove(&fh).expect("entry exists");
        tables.by_path.remove(&state.path);
        if let Err(errno) = state.close() {
            tracing::warn!("flush of {:?} failed on release: errno {}", state.path, errno);
        }
    }

    pub fn rename(&self, old: &Path, new: &Path) -> std::result::Result<(), libc::c_int> {
        tracing::debug!("rename({:?} -> {:?})", old, new);
        // The open-file tables change if and only if the host rename lands,
        // so both happen under the same lock acquisition.
        let mut tables = self.tables.lock();

        fs::rename(self.backing_path(old), self.backing_path(new))
            .map_err(|e| io_error_to_libc(&e))?;

        if let Some(fh) = tables.by_path.remove(old) {
            tables.by_path.insert(new.to_path_buf(), fh);
            if let Some(state) = tables.by_handle.get_mut(&fh) {
                state.path = new.to_path_buf();
            }
        }
        Ok(())
    }

    pub fn getattr(&self, path: &Path) -> std::result::Result<libc::stat, libc::c_int> {
        let mut tables = self.tables.lock();
        if let Some(&fh) = tables.by_path.get(path) {
            return self.stat_handle(&mut tables, fh);
        }
        drop(tables);

        let mut st =
            lstat(&self.backing_path(path)).map_err(|e| io_error_to_libc(&e))?;
        if !self.read_enabled && st.st_mode & libc::S_IFMT != libc::S_IFDIR {
            // Advertise up front that reads will not be served, instead of
            // letting callers find out after opening.
            st.st_mode &= !(libc::S_IRUSR | libc::S_IRGRP | libc::S_IROTH);
        }
        Ok(st)
    }

    pub fn fgetattr(&self, fh: u64) -> std::result::Result<libc::stat, libc::c_int> {
        let mut tables = self.tables.lock();
        self.stat_handle(&mut tables, fh)
    }

    fn stat_handle(
        &self,
        tables: &mut Tables,
        fh: u64,
    ) -> std::result::Result<libc::stat, libc::c_int> {
        let state = tables.by_handle.get_mut(&fh).ok_or(libc::EBADF)?;
        let mut st = fstat(state.file()?).map_err(|e| io_error_to_libc(&e))?;

        if self.read_enabled {
            state.load_buffer()?;
        }

        if state.buffer_set {
            st.st_size = state.buffer.len() as libc::off_t;
        } else if state.flags & libc::O_APPEND != 0 {
            // Ciphertext on disk plus the pending appended plaintext.
            st.st_size += state.buffer.len() as libc::off_t;
        }
        // Otherwise the ciphertext size is the best answer available.
        Ok(st)
    }

    /// Hard links would alias two logical paths to one ciphertext and one
    /// shared buffer; refused outright.
    pub fn link(&self, _old: &Path, _new: &Path) -> std::result::Result<(), libc::c_int> {
        Err(libc::EPERM)
    }

    pub fn access(&self, path: &Path, mode: i32) -> std::result::Result<(), libc::c_int> {
        let rel = rel_cstring(path).map_err(|e| io_error_to_libc(&e))?;
        // SAFETY: rel is NUL-terminated; the root descriptor is open.
        let rc = unsafe { libc::faccessat(self.root.as_raw_fd(), rel.as_ptr(), mode, 0) };
        if rc != 0 {
            return Err(io_error_to_libc(&io::Error::last_os_error()));
        }
        if mode & libc::R_OK != 0 && !self.read_enabled {
            return Err(libc::EACCES);
        }
        Ok(())
    }

    // ── Passthrough callbacks ────────────────────────────────────────────

    pub fn chmod(&self, path: &Path, mode: u32) -> std::result::Result<(), libc::c_int> {
        fs::set_permissions(self.backing_path(path), fs::Permissions::from_mode(mode))
            .map_err(|e| io_error_to_libc(&e))
    }

    pub fn chown(
        &self,
        path: &Path,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> std::result::Result<(), libc::c_int> {
        let c_path = path_cstring(&self.backing_path(path)).map_err(|e| io_error_to_libc(&e))?;
        // chown(2): an ID given as -1 is left unchanged.
        // SAFETY: c_path is NUL-terminated.
        let rc = unsafe {
            libc::lchown(
                c_path.as_ptr(),
                uid.unwrap_or(u32::MAX),
                gid.unwrap_or(u32::MAX),
            )
        };
        if rc != 0 {
            return Err(io_error_to_libc(&io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> std::result::Result<(), libc::c_int> {
        fs::DirBuilder::new()
            .mode(mode)
            .create(self.backing_path(path))
            .map_err(|e| io_error_to_libc(&e))
    }

    pub fn rmdir(&self, path: &Path) -> std::result::Result<(), libc::c_int> {
        fs::remove_dir(self.backing_path(path)).map_err(|e| io_error_to_libc(&e))
    }

    pub fn unlink(&self, path: &Path) -> std::result::Result<(), libc::c_int> {
        fs::remove_file(self.backing_path(path)).map_err(|e| io_error_to_libc(&e))
    }

    pub fn symlink(&self, target: &Path, link: &Path) -> std::result::Result<(), libc::c_int> {
        std::os::unix::fs::symlink(target, self.backing_path(link))
            .map_err(|e| io_error_to_libc(&e))
    }

    pub fn readlink(&self, path: &Path) -> std::result::Result<Vec<u8>, libc::c_int> {
        let target = fs::read_link(self.backing_path(path)).map_err(|e| io_error_to_libc(&e))?;
        Ok(target.into_os_string().into_encoded_bytes())
    }

    pub fn opendir(&self, path: &Path) -> std::result::Result<(), libc::c_int> {
        let meta = fs::metadata(self.backing_path(path)).map_err(|e| io_error_to_libc(&e))?;
        if !meta.is_dir() {
            return Err(libc::ENOTDIR);
        }
        Ok(())
    }

    /// List a directory, keeping only the entry types the filesystem can
    /// represent: regular files, directories, and symlinks. Devices, pipes,
    /// and sockets are skipped.
    pub fn readdir(&self, path: &Path) -> std::result::Result<Vec<DirEntry>, libc::c_int> {
        let entries = fs::read_dir(self.backing_path(path)).map_err(|e| io_error_to_libc(&e))?;

        let mut result = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error_to_libc(&e))?;
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let kind = if file_type.is_file() {
                EntryKind::Regular
            } else if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_symlink() {
                EntryKind::Symlink
            } else {
                continue;
            };
            result.push(DirEntry {
                name: entry.file_name(),
                kind,
            });
        }
        Ok(result)
    }

    pub fn releasedir(&self, _path: &Path) -> std::result::Result<(), libc::c_int> {
        Ok(())
    }

    pub fn statfs(&self) -> std::result::Result<libc::statvfs, libc::c_int> {
        let mut sv = MaybeUninit::<libc::statvfs>::zeroed();
        // SAFETY: the root descriptor is open; sv is a valid out pointer.
        let rc = unsafe { libc::fstatvfs(self.root.as_raw_fd(), sv.as_mut_ptr()) };
        if rc != 0 {
            return Err(io_error_to_libc(&io::Error::last_os_error()));
        }
        // SAFETY: fstatvfs succeeded and initialized sv.
        Ok(unsafe { sv.assume_init() })
    }

    pub fn utimens(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> std::result::Result<(), libc::c_int> {
        let rel = rel_cstring(path).map_err(|e| io_error_to_libc(&e))?;
        let times = [to_timespec(atime), to_timespec(mtime)];
        // SAFETY: rel is NUL-terminated; times points at two timespecs.
        let rc = unsafe {
            libc::utimensat(self.root.as_raw_fd(), rel.as_ptr(), times.as_ptr(), 0)
        };
        if rc != 0 {
            return Err(io_error_to_libc(&io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn listxattr(&self, path: &Path) -> std::result::Result<Vec<OsString>, libc::c_int> {
        let names = xattr::list(self.backing_path(path))
            .map_err(|e| io_error_to_libc(&e))?;
        Ok(names.collect())
    }

    pub fn setxattr(
        &self,
        path: &Path,
        name: &std::ffi::OsStr,
        value: &[u8],
    ) -> std::result::Result<(), libc::c_int> {
        xattr::set(self.backing_path(path), name, value).map_err(|e| io_error_to_libc(&e))
    }

    pub fn removexattr(
        &self,
        path: &Path,
        name: &std::ffi::OsStr,
    ) -> std::result::Result<(), libc::c_int> {
        xattr::remove(self.backing_path(path), name).map_err(|e| io_error_to_libc(&e))
    }

    /// Number of logical files currently open. Mostly useful to tests and
    /// diagnostics.
    pub fn open_state_count(&self) -> usize {
        self.tables.lock().by_handle.len()
    }
}

/// `/a/b` → `./a/b`, as a C string for the *at() family of syscalls.
fn rel_cstring(path: &Path) -> io::Result<CString> {
    let mut bytes = Vec::with_capacity(path.as_os_str().len() + 1);
    bytes.push(b'.');
    bytes.extend_from_slice(path.as_os_str().as_bytes());
    CString::new(bytes).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn path_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn lstat(path: &Path) -> io::Result<libc::stat> {
    let c_path = path_cstring(path)?;
    let mut st = MaybeUninit::<libc::stat>::zeroed();
    // SAFETY: c_path is NUL-terminated; st is a valid out pointer.
    let rc = unsafe { libc::lstat(c_path.as_ptr(), st.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: lstat succeeded and initialized st.
    Ok(unsafe { st.assume_init() })
}

fn fstat(file: &fs::File) -> io::Result<libc::stat> {
    let mut st = MaybeUninit::<libc::stat>::zeroed();
    // SAFETY: the descriptor is open; st is a valid out pointer.
    let rc = unsafe { libc::fstat(file.as_raw_fd(), st.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fstat succeeded and initialized st.
    Ok(unsafe { st.assume_init() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_paths_translate_under_the_root() {
        assert_eq!(
            rel_cstring(Path::new("/a/b")).unwrap().as_bytes(),
            b"./a/b"
        );
        assert_eq!(rel_cstring(Path::new("/")).unwrap().as_bytes(), b"./");
    }

    #[test]
    fn embedded_nul_is_rejected() {
        use std::ffi::OsStr;
        let bad = Path::new(OsStr::from_bytes(b"/a\0b"));
        assert!(rel_cstring(bad).is_err());
    }
}
