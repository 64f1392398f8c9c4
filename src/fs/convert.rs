use fuse_mt::{FileAttr, FileType, Statfs};
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Map std::io::Error to the appropriate libc error code.
/// The raw OS error is the most accurate when available; otherwise fall back
/// to the stable ErrorKind variants.
pub(crate) fn io_error_to_libc(e: &io::Error) -> libc::c_int {
    if let Some(code) = e.raw_os_error() {
        return code;
    }

    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::WriteZero => libc::ENOSPC,
        io::ErrorKind::OutOfMemory => libc::ENOMEM,
        io::ErrorKind::BrokenPipe => libc::EPIPE,
        io::ErrorKind::WouldBlock => libc::EAGAIN,
        io::ErrorKind::UnexpectedEof => libc::EIO,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        _ => libc::EIO,
    }
}

pub(crate) fn mode_to_filetype(mode: libc::mode_t) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFREG => FileType::RegularFile,
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

pub(crate) fn stat_to_fileattr(st: &libc::stat) -> FileAttr {
    FileAttr {
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: timestamp(st.st_atime as i64, st.st_atime_nsec as i64),
        mtime: timestamp(st.st_mtime as i64, st.st_mtime_nsec as i64),
        ctime: timestamp(st.st_ctime as i64, st.st_ctime_nsec as i64),
        crtime: UNIX_EPOCH,
        kind: mode_to_filetype(st.st_mode),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        flags: 0,
    }
}

pub(crate) fn statvfs_to_statfs(sv: &libc::statvfs) -> Statfs {
    Statfs {
        blocks: sv.f_blocks as u64,
        bfree: sv.f_bfree as u64,
        bavail: sv.f_bavail as u64,
        files: sv.f_files as u64,
        ffree: sv.f_ffree as u64,
        bsize: sv.f_bsize as u32,
        namelen: sv.f_namemax as u32,
        frsize: sv.f_frsize as u32,
    }
}

/// Convert an optional timestamp into the form utimensat(2) expects, with
/// `None` mapping to UTIME_OMIT.
pub(crate) fn to_timespec(t: Option<SystemTime>) -> libc::timespec {
    match t {
        Some(ts) => {
            let d = ts.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
            libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            }
        }
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
    }
}
