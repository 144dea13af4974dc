use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

struct FdGuard(RawFd);

impl Drop for FdGuard {
    fn drop(&mut self) {
        if self.0 >= 0 {
            unsafe {
                libc::close(self.0);
            }
        }
    }
}

fn cstring(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte")
    })
}

fn check(rc: libc::c_int, what: &str) -> io::Result<libc::c_int> {
    if rc < 0 {
        let err = io::Error::last_os_error();
        return Err(io::Error::new(err.kind(), format!("{what}: {err}")));
    }
    Ok(rc)
}

fn lstat_at(dir_fd: RawFd, name: &CStr) -> io::Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    check(
        unsafe { libc::fstatat(dir_fd, name.as_ptr(), st.as_mut_ptr(), libc::AT_SYMLINK_NOFOLLOW) },
        "fstatat",
    )?;
    Ok(unsafe { st.assume_init() })
}

fn open_dir_at(dir_fd: RawFd, name: &CStr) -> io::Result<FdGuard> {
    let fd = check(
        unsafe {
            libc::openat(
                dir_fd,
                name.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
            )
        },
        "openat",
    )?;
    Ok(FdGuard(fd))
}

/// Names in a directory, excluding `.` and `..`
fn list_dir(dir_fd: RawFd) -> io::Result<Vec<CString>> {
    let iter_fd = check(unsafe { libc::dup(dir_fd) }, "dup")?;
    let dir = unsafe { libc::fdopendir(iter_fd) };
    if dir.is_null() {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(iter_fd);
        }
        return Err(err);
    }

    let mut names = Vec::new();
    loop {
        unsafe {
            *libc::__errno_location() = 0;
        }
        let entry = unsafe { libc::readdir(dir) };
        if entry.is_null() {
            let errno = unsafe { *libc::__errno_location() };
            unsafe {
                libc::closedir(dir);
            }
            if errno != 0 {
                return Err(io::Error::from_raw_os_error(errno));
            }
            break;
        }
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        if name.to_bytes() != b"." && name.to_bytes() != b".." {
            names.push(name.to_owned());
        }
    }
    Ok(names)
}

fn remove_contents(dir_fd: RawFd, root_dev: libc::dev_t) -> io::Result<()> {
    for name in list_dir(dir_fd)? {
        let st = lstat_at(dir_fd, &name)?;
        if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
            if st.st_dev != root_dev {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("refusing to cross a filesystem boundary at {:?}", name),
                ));
            }
            let child = open_dir_at(dir_fd, &name)?;
            remove_contents(child.0, root_dev)?;
            check(
                unsafe { libc::unlinkat(dir_fd, name.as_ptr(), libc::AT_REMOVEDIR) },
                "unlinkat(dir)",
            )?;
        } else {
            check(unsafe { libc::unlinkat(dir_fd, name.as_ptr(), 0) }, "unlinkat")?;
        }
    }
    Ok(())
}

/// Remove a directory tree without following symlinks.
///
/// Scripts control what ends up in their workspace, so a planted symlink must
/// be unlinked rather than traversed. Missing paths are not an error.
pub fn remove_tree_secure(path: &Path) -> io::Result<()> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cannot remove {}", path.display()),
        ));
    };
    let parent_c = cstring(parent.as_os_str().as_bytes())?;
    let name_c = cstring(name.as_bytes())?;

    let parent_fd = FdGuard(check(
        unsafe {
            libc::open(
                parent_c.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
            )
        },
        "open(parent)",
    )?);

    let st = match lstat_at(parent_fd.0, &name_c) {
        Ok(st) => st,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
        let dir = open_dir_at(parent_fd.0, &name_c)?;
        remove_contents(dir.0, st.st_dev)?;
        drop(dir);
        check(
            unsafe { libc::unlinkat(parent_fd.0, name_c.as_ptr(), libc::AT_REMOVEDIR) },
            "unlinkat(root)",
        )?;
    } else {
        check(unsafe { libc::unlinkat(parent_fd.0, name_c.as_ptr(), 0) }, "unlinkat(root)")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_nested_tree() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("run");
        std::fs::create_dir_all(target.join("a/b")).unwrap();
        std::fs::write(target.join("a/b/file.txt"), b"x").unwrap();
        std::fs::write(target.join("top.py"), b"print(1)").unwrap();

        remove_tree_secure(&target).unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn does_not_follow_symlinks() {
        let root = tempfile::tempdir().unwrap();
        let outside = root.path().join("outside");
        std::fs::create_dir(&outside).unwrap();
        std::fs::write(outside.join("keep.txt"), b"keep").unwrap();

        let target = root.path().join("run");
        std::fs::create_dir(&target).unwrap();
        std::os::unix::fs::symlink(&outside, target.join("link")).unwrap();

        remove_tree_secure(&target).unwrap();
        assert!(!target.exists());
        assert!(outside.join("keep.txt").exists());
    }

    #[test]
    fn missing_path_is_ok() {
        let root = tempfile::tempdir().unwrap();
        assert!(remove_tree_secure(&root.path().join("gone")).is_ok());
    }
}
