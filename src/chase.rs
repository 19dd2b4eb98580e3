//! Root-anchored symlink-safe path resolution.
//!
//! Resolution here treats a caller-supplied directory as the filesystem
//! root, the way a chroot would: absolute paths and absolute symlink
//! targets are interpreted relative to that root, and `..` clamps at it.
//! The walk holds `O_PATH` file descriptors the whole way down and opens
//! every component with `O_NOFOLLOW`, following symlinks only by reading
//! them manually, so a hostile tree cannot redirect the lookup outside the
//! root.

use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use rustix::fs::{fstat, open, openat, readlinkat, FileType, Mode, OFlags};
use rustix::io::Errno;

use crate::util::proc_self_fd;

/// Limit on the total number of symlinks followed in one resolution.
const CHASE_MAX_SYMLINKS: u32 = 32;

fn open_dir_path(path: &Path) -> io::Result<OwnedFd> {
    Ok(open(
        path,
        OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    )?)
}

/// Splits `path` on slashes and prepends the components to the work queue.
/// Empty components (from duplicate or trailing slashes) are dropped.
fn push_front_components(todo: &mut VecDeque<OsString>, path: &OsStr) {
    for part in path.as_bytes().split(|b| *b == b'/').rev() {
        if !part.is_empty() {
            todo.push_front(OsStr::from_bytes(part).to_os_string());
        }
    }
}

/// Resolve `path` with `root` (default `/`) acting as the filesystem root.
///
/// Returns the canonical path (including the root prefix) and an `O_PATH`
/// file descriptor for the final component.  The descriptor is
/// traversal-safe but not readable; use [`upgrade_to_readable`] to get an
/// actual stream.
///
/// A leading separator in `path` means the *root*, not the host `/`, and
/// the same holds for every absolute symlink target encountered on the
/// way.  `..` never climbs above the root.  More than
/// [`CHASE_MAX_SYMLINKS`] symlink traversals fails with `ELOOP`.
pub fn chase(root: Option<&Path>, path: impl AsRef<Path>) -> io::Result<(PathBuf, OwnedFd)> {
    let root_path = root.unwrap_or(Path::new("/"));
    let root_fd = open_dir_path(root_path)?;

    let mut todo = VecDeque::new();
    push_front_components(&mut todo, path.as_ref().as_os_str());

    let mut fd = root_fd.try_clone()?;
    let mut done: Vec<OsString> = Vec::new();
    let mut symlinks = 0u32;

    while let Some(part) = todo.pop_front() {
        if part == "." {
            continue;
        }

        if part == ".." {
            // Clamp at the root: physically we are never above it, so ".."
            // from there is a no-op.
            if done.pop().is_some() {
                fd = openat(
                    &fd,
                    c"..",
                    OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC,
                    Mode::empty(),
                )?;
            }
            continue;
        }

        let child = openat(
            &fd,
            part.as_os_str(),
            OFlags::PATH | OFlags::NOFOLLOW | OFlags::CLOEXEC,
            Mode::empty(),
        )?;

        let st = fstat(&child)?;
        if FileType::from_raw_mode(st.st_mode) == FileType::Symlink {
            symlinks += 1;
            if symlinks > CHASE_MAX_SYMLINKS {
                return Err(Errno::LOOP.into());
            }

            let target = readlinkat(&child, "", [])?;
            if target.as_bytes().first() == Some(&b'/') {
                // Absolute target: restart at the root.
                fd = root_fd.try_clone()?;
                done.clear();
            }
            push_front_components(&mut todo, OsStr::from_bytes(target.as_bytes()));
            continue;
        }

        // A regular component becomes the new anchor.  If it is not a
        // directory and components remain, the next openat() reports
        // ENOTDIR, which is the right answer.
        done.push(part);
        fd = child;
    }

    let mut resolved = root_path.to_path_buf();
    for part in &done {
        resolved.push(part);
    }
    Ok((resolved, fd))
}

/// Like [`chase`], but requires the result to be a directory and reopens it
/// readable so that it can be iterated with `Dir::read_from`.
pub fn chase_and_open_directory(
    root: Option<&Path>,
    path: impl AsRef<Path>,
) -> io::Result<(PathBuf, OwnedFd)> {
    let (resolved, fd) = chase(root, path)?;

    let st = fstat(&fd)?;
    if FileType::from_raw_mode(st.st_mode) != FileType::Directory {
        return Err(Errno::NOTDIR.into());
    }

    let dirfd = openat(
        &fd,
        c".",
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    )?;
    Ok((resolved, dirfd))
}

/// Convert an `O_PATH` fd from resolution into a proper readable stream.
///
/// `O_PATH` descriptors cannot be read; the reopen goes through the
/// `/proc/self/fd` magic links.  The intermediate descriptor is consumed
/// and closed whether or not the reopen succeeds.
pub fn upgrade_to_readable(fd: OwnedFd) -> io::Result<File> {
    let readable = open(
        proc_self_fd(&fd),
        OFlags::RDONLY | OFlags::CLOEXEC | OFlags::NOCTTY,
        Mode::empty(),
    )?;
    Ok(File::from(readable))
}
