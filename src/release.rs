//! Locating and loading `os-release` and `extension-release` descriptors.
//!
//! The base OS descriptor is searched at `/etc/os-release` then
//! `/usr/lib/os-release` (overridable wholesale via `SYSTEMD_OS_RELEASE`).
//! An extension descriptor lives at
//! `/usr/lib/extension-release.d/extension-release.<NAME>`; when the exact
//! name is missing — image files get renamed on deployment — the directory
//! is scanned for a single fallback candidate instead.  A candidate can opt
//! out of that fuzzy matching with the `user.extension-release.strict`
//! extended attribute, and finding two eligible candidates fails the whole
//! lookup rather than guessing.
//!
//! All path resolution is anchored at the caller's root via [`crate::chase`],
//! so descriptors of a mounted image are read even when its symlinks point
//! at absolute paths.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, BufReader};
use std::mem::MaybeUninit;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use chrono::{Local, LocalResult, NaiveDate, TimeZone};
use log::{debug, warn};
use rustix::fs::{accessat, fstat, getxattr, openat, Access, AtFlags, Dir, FileType, Mode, OFlags, CWD};
use rustix::io::Errno;
use thiserror::Error;

use crate::chase::{chase, chase_and_open_directory, upgrade_to_readable};
use crate::envfile::{parse_env_file, parse_env_file_into};
use crate::name::image_name_is_valid;
use crate::util::{parse_boolean, proc_self_fd};

/// Directory in which system extension images place their descriptor.
pub const EXTENSION_RELEASE_DIR: &str = "/usr/lib/extension-release.d";

/// File name prefix of descriptors inside [`EXTENSION_RELEASE_DIR`].
pub const EXTENSION_RELEASE_PREFIX: &str = "extension-release.";

/// Candidate locations of the base OS descriptor, in search order.
pub const OS_RELEASE_PATHS: [&str; 2] = ["/etc/os-release", "/usr/lib/os-release"];

/// Environment variable naming an exact base-descriptor path, overriding
/// [`OS_RELEASE_PATHS`] wholesale.
pub const OS_RELEASE_ENV: &str = "SYSTEMD_OS_RELEASE";

/// Extended attribute by which an image author demands exact-name matching.
const STRICT_XATTR: &str = "user.extension-release.strict";

/// The identity keys retained by [`load_os_release_pairs_with_prefix`].
const ID_FIELDS: [&str; 4] = ["ID", "VERSION_ID", "BUILD_ID", "VARIANT_ID"];

/// Failure to resolve a release descriptor.
#[derive(Debug, Error)]
pub enum OpenReleaseError {
    /// The caller-supplied extension name is not usable as an identity.
    #[error("invalid extension name {0:?}")]
    InvalidName(String),
    /// No descriptor exists under the given root.
    #[error("no release file found under {0:?}")]
    NotFound(PathBuf),
    /// The fallback scan matched more than one eligible candidate.
    #[error("ambiguous extension-release files in {dir:?}: {first:?} vs {second:?}")]
    Ambiguous {
        dir: PathBuf,
        first: String,
        second: String,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<Errno> for OpenReleaseError {
    fn from(err: Errno) -> Self {
        Self::Io(err.into())
    }
}

/// A descriptor lookup: which root, which descriptor, and how strictly.
///
/// The query only carries options; what the caller actually pays for is
/// chosen by the method used to run it — [`path()`](Self::path) resolves
/// without ever opening a readable stream, [`open()`](Self::open) yields
/// the stream, [`open_with_path()`](Self::open_with_path) both.
#[derive(Debug, Clone)]
pub struct ReleaseQuery<'a> {
    root: Option<&'a Path>,
    extension: Option<&'a str>,
    relax_extension_check: bool,
    os_release_override: Option<PathBuf>,
}

impl<'a> ReleaseQuery<'a> {
    /// Query for the base OS descriptor under `root` (`None` for the live
    /// system root).
    pub fn os_release(root: Option<&'a Path>) -> Self {
        Self {
            root,
            extension: None,
            relax_extension_check: false,
            os_release_override: None,
        }
    }

    /// Like [`os_release`](Self::os_release), but honoring the
    /// `SYSTEMD_OS_RELEASE` override from the process environment.  This is
    /// the only place the crate reads the environment.
    pub fn os_release_from_env(root: Option<&'a Path>) -> Self {
        Self::os_release(root)
            .with_os_release_override(std::env::var_os(OS_RELEASE_ENV).map(PathBuf::from))
    }

    /// Query for the descriptor of the extension named `extension`.
    pub fn extension(root: Option<&'a Path>, extension: &'a str) -> Self {
        Self {
            root,
            extension: Some(extension),
            relax_extension_check: false,
            os_release_override: None,
        }
    }

    /// Whether a candidate carrying `user.extension-release.strict=true`
    /// may still be used as a fallback match.
    pub fn relaxed(mut self, relax: bool) -> Self {
        self.relax_extension_check = relax;
        self
    }

    /// Use `path` as the base descriptor instead of searching
    /// [`OS_RELEASE_PATHS`].  The path is still resolved under the root.
    pub fn with_os_release_override(mut self, path: Option<PathBuf>) -> Self {
        self.os_release_override = path;
        self
    }

    /// Resolve to the canonical descriptor path.  No readable stream is
    /// opened.
    pub fn path(&self) -> Result<PathBuf, OpenReleaseError> {
        let (path, _fd) = self.locate()?;
        Ok(path)
    }

    /// Resolve and open the descriptor for reading.
    pub fn open(&self) -> Result<File, OpenReleaseError> {
        let (_path, fd) = self.locate()?;
        Ok(upgrade_to_readable(fd)?)
    }

    /// Resolve to both the canonical path and a readable stream.
    pub fn open_with_path(&self) -> Result<(PathBuf, File), OpenReleaseError> {
        let (path, fd) = self.locate()?;
        Ok((path, upgrade_to_readable(fd)?))
    }

    /// Resolve the descriptor and parse all of its key/value pairs.
    pub fn load_pairs(&self) -> Result<Vec<(String, String)>, OpenReleaseError> {
        let file = self.open()?;
        Ok(parse_env_file(BufReader::new(file))?)
    }

    /// Resolve the descriptor and fill the given `(key, slot)` pairs from
    /// it.  Keys missing from the descriptor leave their slot untouched.
    pub fn parse_into(
        &self,
        slots: &mut [(&str, &mut Option<String>)],
    ) -> Result<(), OpenReleaseError> {
        let file = self.open()?;
        Ok(parse_env_file_into(BufReader::new(file), slots)?)
    }

    fn root_path(&self) -> &Path {
        self.root.unwrap_or(Path::new("/"))
    }

    /// The resolution core: canonical path plus a traversal-safe `O_PATH`
    /// fd for the selected descriptor.
    fn locate(&self) -> Result<(PathBuf, OwnedFd), OpenReleaseError> {
        match self.extension {
            Some(extension) => self.locate_extension(extension),
            None => self.locate_os_release(),
        }
    }

    fn locate_os_release(&self) -> Result<(PathBuf, OwnedFd), OpenReleaseError> {
        if let Some(override_path) = &self.os_release_override {
            // The override names the exact file; nothing falls back behind it.
            return match chase(self.root, override_path) {
                Ok(found) => Ok(found),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    Err(OpenReleaseError::NotFound(self.root_path().to_path_buf()))
                }
                Err(err) => Err(err.into()),
            };
        }

        for path in OS_RELEASE_PATHS {
            match chase(self.root, path) {
                Ok(found) => return Ok(found),
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(OpenReleaseError::NotFound(self.root_path().to_path_buf()))
    }

    fn locate_extension(&self, extension: &str) -> Result<(PathBuf, OwnedFd), OpenReleaseError> {
        if !image_name_is_valid(extension) {
            return Err(OpenReleaseError::InvalidName(extension.to_string()));
        }

        let exact = format!("{EXTENSION_RELEASE_DIR}/{EXTENSION_RELEASE_PREFIX}{extension}");
        match chase(self.root, &exact) {
            Ok(found) => return Ok(found),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("{exact} not found under {:?}, scanning for a fallback", self.root_path());
            }
            Err(err) => return Err(err.into()),
        }

        // The image file name might have been mangled on deployment, so
        // accept a lone differently-named descriptor instead.  The strict
        // xattr lets an image author refuse this.
        let (dir_path, dirfd) = match chase_and_open_directory(self.root, EXTENSION_RELEASE_DIR) {
            Ok(found) => found,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(OpenReleaseError::NotFound(self.root_path().to_path_buf()))
            }
            Err(err) => return Err(err.into()),
        };

        let mut selected: Option<(PathBuf, OwnedFd, String)> = None;

        for entry in Dir::read_from(&dirfd)? {
            let entry = entry?;
            if !matches!(entry.file_type(), FileType::RegularFile | FileType::Unknown) {
                continue;
            }

            let file_name = OsStr::from_bytes(entry.file_name().to_bytes());
            let Some(image_name) = file_name
                .as_bytes()
                .strip_prefix(EXTENSION_RELEASE_PREFIX.as_bytes())
            else {
                continue;
            };
            if !image_name_is_valid(OsStr::from_bytes(image_name)) {
                debug!("{dir_path:?}/{file_name:?} is not a valid extension-release file name, ignoring");
                continue;
            }

            // The directory listing just confirmed this entry exists, so
            // failing to open it is a real error, not a skippable candidate.
            let fd = openat(
                &dirfd,
                file_name,
                OFlags::PATH | OFlags::NOFOLLOW | OFlags::CLOEXEC,
                Mode::empty(),
            )?;

            // Really ensure it is a regular file after we open it.
            if FileType::from_raw_mode(fstat(&fd)?.st_mode) != FileType::RegularFile {
                debug!("{dir_path:?}/{file_name:?} is not a regular file, ignoring");
                continue;
            }

            if !self.relax_extension_check
                && strict_xattr_requires_exact_match(&fd, &dir_path, file_name)
            {
                continue;
            }

            // Keep scanning after a match: a second eligible candidate makes
            // the fallback ambiguous, and that must fail the whole lookup.
            if let Some((_, _, first)) = &selected {
                return Err(OpenReleaseError::Ambiguous {
                    dir: dir_path,
                    first: first.clone(),
                    second: file_name.to_string_lossy().into_owned(),
                });
            }

            let path = dir_path.join(file_name);
            selected = Some((path, fd, file_name.to_string_lossy().into_owned()));
        }

        match selected {
            Some((path, fd, name)) => {
                debug!("Falling back to extension-release file {name:?}");
                Ok((path, fd))
            }
            None => Err(OpenReleaseError::NotFound(self.root_path().to_path_buf())),
        }
    }
}

/// Whether the candidate demands exact-name matching via the
/// `user.extension-release.strict` xattr.
///
/// The attribute is advisory: absent, unreadable or unparseable values all
/// leave the candidate eligible for fallback.
fn strict_xattr_requires_exact_match(fd: &OwnedFd, dir: &Path, file_name: &OsStr) -> bool {
    // fgetxattr() rejects O_PATH fds, so read through /proc/self/fd.  The
    // symlink-following flavor is correct here: the magic link points at
    // the already-opened regular file.
    let mut buffer = [MaybeUninit::new(0u8); 256];
    let value = match getxattr(proc_self_fd(fd), STRICT_XATTR, &mut buffer) {
        Ok((value, _)) => value,
        Err(Errno::NODATA) => {
            debug!("{dir:?}/{file_name:?} does not have {STRICT_XATTR} xattr, ignoring");
            return false;
        }
        Err(err) => {
            debug!("{dir:?}/{file_name:?}: failed to read {STRICT_XATTR} xattr, ignoring: {err}");
            return false;
        }
    };

    let Ok(value) = std::str::from_utf8(value) else {
        debug!("{dir:?}/{file_name:?}: {STRICT_XATTR} xattr is not valid UTF-8, ignoring");
        return false;
    };
    match parse_boolean(value) {
        Ok(true) => {
            debug!("{dir:?}/{file_name:?}: {STRICT_XATTR} attribute is true, ignoring file");
            true
        }
        Ok(false) => {
            debug!("{dir:?}/{file_name:?}: {STRICT_XATTR} attribute is false");
            false
        }
        Err(err) => {
            debug!("{dir:?}/{file_name:?}: failed to parse {STRICT_XATTR} xattr, ignoring: {err}");
            false
        }
    }
}

/// Load all key/value pairs of the base OS descriptor under `root`,
/// honoring the `SYSTEMD_OS_RELEASE` override.
pub fn load_os_release_pairs(root: Option<&Path>) -> Result<Vec<(String, String)>, OpenReleaseError> {
    ReleaseQuery::os_release_from_env(root).load_pairs()
}

/// Load all key/value pairs of the named extension's descriptor.
pub fn load_extension_release_pairs(
    root: Option<&Path>,
    extension: &str,
    relax_extension_check: bool,
) -> Result<Vec<(String, String)>, OpenReleaseError> {
    ReleaseQuery::extension(root, extension)
        .relaxed(relax_extension_check)
        .load_pairs()
}

/// Load the stable identity fields of the base descriptor, each key
/// lower-cased and prepended with `prefix`.
///
/// Only `ID`, `VERSION_ID`, `BUILD_ID` and `VARIANT_ID` are retained.
pub fn load_os_release_pairs_with_prefix(
    root: Option<&Path>,
    prefix: &str,
) -> Result<Vec<(String, String)>, OpenReleaseError> {
    let mut prefixed = Vec::new();
    for (key, value) in load_os_release_pairs(root)? {
        if !ID_FIELDS.contains(&key.as_str()) {
            continue;
        }
        prefixed.push((format!("{prefix}{}", key.to_ascii_lowercase()), value));
    }
    Ok(prefixed)
}

/// Fill the given `(key, slot)` pairs from the base OS descriptor.
pub fn parse_os_release(
    root: Option<&Path>,
    slots: &mut [(&str, &mut Option<String>)],
) -> Result<(), OpenReleaseError> {
    ReleaseQuery::os_release_from_env(root).parse_into(slots)
}

/// Fill the given `(key, slot)` pairs from the named extension's descriptor.
pub fn parse_extension_release(
    root: Option<&Path>,
    extension: &str,
    relax_extension_check: bool,
    slots: &mut [(&str, &mut Option<String>)],
) -> Result<(), OpenReleaseError> {
    ReleaseQuery::extension(root, extension)
        .relaxed(relax_extension_check)
        .parse_into(slots)
}

/// Check whether `path` holds a system extension tree (with an extension
/// name) or an OS tree (without).
///
/// `path` itself must exist: that failure is reported as an error, so a
/// missing root stays distinguishable from a root that merely carries no
/// descriptor.
pub fn path_is_extension_tree(
    path: &Path,
    extension: Option<&str>,
    relax_extension_check: bool,
) -> Result<bool, OpenReleaseError> {
    accessat(CWD, path, Access::EXISTS, AtFlags::SYMLINK_NOFOLLOW)?;

    let query = match extension {
        Some(name) => ReleaseQuery::extension(Some(path), name).relaxed(relax_extension_check),
        None => ReleaseQuery::os_release_from_env(Some(path)),
    };
    match query.path() {
        Ok(_) => Ok(true),
        Err(OpenReleaseError::NotFound(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

fn report_support_end_problem(quiet: bool, message: std::fmt::Arguments) {
    if quiet {
        debug!("{message}");
    } else {
        warn!("{message}");
    }
}

/// Report whether the OS has passed its declared end of support.
///
/// `support_end` is the raw `SUPPORT_END=` value if the caller already has
/// it handy; otherwise the base descriptor under `root` is consulted.  The
/// value is advisory, so every failure — missing descriptor, missing key,
/// malformed date — degrades to `false` with a diagnostic whose severity
/// follows `quiet`.
pub fn os_release_support_ended(support_end: Option<&str>, quiet: bool, root: Option<&Path>) -> bool {
    let owned;
    let support_end = match support_end {
        Some(value) => value,
        None => {
            let mut value = None;
            if let Err(err) = parse_os_release(root, &mut [("SUPPORT_END", &mut value)]) {
                let quiet = quiet || matches!(err, OpenReleaseError::NotFound(_));
                report_support_end_problem(
                    quiet,
                    format_args!("Failed to read os-release file, ignoring: {err}"),
                );
                return false;
            }
            match value {
                Some(value) => {
                    owned = value;
                    owned.as_str()
                }
                // no end date defined
                None => return false,
            }
        }
    };

    let date = match NaiveDate::parse_from_str(support_end, "%Y-%m-%d") {
        Ok(date) => date,
        Err(err) => {
            report_support_end_problem(
                quiet,
                format_args!("Failed to parse SUPPORT_END= value {support_end:?}, ignoring: {err}"),
            );
            return false;
        }
    };

    // The end-of-life instant is local midnight at the start of the date.
    let eol = match date
        .and_hms_opt(0, 0, 0)
        .map(|midnight| Local.from_local_datetime(&midnight))
    {
        Some(LocalResult::Single(eol)) => eol,
        _ => {
            report_support_end_problem(
                quiet,
                format_args!("Failed to convert SUPPORT_END= value {support_end:?}, ignoring"),
            );
            return false;
        }
    };

    Local::now() > eol
}
