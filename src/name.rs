//! Validation of image and extension names.
//!
//! Names arrive from two untrusted directions: as caller-supplied extension
//! names, and as suffixes of directory entries found during the fallback
//! scan.  Both are only ever used after passing [`image_name_is_valid`].

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

/// NAME_MAX on every filesystem we care about.
const NAME_MAX: usize = 255;

/// Whether `name` is usable as a single path component: non-empty, at most
/// [`NAME_MAX`] bytes, no slash, no NUL, and not one of the "." / ".."
/// special entries.
pub fn filename_is_valid(name: impl AsRef<OsStr>) -> bool {
    let bytes = name.as_ref().as_bytes();

    if bytes.is_empty() || bytes.len() > NAME_MAX {
        return false;
    }
    if bytes == b"." || bytes == b".." {
        return false;
    }
    !bytes.contains(&b'/') && !bytes.contains(&0)
}

/// Whether `name` is safe to treat as an image or extension identity.
///
/// On top of [`filename_is_valid`] this rejects ASCII control characters,
/// invalid UTF-8, and the `.#` prefix used for atomically-created temporary
/// files (such a name is an in-progress write, not a stable identity).
pub fn image_name_is_valid(name: impl AsRef<OsStr>) -> bool {
    let name = name.as_ref();

    if !filename_is_valid(name) {
        return false;
    }
    if name.as_bytes().iter().any(u8::is_ascii_control) {
        return false;
    }
    let Some(name) = name.to_str() else {
        return false;
    };
    !name.starts_with(".#")
}

#[cfg(test)]
mod test {
    use std::os::unix::ffi::OsStrExt;

    use super::*;

    #[test]
    fn test_filename_is_valid() {
        assert!(filename_is_valid("foo"));
        assert!(filename_is_valid("foo.raw"));
        assert!(filename_is_valid(".hidden"));
        assert!(filename_is_valid("a".repeat(255)));

        assert!(!filename_is_valid(""));
        assert!(!filename_is_valid("."));
        assert!(!filename_is_valid(".."));
        assert!(!filename_is_valid("foo/bar"));
        assert!(!filename_is_valid("/foo"));
        assert!(!filename_is_valid("a".repeat(256)));
        assert!(!filename_is_valid(std::ffi::OsStr::from_bytes(b"fo\0o")));
    }

    #[test]
    fn test_image_name_is_valid() {
        assert!(image_name_is_valid("myext"));
        assert!(image_name_is_valid("my-ext_2"));
        assert!(image_name_is_valid("MyExt 1.2"));
        // a leading dot alone is fine, only the temp-file marker is not
        assert!(image_name_is_valid(".myext"));

        // path separators
        assert!(!image_name_is_valid("my/ext"));
        assert!(!image_name_is_valid("../ext"));
        // control characters
        assert!(!image_name_is_valid("my\text"));
        assert!(!image_name_is_valid("my\next"));
        assert!(!image_name_is_valid("my\x7fext"));
        // atomic-write temp file marker
        assert!(!image_name_is_valid(".#myext"));
        // invalid UTF-8
        assert!(!image_name_is_valid(std::ffi::OsStr::from_bytes(
            b"my\xffext"
        )));
        // specials
        assert!(!image_name_is_valid(""));
        assert!(!image_name_is_valid("."));
        assert!(!image_name_is_valid(".."));
    }
}
