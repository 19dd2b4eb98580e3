//! Resolution and validation of OS and system-extension identity descriptors.
//!
//! An OS image is identified by an `os-release` file and a system extension
//! image by `/usr/lib/extension-release.d/extension-release.<NAME>`, both
//! simple `KEY=VALUE` text files.  This crate locates the correct descriptor
//! under an arbitrary root directory — resolving symlinks safely so that
//! nothing can escape the root — and exposes the parsed content.
//!
//! The interesting part is the lookup for extensions: the exact file name is
//! tried first, and if the image file name was mangled on deployment the
//! descriptor directory is scanned for a single fallback candidate, gated by
//! the `user.extension-release.strict` extended attribute and a hard
//! uniqueness requirement.  See [`release::ReleaseQuery`].

pub mod chase;
pub mod envfile;
pub mod name;
pub mod release;
mod util;
