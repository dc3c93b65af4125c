//! Agent code-module installers.
//!
//! URL installs fetch a zip from the tenant deployment API, keyed by
//! version. Image installs pull a digest-pinned OCI image and unpack its
//! layers. Both are idempotent against an already populated target
//! directory and leave nothing behind on failure.

pub mod image;
pub mod symlink;
pub mod url;

pub use image::ImageInstaller;
pub use url::{AgentSource, UrlInstaller};

/// Scratch file name for an in-flight installer download.
pub(crate) const DOWNLOAD_FILE: &str = "download.tmp";
