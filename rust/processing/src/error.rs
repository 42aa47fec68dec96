// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the transformation engine.

use std::path::PathBuf;

use city_lite_model::{ShapeCategory, SlotKind};

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort processing of the current document.
///
/// Dangling references are not errors; they are logged and left in place.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Model, stream or wire-format failure.
    #[error(transparent)]
    Model(#[from] city_lite_model::Error),

    /// A geometry was about to be placed into a slot that does not admit it.
    #[error("cannot place {found} geometry '{geometry}' into a {expected} slot")]
    IncompatibleSlot {
        geometry: String,
        expected: SlotKind,
        found: ShapeCategory,
    },

    /// No transformation is known for a reference system.
    #[error("unsupported reference system '{srs}' on {feature}")]
    UnsupportedCrs { srs: String, feature: String },

    /// A resource path escapes the configured base directory.
    #[error("resource {} lies outside of {}", .path.display(), .base.display())]
    UnsafePath { path: PathBuf, base: PathBuf },

    /// Copying an external resource failed.
    #[error("failed to copy {} to {}: {source}", .from.display(), .to.display())]
    ResourceCopy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A resource worker terminated abnormally.
    #[error("resource worker panicked")]
    WorkerPanicked,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
