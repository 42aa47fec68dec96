// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for model operations.

use crate::keys::{AppearanceKey, FeatureKey, GeometryKey, SurfaceDataKey};

/// Result type alias for model operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building, walking or streaming the model.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Feature key not found in the arena.
    #[error("feature not found: {0:?}")]
    FeatureNotFound(FeatureKey),

    /// Geometry key not found in the arena.
    #[error("geometry not found: {0:?}")]
    GeometryNotFound(GeometryKey),

    /// Appearance key not found in the arena.
    #[error("appearance not found: {0:?}")]
    AppearanceNotFound(AppearanceKey),

    /// Surface data key not found in the arena.
    #[error("surface data not found: {0:?}")]
    SurfaceDataNotFound(SurfaceDataKey),

    /// A level of detail outside 0..=4.
    #[error("invalid level of detail: {0}")]
    InvalidLod(u8),

    /// A geometry property must carry exactly one of inline geometry,
    /// href or implicit geometry.
    #[error("malformed geometry property '{property}' on feature {feature}: {found} values present, expected exactly one")]
    MalformedProperty {
        feature: String,
        property: String,
        found: usize,
    },

    /// A slot addressed a position its container does not have.
    #[error("invalid slot: {0}")]
    InvalidSlot(String),

    /// The document does not start with a header line.
    #[error("document {0} has no header line")]
    MissingHeader(String),

    /// A line of a JSON-lines document could not be decoded.
    #[error("invalid JSON on line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// I/O failure while reading or writing a document.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}
