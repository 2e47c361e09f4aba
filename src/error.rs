// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::io;
use std::sync::Arc;

/// Error which can occur when decoding OBF files, reading the index cache
/// or loading a routing configuration.
///
/// Only malformed data and configuration problems are errors. Data-integrity
/// anomalies (like an out-of-range string table index) are logged and repaired,
/// while "route not found" and cancellation are ordinary results.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] Arc<io::Error>),

    #[error("protobuf: {0}")]
    Protobuf(#[from] Arc<protobuf::Error>),

    #[error("xml: {0}")]
    Xml(#[from] Arc<quick_xml::Error>),

    #[error("unexpected end of data at offset {0}")]
    Truncated(usize),

    #[error("malformed varint at offset {0}")]
    MalformedVarint(usize),

    #[error("read of {len} byte(s) at offset {offset} crosses the enclosing limit at {limit}")]
    LimitExceeded {
        offset: usize,
        len: usize,
        limit: usize,
    },

    #[error("unsupported wire type {wire_type} of field {field} at offset {offset}")]
    UnsupportedWireType {
        field: u32,
        wire_type: u32,
        offset: usize,
    },

    #[error("tree node at offset {0} lies outside of its parent")]
    ChildOutsideParent(usize),

    #[error("versionConfirm {confirm} does not match version {version}")]
    VersionMismatch { version: u32, confirm: u32 },

    #[error("file has no versionConfirm trailer")]
    MissingVersionConfirm,

    #[error("invalid routing configuration: {0}")]
    Config(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<protobuf::Error> for Error {
    fn from(e: protobuf::Error) -> Self {
        Error::Protobuf(Arc::new(e))
    }
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        Error::Xml(Arc::new(e))
    }
}
