// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::cursor::CodedCursor;
use crate::Error;

/// Format of an input OBF file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// Unknown format - guess the compression based on the leading bytes
    Unknown,

    /// Force an uncompressed OBF file
    Obf,

    /// Force an OBF file with [gzip](https://en.wikipedia.org/wiki/Gzip) compression
    ObfGz,

    /// Force an OBF file with [bzip2](https://en.wikipedia.org/wiki/Bzip2) compression
    ObfBz2,
}

impl FileFormat {
    fn detect(head: &[u8]) -> Self {
        if head.starts_with(&[0x1F, 0x8B]) {
            FileFormat::ObfGz
        } else if head.starts_with(b"BZh") {
            FileFormat::ObfBz2
        } else {
            FileFormat::Obf
        }
    }
}

/// Decompresses `raw` as per `format`, guessing the compression for [FileFormat::Unknown].
pub(crate) fn decompress(raw: Vec<u8>, format: FileFormat) -> io::Result<Vec<u8>> {
    let format = match format {
        FileFormat::Unknown => FileFormat::detect(&raw),
        f => f,
    };

    match format {
        FileFormat::Unknown | FileFormat::Obf => Ok(raw),
        FileFormat::ObfGz => {
            let mut out = Vec::new();
            flate2::read::MultiGzDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
            Ok(out)
        }
        FileFormat::ObfBz2 => {
            let mut out = Vec::new();
            bzip2::read::MultiBzDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

/// One opened OBF file, held in memory and shared between readers.
///
/// Every reader works on its own [CodedCursor] over the shared bytes,
/// so concurrent queries against the same file need no locking.
#[derive(Debug, Clone)]
pub struct ObfFile {
    path: PathBuf,
    data: Arc<[u8]>,
}

impl ObfFile {
    /// Loads an OBF file from disk, decompressing it as per `format`.
    pub fn open<P: AsRef<Path>>(path: P, format: FileFormat) -> Result<Self, Error> {
        let f = File::open(path.as_ref())?;
        let mut file = Self::from_io(f, format)?;
        file.path = path.as_ref().to_path_buf();
        Ok(file)
    }

    /// Loads OBF data from a reader, decompressing it as per `format`.
    pub fn from_io<R: io::Read>(mut reader: R, format: FileFormat) -> Result<Self, Error> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;

        let data = decompress(raw, format)?;
        Ok(Self::from_bytes(data))
    }

    /// Wraps already uncompressed OBF bytes.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            path: PathBuf::new(),
            data: Arc::from(data),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name (without directories), used as the index cache key.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Size of the uncompressed data, in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn cursor(&self) -> CodedCursor<'_> {
        CodedCursor::new(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn gzip_is_detected() {
        let payload = vec![0x08, 0x02, 0x10, 0x05];
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&payload).unwrap();
        let compressed = enc.finish().unwrap();

        let file = ObfFile::from_io(compressed.as_slice(), FileFormat::Unknown).unwrap();
        assert_eq!(file.data(), payload.as_slice());
    }

    #[test]
    fn bzip2_is_detected() {
        let payload = vec![0x08, 0x02, 0x10, 0x05];
        let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        enc.write_all(&payload).unwrap();
        let compressed = enc.finish().unwrap();

        let file = ObfFile::from_io(compressed.as_slice(), FileFormat::Unknown).unwrap();
        assert_eq!(file.data(), payload.as_slice());
    }

    #[test]
    fn plain_passthrough() {
        let file = ObfFile::from_io(&[0x08u8, 0x02][..], FileFormat::Unknown).unwrap();
        assert_eq!(file.size(), 2);
        assert_eq!(file.file_name(), "");
    }
}
