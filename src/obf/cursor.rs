// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Forward cursor over OBF bytes.
//!
//! OBF uses protobuf-style tags and varints, but a subset of length-delimited
//! fields (sections, map levels, tree boxes) is framed with a 4-byte
//! big-endian length instead of a varint, so that readers can seek over them
//! without decoding. Such fields carry wire type 5 ([WireType::Fixed32]).
//! Which fields are framed that way is decided by field number, never by
//! looking at the wire type alone.

use crate::Error;

/// Protobuf wire type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    Fixed64,
    LengthDelimited,
    StartGroup,
    EndGroup,
    /// Either a plain fixed32 or, in OBF, a big-endian length followed by that many bytes.
    Fixed32,
}

impl WireType {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Varint),
            1 => Some(Self::Fixed64),
            2 => Some(Self::LengthDelimited),
            3 => Some(Self::StartGroup),
            4 => Some(Self::EndGroup),
            5 => Some(Self::Fixed32),
            _ => None,
        }
    }
}

/// A decoded field key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub field: u32,
    pub wire_type: WireType,
}

/// Sequential cursor over a byte slice with a stack of nested limits.
///
/// Positions are absolute offsets into the underlying slice (usually a whole file),
/// which makes the offsets stored in the file directly usable with [CodedCursor::seek].
/// Limits are kept as absolute end positions; [CodedCursor::push_limit] returns the
/// previous one, which must be handed back to [CodedCursor::pop_limit].
#[derive(Debug, Clone)]
pub struct CodedCursor<'a> {
    data: &'a [u8],
    pos: usize,
    limit: usize,
}

impl<'a> CodedCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            limit: data.len(),
        }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Length of the whole underlying slice.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn bytes_until_limit(&self) -> usize {
        self.limit - self.pos
    }

    /// Moves the cursor to an absolute offset, which must not be past the current limit.
    pub fn seek(&mut self, offset: usize) -> Result<(), Error> {
        if offset > self.limit {
            return Err(Error::LimitExceeded {
                offset,
                len: 0,
                limit: self.limit,
            });
        }
        self.pos = offset;
        Ok(())
    }

    /// Restricts reads to the next `len` bytes. Returns the previous limit.
    pub fn push_limit(&mut self, len: usize) -> Result<usize, Error> {
        let end = self.pos.checked_add(len).unwrap_or(usize::MAX);
        if end > self.limit {
            return Err(Error::LimitExceeded {
                offset: self.pos,
                len,
                limit: self.limit,
            });
        }
        let old = self.limit;
        self.limit = end;
        Ok(old)
    }

    /// Restores a limit returned by [CodedCursor::push_limit].
    #[inline]
    pub fn pop_limit(&mut self, old_limit: usize) {
        debug_assert!(old_limit >= self.limit);
        self.limit = old_limit;
    }

    fn ensure(&self, len: usize) -> Result<(), Error> {
        if self.pos + len > self.limit {
            if self.limit == self.data.len() {
                Err(Error::Truncated(self.pos))
            } else {
                Err(Error::LimitExceeded {
                    offset: self.pos,
                    len,
                    limit: self.limit,
                })
            }
        } else {
            Ok(())
        }
    }

    pub fn skip(&mut self, len: usize) -> Result<(), Error> {
        self.ensure(len)?;
        self.pos += len;
        Ok(())
    }

    /// Skips everything up to the current limit.
    #[inline]
    pub fn skip_to_limit(&mut self) {
        self.pos = self.limit;
    }

    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8], Error> {
        self.ensure(len)?;
        let b = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(b)
    }

    /// Reads the next field key, returning `None` once the current limit is reached.
    /// A zero key also ends the message, as in protobuf.
    pub fn read_tag(&mut self) -> Result<Option<Tag>, Error> {
        if self.pos >= self.limit {
            return Ok(None);
        }

        let offset = self.pos;
        let raw = self.read_varint32()?;
        if raw == 0 {
            return Ok(None);
        }

        let field = raw >> 3;
        match WireType::from_raw(raw & 7) {
            Some(wire_type) => Ok(Some(Tag { field, wire_type })),
            None => Err(Error::UnsupportedWireType {
                field,
                wire_type: raw & 7,
                offset,
            }),
        }
    }

    pub fn read_varint64(&mut self) -> Result<u64, Error> {
        let start = self.pos;
        let mut result: u64 = 0;
        for shift in (0..70).step_by(7) {
            if self.pos >= self.limit {
                return Err(if self.limit == self.data.len() {
                    Error::Truncated(start)
                } else {
                    Error::MalformedVarint(start)
                });
            }
            let b = self.data[self.pos];
            self.pos += 1;
            result |= ((b & 0x7F) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(Error::MalformedVarint(start))
    }

    /// Reads a varint and truncates it to 32 bits, like protobuf's `ReadVarint32`.
    #[inline]
    pub fn read_varint32(&mut self) -> Result<u32, Error> {
        self.read_varint64().map(|v| v as u32)
    }

    #[inline]
    pub fn read_sint32(&mut self) -> Result<i32, Error> {
        self.read_varint32().map(zigzag_decode32)
    }

    #[inline]
    pub fn read_sint64(&mut self) -> Result<i64, Error> {
        self.read_varint64().map(zigzag_decode64)
    }

    /// Reads a 4-byte network-order integer.
    pub fn read_big_endian_int(&mut self) -> Result<u32, Error> {
        let b = self.read_raw(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a varint length prefix.
    #[inline]
    pub fn read_length(&mut self) -> Result<usize, Error> {
        self.read_varint32().map(|l| l as usize)
    }

    /// Reads a varint-length-prefixed UTF-8 string. Invalid sequences are replaced.
    pub fn read_string(&mut self) -> Result<String, Error> {
        let len = self.read_length()?;
        let raw = self.read_raw(len)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    /// Skips the value of a field which the caller does not understand.
    /// Wire type 5 is a big-endian length followed by that many bytes.
    pub fn skip_unknown_field(&mut self, tag: Tag) -> Result<(), Error> {
        match tag.wire_type {
            WireType::Varint => self.read_varint64().map(|_| ()),
            WireType::Fixed64 => self.skip(8),
            WireType::LengthDelimited => {
                let len = self.read_length()?;
                self.skip(len)
            }
            WireType::Fixed32 => {
                let len = self.read_big_endian_int()? as usize;
                self.skip(len)
            }
            WireType::StartGroup | WireType::EndGroup => Err(Error::UnsupportedWireType {
                field: tag.field,
                wire_type: if tag.wire_type == WireType::StartGroup { 3 } else { 4 },
                offset: self.pos,
            }),
        }
    }

    /// Runs `f` inside a varint-length-delimited region, and skips whatever `f` left unread.
    pub fn with_length_limit<T, F>(&mut self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Self) -> Result<T, Error>,
    {
        let len = self.read_length()?;
        let old = self.push_limit(len)?;
        let result = f(self)?;
        self.skip_to_limit();
        self.pop_limit(old);
        Ok(result)
    }
}

#[inline]
pub fn zigzag_decode32(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

#[inline]
pub fn zigzag_decode64(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

#[inline]
pub fn zigzag_encode32(v: i32) -> u32 {
    ((v << 1) ^ (v >> 31)) as u32
}

#[inline]
pub fn zigzag_encode64(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}
