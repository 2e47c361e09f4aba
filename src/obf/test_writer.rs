// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Minimal OBF writer used to build exact byte fixtures in tests.

use super::cursor::{zigzag_encode32, zigzag_encode64};

#[derive(Debug, Default)]
pub struct ObfWriter {
    buf: Vec<u8>,
}

impl ObfWriter {
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn raw_varint(&mut self, mut v: u64) {
        loop {
            let b = (v & 0x7F) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.push(b);
                return;
            }
            self.buf.push(b | 0x80);
        }
    }

    pub fn tag(&mut self, field: u32, wire_type: u32) {
        self.raw_varint(((field << 3) | wire_type) as u64);
    }

    pub fn uint32(&mut self, field: u32, v: u32) {
        self.tag(field, 0);
        self.raw_varint(v as u64);
    }

    pub fn uint64(&mut self, field: u32, v: u64) {
        self.tag(field, 0);
        self.raw_varint(v);
    }

    pub fn sint32(&mut self, field: u32, v: i32) {
        self.tag(field, 0);
        self.raw_varint(zigzag_encode32(v) as u64);
    }

    pub fn sint64(&mut self, field: u32, v: i64) {
        self.tag(field, 0);
        self.raw_varint(zigzag_encode64(v));
    }

    pub fn string(&mut self, field: u32, s: &str) {
        self.bytes(field, s.as_bytes());
    }

    pub fn bytes(&mut self, field: u32, b: &[u8]) {
        self.tag(field, 2);
        self.raw_varint(b.len() as u64);
        self.buf.extend_from_slice(b);
    }

    /// Writes a varint-length-delimited nested message.
    pub fn message<F: FnOnce(&mut ObfWriter)>(&mut self, field: u32, f: F) {
        let mut inner = ObfWriter::default();
        f(&mut inner);
        self.bytes(field, &inner.buf);
    }

    /// Writes a nested message framed with a 4-byte big-endian length.
    /// Returns the absolute offset of the message body.
    pub fn be_message<F: FnOnce(&mut ObfWriter)>(&mut self, field: u32, f: F) -> usize {
        let mut inner = ObfWriter::default();
        f(&mut inner);
        self.tag(field, 5);
        self.buf.extend_from_slice(&(inner.buf.len() as u32).to_be_bytes());
        let offset = self.buf.len();
        self.buf.extend_from_slice(&inner.buf);
        offset
    }

    /// Writes a fixed32 big-endian value under a wire-type-5 key.
    pub fn be_uint32(&mut self, field: u32, v: u32) {
        self.tag(field, 5);
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Starts a big-endian framed message in place. Returns the position of the
    /// length bytes; the body starts 4 bytes later. Close with [ObfWriter::end_be].
    pub fn begin_be(&mut self, field: u32) -> usize {
        self.tag(field, 5);
        let pos = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        pos
    }

    pub fn end_be(&mut self, len_pos: usize) {
        let len = (self.buf.len() - len_pos - 4) as u32;
        self.buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
    }

    /// Writes a wire-type-5 key with a zeroed value, returning the position of the value.
    pub fn be_uint32_placeholder(&mut self, field: u32) -> usize {
        self.tag(field, 5);
        let pos = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        pos
    }

    pub fn patch_be_uint32(&mut self, pos: usize, v: u32) {
        self.buf[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }

    pub fn raw(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }
}
