/*
 * Copyright (C) 2026 the zipline authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt::{self, Write as _};
use std::io::{self, Read, Write};

// growable byte buffer with independent producer/consumer cursors. the
// producer appends at `end`, the consumer drains from `start`, and both
// cursors rewind to zero once the content is fully drained. capacity only
// ever grows.
pub struct Buffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes that can be written before the buffer would need to grow.
    pub fn write_avail(&self) -> usize {
        self.buf.len() - self.end
    }

    /// Grows the buffer so at least `size` bytes can be written.
    pub fn ensure_write_avail(&mut self, size: usize) {
        let avail = self.write_avail();

        if avail < size {
            let new_len = self.buf.len() + (size - avail);
            self.buf.resize(new_len, 0);
        }
    }

    pub fn write_buf(&mut self) -> &mut [u8] {
        let len = self.buf.len();

        &mut self.buf[self.end..len]
    }

    pub fn write_commit(&mut self, amount: usize) {
        assert!(self.end + amount <= self.buf.len());

        self.end += amount;
    }

    /// Bytes available to the consumer.
    pub fn read_avail(&self) -> usize {
        self.end - self.start
    }

    pub fn read_buf(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub fn read_commit(&mut self, amount: usize) {
        assert!(self.start + amount <= self.end);

        self.start += amount;

        // rewind once drained so the full capacity is writable again
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Reads from `r` into the writable region and commits what was read.
    pub fn write_from<R: Read>(&mut self, r: &mut R) -> Result<usize, io::Error> {
        let size = r.read(self.write_buf())?;

        self.write_commit(size);

        Ok(size)
    }

    /// Formats `value` into the writable region, growing at most once if the
    /// first attempt doesn't fit. Returns the number of bytes appended.
    pub fn write_display(&mut self, value: &dyn fmt::Display) -> usize {
        let mut w = SliceWriter::new(self.write_buf());

        if write!(w, "{}", value).is_ok() {
            let size = w.written();
            self.write_commit(size);

            return size;
        }

        // didn't fit. format out-of-line to learn the size, then grow once
        let s = value.to_string();
        self.ensure_write_avail(s.len());
        self.write_buf()[..s.len()].copy_from_slice(s.as_bytes());
        self.write_commit(s.len());

        s.len()
    }

    /// One-line occupancy summary for diagnostic dumps.
    pub fn stats(&self) -> String {
        format!(
            "cap={} in_avail={} out_avail={}",
            self.buf.len(),
            self.write_avail(),
            self.read_avail()
        )
    }
}

impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        self.ensure_write_avail(buf.len());
        self.write_buf()[..buf.len()].copy_from_slice(buf);
        self.write_commit(buf.len());

        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}

struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> SliceWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn written(&self) -> usize {
        self.pos
    }
}

impl fmt::Write for SliceWriter<'_> {
    fn write_str(&mut self, s: &str) -> Result<(), fmt::Error> {
        if self.pos + s.len() > self.buf.len() {
            return Err(fmt::Error);
        }

        self.buf[self.pos..(self.pos + s.len())].copy_from_slice(s.as_bytes());
        self.pos += s.len();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursors() {
        let mut b = Buffer::new(8);
        assert_eq!(b.capacity(), 8);
        assert_eq!(b.write_avail(), 8);
        assert_eq!(b.read_avail(), 0);

        b.write_buf()[..5].copy_from_slice(b"hello");
        b.write_commit(5);
        assert_eq!(b.write_avail(), 3);
        assert_eq!(b.read_buf(), b"hello");

        b.read_commit(2);
        assert_eq!(b.read_buf(), b"llo");
        assert_eq!(b.write_avail(), 3);

        // draining rewinds both cursors
        b.read_commit(3);
        assert_eq!(b.read_avail(), 0);
        assert_eq!(b.write_avail(), 8);
    }

    #[test]
    fn test_grow() {
        let mut b = Buffer::new(4);
        b.write_buf().copy_from_slice(b"abcd");
        b.write_commit(4);
        b.read_commit(1);

        // grows by exactly the shortfall, preserving content
        b.ensure_write_avail(6);
        assert_eq!(b.capacity(), 10);
        assert_eq!(b.read_buf(), b"bcd");
        assert_eq!(b.write_avail(), 6);

        // no-op when there's already room
        b.ensure_write_avail(3);
        assert_eq!(b.capacity(), 10);
    }

    #[test]
    fn test_write_display() {
        let mut b = Buffer::new(4);

        let size = b.write_display(&format_args!("{}-{}", 1, 2));
        assert_eq!(size, 3);
        assert_eq!(b.read_buf(), b"1-2");
        assert_eq!(b.capacity(), 4);

        // doesn't fit in the remaining byte, grows once
        let size = b.write_display(&format_args!("{:>8}", "x"));
        assert_eq!(size, 8);
        assert_eq!(b.read_buf(), b"1-2       x");
        assert_eq!(b.capacity(), 11);
    }

    #[test]
    fn test_write_from() {
        let mut b = Buffer::new(8);
        let mut src = io::Cursor::new(b"abc".to_vec());

        let size = b.write_from(&mut src).unwrap();
        assert_eq!(size, 3);
        assert_eq!(b.read_buf(), b"abc");
    }

    #[test]
    #[should_panic]
    fn test_overcommit() {
        let mut b = Buffer::new(4);
        b.write_commit(5);
    }

    #[test]
    #[should_panic]
    fn test_overconsume() {
        let mut b = Buffer::new(4);
        b.write_commit(2);
        b.read_commit(3);
    }
}
