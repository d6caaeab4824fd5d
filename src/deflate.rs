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

use miniz_oxide::deflate;
use miniz_oxide::{DataFormat, MZError, MZFlush, MZStatus};
use std::io;

/// Incremental zlib-format compressor for a single response body.
pub struct DeflateStream {
    enc: Box<deflate::core::CompressorOxide>,
    total_in: u64,
    finished: bool,
}

impl DeflateStream {
    pub fn new() -> Self {
        let mut enc = Box::new(deflate::core::CompressorOxide::default());

        enc.set_format_and_level(
            DataFormat::Zlib,
            deflate::CompressionLevel::DefaultLevel as u8,
        );

        Self {
            enc,
            total_in: 0,
            finished: false,
        }
    }

    /// Total input bytes consumed so far.
    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    /// True once the stream has been terminated by a finishing call.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Compresses some of `src` into `dest`. With `finish` set, `src` is
    /// the last of the input and the stream trailer is emitted once
    /// everything fits in `dest`. Returns (consumed, written). Callers
    /// must keep offering output space until `is_finished`.
    pub fn compress(
        &mut self,
        src: &[u8],
        dest: &mut [u8],
        finish: bool,
    ) -> Result<(usize, usize), io::Error> {
        // once finished, the caller must stop calling
        if self.finished {
            return Err(io::Error::from(io::ErrorKind::Other));
        }

        let flush = if finish { MZFlush::Finish } else { MZFlush::None };

        let result = deflate::stream::deflate(&mut self.enc, src, dest, flush);

        match result.status {
            Ok(MZStatus::Ok) => {}
            Ok(MZStatus::StreamEnd) => self.finished = true,
            Err(MZError::Buf) => {}
            _ => return Err(io::Error::from(io::ErrorKind::Other)),
        }

        assert!(result.bytes_consumed <= src.len());
        assert!(result.bytes_written <= dest.len());

        self.total_in += result.bytes_consumed as u64;

        Ok((result.bytes_consumed, result.bytes_written))
    }
}

/// Worst-case compressed size for `len` input bytes (zlib's compressBound).
pub fn deflate_bound(len: usize) -> usize {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13
}
