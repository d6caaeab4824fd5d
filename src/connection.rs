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

use crate::accesslog::AccessLogHandle;
use crate::buffer::Buffer;
use crate::deflate::{deflate_bound, DeflateStream};
use crate::event::Poller;
use crate::router::Router;
use crate::timer::TimerSet;
use crate::watcher::Watcher;
use arrayvec::ArrayString;
use log::debug;
use mio::net::TcpStream;
use std::cmp;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Largest request head we'll buffer. A head that doesn't complete within
/// this is an error and the connection is closed.
pub const REQ_HEAD_MAX: usize = 8192;

// "\r\n" + 16 hex digits + "\r\n", or the 7-byte terminal chunk
const CHUNK_HDR_MAX: usize = 20;

/// The readiness sources a connection subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    SockRead,
    SockWrite,
    FileRead,
    Timeout,
}

pub const SOURCE_KINDS: [SourceKind; 4] = [
    SourceKind::SockRead,
    SourceKind::SockWrite,
    SourceKind::FileRead,
    SourceKind::Timeout,
];

/// Payload of an idle-timeout timer entry. The generation guards against
/// slab key reuse; the deadline is the validation token checked when the
/// dispatch entry finally runs.
pub struct TimerEvent {
    pub conn_key: usize,
    pub conn_generation: u64,
    pub deadline: Instant,
}

/// Per-worker collaborators the handlers need.
pub struct ConnCtx<'a> {
    pub timers: &'a mut TimerSet<TimerEvent>,
    pub router: &'a Router,
    pub log: &'a AccessLogHandle,
    pub idle_timeout: Duration,
}

struct DeflateState {
    stream: DeflateStream,
    buf: Buffer,
}

/// One client connection: a state machine advanced by readiness dispatch.
/// Four sources drive it: socket readable, socket writable, file readable
/// (synthesized, regular files don't poll), and the idle timeout.
pub struct Connection {
    key: usize,
    generation: u64,
    sock: TcpStream,
    peer_addr: SocketAddr,

    cmd_buf: [u8; REQ_HEAD_MAX],
    cmd_len: usize,

    file: Option<File>,
    file_size: u64,
    file_read: u64,
    status: u16,

    file_b: Buffer,
    resp_b: Buffer,
    deflate: Option<DeflateState>,

    chunk_remaining: usize,
    chunk_hdr: ArrayString<CHUNK_HDR_MAX>,
    chunk_hdr_pos: usize,
    needs_zero_chunk: bool,

    sd_rd: Watcher,
    sd_wr: Watcher,
    fd_rd: Watcher,
    timeo: Watcher,

    files_served: u32,
    total_written: u64,
    timeout_at: Option<Instant>,
    fired_deadline: Option<Instant>,

    queued_entries: u32,
    destroy_guard: bool,
}

impl Connection {
    pub fn new(key: usize, generation: u64, sock: TcpStream, peer_addr: SocketAddr) -> Self {
        let mut sd_rd = Watcher::new();
        sd_rd.arm();

        // armed up front since the socket registration is permanent, but
        // disabled until there's a response to write
        let mut sd_wr = Watcher::new();
        sd_wr.arm();
        sd_wr.disable();

        Self {
            key,
            generation,
            sock,
            peer_addr,
            cmd_buf: [0; REQ_HEAD_MAX],
            cmd_len: 0,
            file: None,
            file_size: 0,
            file_read: 0,
            status: 0,
            file_b: Buffer::new(0),
            resp_b: Buffer::new(0),
            deflate: None,
            chunk_remaining: 0,
            chunk_hdr: ArrayString::new(),
            chunk_hdr_pos: 0,
            needs_zero_chunk: false,
            sd_rd,
            sd_wr,
            fd_rd: Watcher::new(),
            timeo: Watcher::new(),
            files_served: 0,
            total_written: 0,
            timeout_at: None,
            fired_deadline: None,
            queued_entries: 0,
            destroy_guard: false,
        }
    }

    pub fn key(&self) -> usize {
        self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn watcher(&self, kind: SourceKind) -> &Watcher {
        match kind {
            SourceKind::SockRead => &self.sd_rd,
            SourceKind::SockWrite => &self.sd_wr,
            SourceKind::FileRead => &self.fd_rd,
            SourceKind::Timeout => &self.timeo,
        }
    }

    pub fn watcher_mut(&mut self, kind: SourceKind) -> &mut Watcher {
        match kind {
            SourceKind::SockRead => &mut self.sd_rd,
            SourceKind::SockWrite => &mut self.sd_wr,
            SourceKind::FileRead => &mut self.fd_rd,
            SourceKind::Timeout => &mut self.timeo,
        }
    }

    pub fn mark_queued(&mut self, kind: SourceKind) {
        let w = self.watcher_mut(kind);

        assert!(!w.is_queued());
        w.set_queued(true);

        self.queued_entries += 1;
    }

    pub fn mark_dequeued(&mut self, kind: SourceKind) {
        assert!(self.queued_entries > 0);

        self.watcher_mut(kind).set_queued(false);
        self.queued_entries -= 1;
    }

    /// True once every source is gone and no dispatch entries remain in
    /// flight.
    pub fn can_destroy(&self) -> bool {
        !self.sd_rd.is_present()
            && !self.sd_wr.is_present()
            && !self.fd_rd.is_present()
            && !self.timeo.is_present()
            && self.queued_entries == 0
    }

    /// Final teardown. Runs exactly once, after `can_destroy`.
    pub fn destroy(&mut self, poller: &Poller) {
        assert!(!self.destroy_guard);
        self.destroy_guard = true;

        assert!(self.can_destroy());

        if let Err(e) = poller.deregister(&mut self.sock) {
            debug!("conn {}: deregister failed: {}", self.key, e);
        }

        debug!("conn {}: destroyed", self.key);
    }

    /// Called by the worker when this connection's idle timer pops.
    pub fn timer_expired(&mut self, deadline: Instant) {
        if !self.timeo.is_present() {
            return;
        }

        // the entry no longer exists in the timer set
        self.timeo.take_timer_key();

        self.fired_deadline = Some(deadline);
        self.timeo.set_ready(true);
    }

    pub fn handle_event(&mut self, kind: SourceKind, ctx: &mut ConnCtx) {
        match kind {
            SourceKind::SockRead => self.handle_sock_read(ctx),
            SourceKind::SockWrite => self.handle_sock_write(ctx),
            SourceKind::FileRead => self.handle_file_read(ctx),
            SourceKind::Timeout => self.handle_timeout(ctx),
        }
    }

    /// Tears down all sources. The connection is destroyed once in-flight
    /// dispatch entries drain.
    pub fn close(&mut self, timers: &mut TimerSet<TimerEvent>) {
        debug!(
            "conn {}: closing, served {} file(s)",
            self.key, self.files_served
        );

        self.delete_source(SourceKind::FileRead, timers);
        self.delete_source(SourceKind::SockRead, timers);
        self.delete_source(SourceKind::SockWrite, timers);
        self.delete_source(SourceKind::Timeout, timers);
    }

    fn delete_source(&mut self, kind: SourceKind, timers: &mut TimerSet<TimerEvent>) {
        if let Some(timer_key) = self.watcher_mut(kind).delete() {
            timers.remove(timer_key);
        }
    }

    fn handle_sock_read(&mut self, ctx: &mut ConnCtx) {
        if self.cmd_len == self.cmd_buf.len() {
            debug!("conn {}: request head too large", self.key);
            self.close(ctx.timers);
            return;
        }

        let size = match (&self.sock).read(&mut self.cmd_buf[self.cmd_len..]) {
            Ok(0) => {
                debug!("conn {}: peer closed", self.key);
                self.close(ctx.timers);
                return;
            }
            Ok(size) => size,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.sd_rd.set_ready(false);
                return;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                debug!("conn {}: read failed: {}", self.key, e);
                self.close(ctx.timers);
                return;
            }
        };

        // client activity cancels any pending idle timeout
        self.delete_source(SourceKind::Timeout, ctx.timers);
        self.timeout_at = None;

        self.cmd_len += size;

        if request_head_complete(&self.cmd_buf[..self.cmd_len]) {
            self.start_response(ctx);
        }
    }

    fn start_response(&mut self, ctx: &mut ConnCtx) {
        self.sd_rd.disable();

        let route = match ctx.router.route(&self.cmd_buf[..self.cmd_len]) {
            Ok(route) => route,
            Err(e) => {
                debug!("conn {}: {}", self.key, e);
                ctx.log
                    .access(&self.peer_addr, &self.request_line(), e.status(), 0);
                self.close(ctx.timers);
                return;
            }
        };

        self.status = 200;
        self.file_size = route.size;
        self.file = Some(route.file);

        if route.deflate {
            // the head ends with a single CRLF; the first chunk header's
            // leading CRLF completes the blank line
            self.resp_b.write_display(&format_args!(
                "HTTP/1.1 200 OK\r\nContent-Encoding: deflate\r\nTransfer-Encoding: chunked\r\n"
            ));

            self.deflate = Some(DeflateState {
                stream: DeflateStream::new(),
                buf: Buffer::new(0),
            });
        } else {
            self.resp_b.write_display(&format_args!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                route.size
            ));
        }

        // regular files don't poll; the source is ready until end of file
        self.fd_rd.arm();
        self.fd_rd.set_ready(true);

        self.sd_wr.enable();
    }

    fn handle_file_read(&mut self, ctx: &mut ConnCtx) {
        // never read past the size we promised; the file may have grown
        let avail = self.file_size.saturating_sub(self.file_read) as usize;

        if avail == 0 {
            // end of file
            self.delete_source(SourceKind::FileRead, ctx.timers);

            if self.deflate.is_some() {
                if self.compress_pending().is_err() {
                    debug!("conn {}: compress failed", self.key);
                    self.close(ctx.timers);
                    return;
                }

                self.sd_wr.enable();
            }

            return;
        }

        self.file_b.ensure_write_avail(avail);

        let file = self.file.as_mut().expect("file source without a file");

        let size = match self.file_b.write_from(&mut file.take(avail as u64)) {
            Ok(size) => size,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                debug!("conn {}: file read failed: {}", self.key, e);
                self.close(ctx.timers);
                return;
            }
        };

        self.file_read += size as u64;

        if size == 0 {
            // the file shrank while being served
            self.delete_source(SourceKind::FileRead, ctx.timers);

            if self.deflate.is_none() {
                // a raw response already promised Content-Length bytes we
                // can no longer produce
                debug!("conn {}: file truncated mid-response", self.key);
                self.close(ctx.timers);
                return;
            }
        }

        if self.deflate.is_some() {
            if self.compress_pending().is_err() {
                debug!("conn {}: compress failed", self.key);
                self.close(ctx.timers);
                return;
            }

            let d = match &self.deflate {
                Some(d) => d,
                None => return,
            };

            if d.buf.read_avail() > 0 || self.needs_zero_chunk {
                self.sd_wr.enable();
            }
        } else if self.file_b.read_avail() > 0 {
            self.sd_wr.enable();
        }
    }

    // feed buffered file data through the compressor. finishing is implied
    // by having read the whole file, or by early end of file
    fn compress_pending(&mut self) -> Result<(), io::Error> {
        let finish = self.file_read >= self.file_size || !self.fd_rd.is_present();

        let d = match &mut self.deflate {
            Some(d) => d,
            None => return Ok(()),
        };

        loop {
            if d.stream.is_finished() {
                break;
            }

            let in_len = self.file_b.read_avail();

            if in_len == 0 && !finish {
                break;
            }

            d.buf.ensure_write_avail(cmp::max(deflate_bound(in_len), 64));

            let (consumed, written) =
                d.stream
                    .compress(self.file_b.read_buf(), d.buf.write_buf(), finish)?;

            self.file_b.read_commit(consumed);
            d.buf.write_commit(written);

            if !finish && self.file_b.read_avail() == 0 {
                break;
            }

            if !finish && consumed == 0 && written == 0 {
                // wants more input before producing anything
                break;
            }
        }

        Ok(())
    }

    fn handle_sock_write(&mut self, ctx: &mut ConnCtx) {
        if self.deflate.is_some() {
            self.maybe_begin_chunk();
        }

        let head_len = self.resp_b.read_avail();
        let hdr_len = self.chunk_hdr.len() - self.chunk_hdr_pos;

        let head = self.resp_b.read_buf();
        let hdr = &self.chunk_hdr.as_bytes()[self.chunk_hdr_pos..];

        let payload = match &self.deflate {
            Some(d) => {
                let n = cmp::min(self.chunk_remaining, d.buf.read_avail());
                &d.buf.read_buf()[..n]
            }
            None => self.file_b.read_buf(),
        };

        if head_len + hdr_len + payload.len() == 0 && !self.write_work_pending() {
            self.sd_wr.disable();
            return;
        }

        let bufs = [
            IoSlice::new(head),
            IoSlice::new(hdr),
            IoSlice::new(payload),
        ];

        let size = match (&self.sock).write_vectored(&bufs) {
            Ok(size) => size,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.sd_wr.set_ready(false);
                return;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                debug!("conn {}: write failed: {}", self.key, e);
                self.close(ctx.timers);
                return;
            }
        };

        let (head_n, hdr_n, payload_n) = split_written(size, head_len, hdr_len);

        self.resp_b.read_commit(head_n);
        self.chunk_hdr_pos += hdr_n;

        if let Some(d) = &mut self.deflate {
            d.buf.read_commit(payload_n);
            self.chunk_remaining -= payload_n;
        } else {
            self.file_b.read_commit(payload_n);
        }

        // chunk framing bytes don't count toward the body
        self.total_written += payload_n as u64;

        if self.response_complete() {
            self.finish_request(ctx);
            return;
        }

        if !self.write_work_pending() {
            // nothing more to send until the file produces more data
            self.sd_wr.disable();
        }
    }

    fn maybe_begin_chunk(&mut self) {
        if self.chunk_remaining > 0 || self.chunk_hdr_pos < self.chunk_hdr.len() {
            // a chunk is still in flight
            return;
        }

        let size = match &self.deflate {
            Some(d) => {
                let avail = d.buf.read_avail();

                if avail > 0 {
                    Some(avail)
                } else if d.stream.is_finished() && self.needs_zero_chunk {
                    Some(0)
                } else {
                    None
                }
            }
            None => None,
        };

        if let Some(size) = size {
            self.chunk_hdr.clear();
            self.chunk_hdr_pos = 0;

            write_chunk_header(&mut self.chunk_hdr, size);

            self.chunk_remaining = size;
            self.needs_zero_chunk = size != 0;
        }
    }

    fn response_complete(&self) -> bool {
        if self.resp_b.read_avail() > 0 {
            return false;
        }

        match &self.deflate {
            Some(d) => {
                d.stream.is_finished()
                    && d.buf.read_avail() == 0
                    && self.chunk_remaining == 0
                    && self.chunk_hdr_pos == self.chunk_hdr.len()
                    && !self.needs_zero_chunk
            }
            None => self.total_written == self.file_size,
        }
    }

    // whether another write is already warranted, as opposed to waiting
    // for more file data
    fn write_work_pending(&self) -> bool {
        if self.resp_b.read_avail() > 0 || self.chunk_hdr_pos < self.chunk_hdr.len() {
            return true;
        }

        match &self.deflate {
            Some(d) => {
                d.buf.read_avail() > 0 || (d.stream.is_finished() && self.needs_zero_chunk)
            }
            None => self.file_b.read_avail() > 0,
        }
    }

    fn finish_request(&mut self, ctx: &mut ConnCtx) {
        ctx.log.access(
            &self.peer_addr,
            &self.request_line(),
            self.status,
            self.total_written,
        );

        self.delete_source(SourceKind::FileRead, ctx.timers);

        // each served file extends the idle grace a little
        let deadline =
            Instant::now() + ctx.idle_timeout + Duration::from_millis(100) * self.files_served;

        self.files_served += 1;

        let timer_key = ctx.timers.add(
            deadline,
            TimerEvent {
                conn_key: self.key,
                conn_generation: self.generation,
                deadline,
            },
        );

        self.timeo.arm_timer(timer_key);
        self.timeout_at = Some(deadline);

        debug!(
            "conn {}: response complete, {} bytes, {} file(s) served",
            self.key, self.total_written, self.files_served
        );

        // reset for the next pipelined request
        self.cmd_len = 0;
        self.file = None;
        self.file_size = 0;
        self.file_read = 0;
        self.status = 0;
        self.total_written = 0;
        self.deflate = None;
        self.chunk_remaining = 0;
        self.chunk_hdr.clear();
        self.chunk_hdr_pos = 0;
        self.needs_zero_chunk = false;
        self.file_b.clear();
        self.resp_b.clear();

        self.sd_wr.disable();
        self.sd_rd.enable();
    }

    fn handle_timeout(&mut self, ctx: &mut ConnCtx) {
        let fired = self.fired_deadline.take();

        // a fire that raced a new request through the dispatch queue
        // carries a deadline that is no longer current
        if fired.is_none() || fired != self.timeout_at {
            return;
        }

        debug!("conn {}: idle timeout", self.key);
        self.close(ctx.timers);
    }

    fn request_line(&self) -> String {
        let head = &self.cmd_buf[..self.cmd_len];

        let end = head
            .iter()
            .position(|&b| b == b'\r' || b == b'\n')
            .unwrap_or(head.len());

        String::from_utf8_lossy(&head[..end]).into_owned()
    }

    /// Logs a diagnostic snapshot of the connection.
    pub fn dump(&self, now: Instant) {
        debug!(
            "conn {}: peer={} served={} status={} cmd_len={} file_read={}/{} written={}",
            self.key,
            self.peer_addr,
            self.files_served,
            self.status,
            self.cmd_len,
            self.file_read,
            self.file_size,
            self.total_written
        );

        debug!(
            "conn {}:   sd_rd={:?} sd_wr={:?} fd_rd={:?} timeo={:?}",
            self.key, self.sd_rd, self.sd_wr, self.fd_rd, self.timeo
        );

        let timeout = match self.timeout_at {
            Some(at) => format!("{:?}", at.saturating_duration_since(now)),
            None => "none".to_string(),
        };

        let deflate = match &self.deflate {
            Some(d) => format!(" deflate[in={} {}]", d.stream.total_in(), d.buf.stats()),
            None => String::new(),
        };

        debug!(
            "conn {}:   timeout={} resp[{}] file[{}]{}",
            self.key,
            timeout,
            self.resp_b.stats(),
            self.file_b.stats(),
            deflate
        );
    }
}

/// A request head is considered complete once more than four bytes are
/// buffered and the last four are all CR or LF. This deliberately accepts
/// sloppy clients (bare LFs) and never looks at earlier bytes.
pub fn request_head_complete(buf: &[u8]) -> bool {
    if buf.len() <= 4 {
        return false;
    }

    buf[buf.len() - 4..]
        .iter()
        .all(|&b| b == b'\r' || b == b'\n')
}

fn write_chunk_header(dest: &mut ArrayString<CHUNK_HDR_MAX>, size: usize) {
    // the leading CRLF terminates the previous element (the response head
    // or the preceding chunk's data); the terminal chunk carries the final
    // blank line as well
    if size == 0 {
        dest.push_str("\r\n0\r\n\r\n");
    } else {
        write!(dest, "\r\n{:x}\r\n", size).expect("chunk header overflow");
    }
}

// a short vectored write may end anywhere; the response head drains
// first, then the pending chunk header bytes, then payload
fn split_written(size: usize, head_len: usize, hdr_len: usize) -> (usize, usize, usize) {
    let head_n = cmp::min(size, head_len);
    let hdr_n = cmp::min(size - head_n, hdr_len);

    (head_n, hdr_n, size - head_n - hdr_n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_head_complete() {
        assert!(!request_head_complete(b""));
        assert!(!request_head_complete(b"\r\n\r\n"));
        assert!(!request_head_complete(b"GET /"));
        assert!(request_head_complete(b"GET /\r\n\r\n"));
        assert!(request_head_complete(b"GET /\n\n\n\n"));
        assert!(request_head_complete(
            b"GET / HTTP/1.1\r\nHost: example\r\n\r\n"
        ));
        assert!(!request_head_complete(b"GET /\r\n\r\nGET"));
    }

    #[test]
    fn test_chunk_header() {
        let mut hdr = ArrayString::<CHUNK_HDR_MAX>::new();

        write_chunk_header(&mut hdr, 0x2a);
        assert_eq!(hdr.as_str(), "\r\n2a\r\n");

        hdr.clear();
        write_chunk_header(&mut hdr, 0);
        assert_eq!(hdr.as_str(), "\r\n0\r\n\r\n");

        // the largest possible size still fits the scratch space
        hdr.clear();
        write_chunk_header(&mut hdr, usize::MAX);
        assert_eq!(hdr.len(), CHUNK_HDR_MAX);
    }

    #[test]
    fn test_split_written() {
        assert_eq!(split_written(0, 10, 6), (0, 0, 0));

        // short write ending inside the head
        assert_eq!(split_written(4, 10, 6), (4, 0, 0));

        // exactly at the end of the head
        assert_eq!(split_written(10, 10, 6), (10, 0, 0));

        // inside the chunk header
        assert_eq!(split_written(13, 10, 6), (10, 3, 0));

        // exactly at the end of the chunk header
        assert_eq!(split_written(16, 10, 6), (10, 6, 0));

        // anything beyond the framing is payload
        assert_eq!(split_written(100, 10, 6), (10, 6, 84));

        // mid-response, no head left to drain
        assert_eq!(split_written(9, 0, 6), (0, 6, 3));
    }

    #[test]
    fn test_split_written_resume() {
        // three short writes walk the cursors across head, header and
        // payload without ever double counting framing bytes as body
        let (head_len, hdr_len, payload_len) = (10, 6, 20);

        let (h1, c1, p1) = split_written(7, head_len, hdr_len);
        assert_eq!((h1, c1, p1), (7, 0, 0));

        let (h2, c2, p2) = split_written(8, head_len - h1, hdr_len - c1);
        assert_eq!((h2, c2, p2), (3, 5, 0));

        let (h3, c3, p3) = split_written(
            (head_len - h1 - h2) + (hdr_len - c1 - c2) + payload_len,
            head_len - h1 - h2,
            hdr_len - c1 - c2,
        );
        assert_eq!((h3, c3, p3), (0, 1, payload_len));

        assert_eq!(h1 + h2 + h3, head_len);
        assert_eq!(c1 + c2 + c3, hdr_len);
        assert_eq!(p1 + p2 + p3, payload_len);
    }
}
