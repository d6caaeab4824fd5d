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

use miniz_oxide::inflate::decompress_to_vec_zlib;
use std::env;
use std::fs;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::{Duration, Instant};
use test_log::test;
use zipline::server::{Config, Server};

struct TestServer {
    server: Option<Server>,
    log_path: PathBuf,
}

impl TestServer {
    fn start(name: &str, files: &[(&str, &[u8])], idle_timeout: Duration) -> Self {
        let dir = env::temp_dir().join(format!("zipline-it-{}-{}", name, process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        for (fname, content) in files {
            fs::write(dir.join(fname), content).unwrap();
        }

        let log_path = dir.join("access.log");

        let config = Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            doc_root: dir,
            log_file: Some(log_path.clone()),
            workers: 1,
            conns_max: 16,
            idle_timeout,
        };

        Self {
            server: Some(Server::new(&config).unwrap()),
            log_path,
        }
    }

    fn connect(&self) -> TcpStream {
        let addr = self.server.as_ref().unwrap().local_addr();

        TcpStream::connect(addr).unwrap()
    }

    /// Stops the server and returns the access log lines.
    fn finish(mut self) -> Vec<String> {
        // dropping the server joins the workers and flushes the log
        self.server = None;

        let content = fs::read_to_string(&self.log_path).unwrap_or_default();

        content.lines().map(|s| s.to_string()).collect()
    }
}

// reads until the blank line, returning (head, leftover body bytes)
fn recv_head(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            let body = data.split_off(pos + 4);
            data.truncate(pos);

            return (String::from_utf8(data).unwrap(), body);
        }

        let size = stream.read(&mut buf).unwrap();
        assert!(size > 0, "connection closed before end of head");

        data.extend_from_slice(&buf[..size]);
    }
}

fn recv_exact(stream: &mut TcpStream, mut body: Vec<u8>, len: usize) -> Vec<u8> {
    let start = body.len();
    body.resize(len, 0);
    stream.read_exact(&mut body[start..]).unwrap();

    body
}

// decodes a chunked body, asserting it is well formed and ends with the
// terminal chunk
fn decode_chunked(mut data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();

    loop {
        let pos = data
            .windows(2)
            .position(|w| w == b"\r\n")
            .expect("missing chunk size line");

        let size_line = std::str::from_utf8(&data[..pos]).unwrap();
        let size = usize::from_str_radix(size_line, 16).unwrap();
        data = &data[pos + 2..];

        if size == 0 {
            assert_eq!(data, b"\r\n", "bytes after terminal chunk");
            return out;
        }

        assert!(data.len() >= size + 2, "truncated chunk");
        out.extend_from_slice(&data[..size]);
        assert_eq!(&data[size..size + 2], b"\r\n");
        data = &data[size + 2..];
    }
}

#[test]
fn test_serve_and_pipeline() {
    let body: Vec<u8> = (0..100u8).collect();
    let ts = TestServer::start("serve", &[("data.bin", &body)], Duration::from_secs(5));

    let mut stream = ts.connect();

    stream.write_all(b"GET /data.bin HTTP/1.1\r\n\r\n").unwrap();

    let (head, rest) = recv_head(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
    assert!(head.contains("Content-Length: 100"));

    let got = recv_exact(&mut stream, rest, 100);
    assert_eq!(got, body);

    // the connection stays open; a second request before the idle
    // deadline is served on the same socket
    thread::sleep(Duration::from_millis(50));

    stream.write_all(b"GET /data.bin HTTP/1.1\r\n\r\n").unwrap();

    let (head, rest) = recv_head(&mut stream);
    assert!(head.contains("Content-Length: 100"));

    let got = recv_exact(&mut stream, rest, 100);
    assert_eq!(got, body);

    drop(stream);

    // one log line per request, with the exact body byte count
    let lines = ts.finish();
    assert_eq!(lines.len(), 2);

    for line in &lines {
        assert!(
            line.ends_with("\"GET /data.bin HTTP/1.1\" 200 100"),
            "line: {}",
            line
        );
    }
}

#[test]
fn test_compressed_round_trip() {
    let mut body = Vec::new();
    while body.len() < 64 * 1024 {
        body.extend_from_slice(format!("payload line {}\n", body.len() % 311).as_bytes());
    }

    let ts = TestServer::start(
        "deflate",
        &[("big.txt", &body)],
        Duration::from_millis(300),
    );

    let mut stream = ts.connect();

    stream
        .write_all(b"GET /big.txt HTTP/1.1\r\nAccept-Encoding: deflate\r\n\r\n")
        .unwrap();

    // the idle timeout closes the connection once the response is done,
    // so read everything
    let mut data = Vec::new();
    stream.read_to_end(&mut data).unwrap();

    let pos = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("missing end of head");

    let head = std::str::from_utf8(&data[..pos]).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
    assert!(head.contains("Content-Encoding: deflate"));
    assert!(head.contains("Transfer-Encoding: chunked"));

    let compressed = decode_chunked(&data[pos + 4..]);
    assert!(compressed.len() < body.len());

    let inflated = decompress_to_vec_zlib(&compressed).unwrap();
    assert_eq!(inflated, body);

    // the logged byte count is the compressed payload, not the chunk framing
    let lines = ts.finish();
    assert_eq!(lines.len(), 1);
    assert!(
        lines[0].ends_with(&format!(" 200 {}", compressed.len())),
        "line: {}",
        lines[0]
    );
}

#[test]
fn test_not_found() {
    let ts = TestServer::start("notfound", &[], Duration::from_secs(5));

    let mut stream = ts.connect();

    stream.write_all(b"GET /missing HTTP/1.1\r\n\r\n").unwrap();

    // no response is written; the connection just closes
    let mut data = Vec::new();
    stream.read_to_end(&mut data).unwrap();
    assert!(data.is_empty());

    let lines = ts.finish();
    assert_eq!(lines.len(), 1);
    assert!(
        lines[0].ends_with("\"GET /missing HTTP/1.1\" 404 0"),
        "line: {}",
        lines[0]
    );
}

#[test]
fn test_idle_timeout() {
    let ts = TestServer::start(
        "idle",
        &[("f.txt", b"hello")],
        Duration::from_millis(250),
    );

    let mut stream = ts.connect();

    stream.write_all(b"GET /f.txt HTTP/1.1\r\n\r\n").unwrap();

    let (_, rest) = recv_head(&mut stream);
    let got = recv_exact(&mut stream, rest, 5);
    assert_eq!(got, b"hello");

    // the server closes the idle connection around the deadline
    let start = Instant::now();

    let mut data = Vec::new();
    stream.read_to_end(&mut data).unwrap();
    assert!(data.is_empty());

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "{:?}", elapsed);

    let lines = ts.finish();
    assert_eq!(lines.len(), 1);
}

#[test]
fn test_oversized_head() {
    let ts = TestServer::start("oversized", &[], Duration::from_secs(5));

    let mut stream = ts.connect();

    // more than the head buffer holds, with no end of head in sight
    let junk = vec![b'A'; 10 * 1024];
    let _ = stream.write_all(&junk);

    let mut data = Vec::new();
    stream.read_to_end(&mut data).unwrap();
    assert!(data.is_empty());

    assert_eq!(ts.finish().len(), 0);
}

#[test]
fn test_peer_close() {
    let ts = TestServer::start("peerclose", &[("f.txt", b"x")], Duration::from_secs(5));

    let stream = ts.connect();
    stream.shutdown(Shutdown::Write).unwrap();

    // the server notices and drops the connection without logging anything
    let mut stream = stream;
    let mut data = Vec::new();
    stream.read_to_end(&mut data).unwrap();
    assert!(data.is_empty());

    assert_eq!(ts.finish().len(), 0);
}

#[test]
fn test_empty_file_not_chunked() {
    let ts = TestServer::start(
        "empty",
        &[("empty.txt", b"")],
        Duration::from_millis(300),
    );

    let mut stream = ts.connect();

    stream
        .write_all(b"GET /empty.txt HTTP/1.1\r\nAccept-Encoding: deflate\r\n\r\n")
        .unwrap();

    let mut data = Vec::new();
    stream.read_to_end(&mut data).unwrap();

    let head = std::str::from_utf8(&data).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Length: 0"));
    assert!(!head.contains("chunked"));

    let lines = ts.finish();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].ends_with(" 200 0"), "line: {}", lines[0]);
}
