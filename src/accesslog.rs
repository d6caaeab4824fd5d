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

use log::error;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use time::macros::format_description;
use time::OffsetDateTime;

enum Message {
    Line(String),
    Flush(mpsc::SyncSender<()>),
}

/// Asynchronous access log confined to a writer thread. Lines are
/// formatted on the caller's thread (the logged values may change after
/// the call returns) and written in submission order. If the log file is
/// rotated away, the writer notices and reopens the path.
pub struct AccessLog {
    tx: Option<mpsc::Sender<Message>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AccessLog {
    /// Starts the writer thread. With no path, lines go to stdout.
    pub fn new(path: Option<PathBuf>) -> Result<Self, io::Error> {
        let output = match path {
            Some(path) => {
                let file = open_log(&path)?;

                Output::File {
                    path,
                    file: BufWriter::new(file),
                }
            }
            None => Output::Stdout(io::stdout()),
        };

        let (tx, rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("accesslog".to_string())
            .spawn(move || writer_loop(rx, output))?;

        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> AccessLogHandle {
        // tx is only cleared during drop
        let tx = self.tx.as_ref().expect("access log stopped").clone();

        AccessLogHandle { tx }
    }
}

impl Drop for AccessLog {
    fn drop(&mut self) {
        // closing the channel stops the writer after it drains the queue
        self.tx = None;

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[derive(Clone)]
pub struct AccessLogHandle {
    tx: mpsc::Sender<Message>,
}

impl AccessLogHandle {
    /// Logs one served (or failed) request. Fire-and-forget.
    pub fn access(&self, peer: &SocketAddr, request_line: &str, status: u16, bytes: u64) {
        let format = format_description!(
            "[day]/[month repr:short]/[year]:[hour]:[minute]:[second] +0000"
        );

        let ts = OffsetDateTime::now_utc()
            .format(&format)
            .unwrap_or_else(|_| String::new());

        let line = format!(
            "{} - - [{}] \"{}\" {} {}\n",
            peer.ip(),
            ts,
            escape(request_line),
            status,
            bytes
        );

        let _ = self.tx.send(Message::Line(line));
    }

    /// Blocks until every line submitted before this call has been written
    /// and flushed.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::sync_channel(0);

        if self.tx.send(Message::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

enum Output {
    Stdout(io::Stdout),
    File { path: PathBuf, file: BufWriter<File> },
}

fn open_log(path: &PathBuf) -> Result<File, io::Error> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn writer_loop(rx: mpsc::Receiver<Message>, mut output: Output) {
    for msg in rx {
        match msg {
            Message::Line(line) => {
                if let Output::File { path, file } = &mut output {
                    reopen_if_rotated(path, file);
                }

                let r = match &mut output {
                    Output::Stdout(out) => out.write_all(line.as_bytes()),
                    Output::File { file, .. } => file.write_all(line.as_bytes()),
                };

                if let Err(e) = r {
                    error!("access log write failed: {}", e);
                }
            }
            Message::Flush(ack) => {
                let r = match &mut output {
                    Output::Stdout(out) => out.flush(),
                    Output::File { file, .. } => file.flush(),
                };

                if let Err(e) = r {
                    error!("access log flush failed: {}", e);
                }

                let _ = ack.send(());
            }
        }
    }

    let r = match &mut output {
        Output::Stdout(out) => out.flush(),
        Output::File { file, .. } => file.flush(),
    };

    if let Err(e) = r {
        error!("access log flush failed: {}", e);
    }
}

// the log path and the open file diverge when an external rotator renames
// or removes the file. compare identities and reopen the path if so
fn reopen_if_rotated(path: &PathBuf, file: &mut BufWriter<File>) {
    let current = match file.get_ref().metadata() {
        Ok(md) => md,
        Err(_) => return,
    };

    let rotated = match std::fs::metadata(path) {
        Ok(md) => (md.dev(), md.ino()) != (current.dev(), current.ino()),
        Err(_) => true,
    };

    if !rotated {
        return;
    }

    if let Err(e) = file.flush() {
        error!("access log flush failed: {}", e);
    }

    match open_log(path) {
        Ok(new_file) => {
            *file = BufWriter::new(new_file);
        }
        Err(e) => {
            // keep writing to the old handle rather than lose lines
            error!("access log reopen failed: {}", e);
        }
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());

    for c in s.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => {}
            c => out.push(c),
        }
    }

    out
}
