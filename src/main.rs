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

use clap::Parser;
use log::{error, Level, LevelFilter, Metadata, Record};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::str;
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;
use zipline::server::Config;

const WORKERS_MAX: usize = 1024;
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

struct SimpleLogger;

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let now = OffsetDateTime::now_utc();

        let format = format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        );

        let mut ts = [0u8; 64];

        let size = {
            let mut ts = io::Cursor::new(&mut ts[..]);

            now.format_into(&mut ts, &format)
                .expect("failed to write timestamp");

            ts.position() as usize
        };

        let ts = str::from_utf8(&ts[..size]).expect("timestamp is not utf-8");

        let lname = match record.level() {
            log::Level::Error => "ERR",
            log::Level::Warn => "WARN",
            log::Level::Info => "INFO",
            log::Level::Debug => "DEBUG",
            log::Level::Trace => "TRACE",
        };

        println!("[{}] {} [{}] {}", lname, ts, record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: SimpleLogger = SimpleLogger;

#[derive(Parser, Debug)]
#[command(
    name = "zipline",
    version,
    about = "Pipelined static file HTTP server with on-the-fly deflate compression."
)]
struct CliArgs {
    /// Address and port to listen on
    #[arg(long, value_name = "addr:port", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Directory to serve files from
    #[arg(short, long, value_name = "dir", default_value = ".")]
    doc_root: PathBuf,

    /// Set path to the access log file (stdout when unset)
    #[arg(short = 'l', long, value_name = "file")]
    log_file: Option<PathBuf>,

    /// Number of worker threads
    #[arg(short, long, value_name = "n", default_value_t = 2)]
    workers: usize,

    /// Maximum number of concurrent connections
    #[arg(long, value_name = "n", default_value_t = 10_000)]
    maxconn: usize,

    /// Set log level (0=error, 1=warn, 2=info, 3=debug, 4=trace)
    #[arg(short = 'L', long, value_name = "x", default_value_t = 2, value_parser = clap::value_parser!(u32).range(0..=4))]
    log_level: u32,
}

fn main() {
    let args = CliArgs::parse();

    log::set_logger(&LOGGER).expect("failed to set logger");

    log::set_max_level(match args.log_level {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });

    if args.workers == 0 || args.workers > WORKERS_MAX {
        error!("failed to parse workers: value out of range");
        process::exit(1);
    }

    if args.maxconn < args.workers {
        error!("maxconn must be at least the number of workers");
        process::exit(1);
    }

    let config = Config {
        listen: args.listen,
        doc_root: args.doc_root,
        log_file: args.log_file,
        workers: args.workers,
        conns_max: args.maxconn,
        idle_timeout: IDLE_TIMEOUT,
    };

    if let Err(e) = zipline::run(&config) {
        error!("{}", e);
        process::exit(1);
    }
}
