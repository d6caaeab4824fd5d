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

use crate::accesslog::{AccessLog, AccessLogHandle};
use crate::connection::{ConnCtx, Connection, SourceKind, TimerEvent, SOURCE_KINDS};
use crate::event::{conn_key, conn_token, Poller, LISTENER_TOKEN, WAKER_TOKEN};
use crate::registry::ConnectionRegistry;
use crate::router::Router;
use crate::timer::TimerSet;
use log::{debug, error, info, warn};
use mio::net::TcpListener;
use mio::{Interest, Waker};
use socket2::{Domain, Socket, Type};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const LISTEN_BACKLOG: i32 = 1024;
const EVENTS_MAX: usize = 1024;
const DUMP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to set up listener: {0}")]
    Listener(#[source] io::Error),

    #[error("failed to open access log: {0}")]
    AccessLog(#[source] io::Error),

    #[error("failed to start worker: {0}")]
    Worker(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

#[derive(Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub doc_root: PathBuf,
    pub log_file: Option<PathBuf>,
    pub workers: usize,
    pub conns_max: usize,
    pub idle_timeout: Duration,
}

pub struct Server {
    addr: SocketAddr,
    workers: Vec<Worker>,

    // dropped after the workers so their final lines are written
    _accesslog: AccessLog,
}

impl Server {
    pub fn new(config: &Config) -> Result<Self, ServerError> {
        if config.workers == 0 {
            return Err(ServerError::Config("worker count must be nonzero"));
        }

        if config.conns_max < config.workers {
            return Err(ServerError::Config("conns-max lower than worker count"));
        }

        let listener = setup_listener(config.listen).map_err(ServerError::Listener)?;
        let addr = listener.local_addr().map_err(ServerError::Listener)?;

        let accesslog = AccessLog::new(config.log_file.clone()).map_err(ServerError::AccessLog)?;

        let mut workers = Vec::with_capacity(config.workers);

        for id in 0..config.workers {
            let listener = listener.try_clone().map_err(ServerError::Worker)?;

            let settings = WorkerSettings {
                doc_root: config.doc_root.clone(),
                conns_max: config.conns_max / config.workers,
                idle_timeout: config.idle_timeout,
                log: accesslog.handle(),
            };

            workers.push(Worker::spawn(id, listener, settings).map_err(ServerError::Worker)?);
        }

        info!("listening on {}", addr);

        Ok(Self {
            addr,
            workers,
            _accesslog: accesslog,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Asks the workers to stop. `drop` joins them.
    pub fn stop(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
        self.workers.clear();
    }
}

fn setup_listener(addr: SocketAddr) -> Result<std::net::TcpListener, io::Error> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, None)?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

struct WorkerSettings {
    doc_root: PathBuf,
    conns_max: usize,
    idle_timeout: Duration,
    log: AccessLogHandle,
}

struct Worker {
    thread: Option<thread::JoinHandle<()>>,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
}

impl Worker {
    fn spawn(
        id: usize,
        listener: std::net::TcpListener,
        settings: WorkerSettings,
    ) -> Result<Self, io::Error> {
        let poller = Poller::new(EVENTS_MAX)?;
        let waker = poller.waker().clone();
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let stop = stop.clone();

            thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || run(id, poller, listener, settings, stop))?
        };

        Ok(Self {
            thread: Some(thread),
            waker,
            stop,
        })
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);

        if let Err(e) = self.waker.wake() {
            error!("failed to wake worker: {}", e);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(
    id: usize,
    mut poller: Poller,
    listener: std::net::TcpListener,
    settings: WorkerSettings,
    stop: Arc<AtomicBool>,
) {
    debug!("worker {}: started", id);

    let mut listener = TcpListener::from_std(listener);

    if let Err(e) = poller.register(&mut listener, LISTENER_TOKEN, Interest::READABLE) {
        error!("worker {}: failed to register listener: {}", id, e);
        return;
    }

    let router = Router::new(settings.doc_root.clone());
    let mut registry = ConnectionRegistry::new(settings.conns_max);
    let mut timers: TimerSet<TimerEvent> = TimerSet::new();
    let mut dispatch: VecDeque<(usize, u64, SourceKind)> = VecDeque::new();
    let mut next_generation: u64 = 1;
    let mut last_dump = Instant::now();

    loop {
        let now = Instant::now();

        let until_dump = DUMP_INTERVAL.saturating_sub(now - last_dump);

        let timeout = match timers.timeout(now) {
            Some(t) => t.min(until_dump),
            None => until_dump,
        };

        match poller.poll(Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!("worker {}: poll failed: {}", id, e);
                break;
            }
        }

        if stop.load(Ordering::Relaxed) {
            break;
        }

        let mut accept_ready = false;

        for event in poller.events() {
            match event.token() {
                WAKER_TOKEN => {}
                LISTENER_TOKEN => accept_ready = true,
                token => {
                    let key = match conn_key(token) {
                        Some(key) => key,
                        None => continue,
                    };

                    if let Some(conn) = registry.get_mut(key) {
                        if event.is_readable() {
                            conn.watcher_mut(SourceKind::SockRead).set_ready(true);
                        }

                        if event.is_writable() {
                            conn.watcher_mut(SourceKind::SockWrite).set_ready(true);
                        }

                        schedule(conn, &mut dispatch);
                    }
                }
            }
        }

        let now = Instant::now();

        while let Some((_, ev)) = timers.take_expired(now) {
            if let Some(conn) = registry.get_mut(ev.conn_key) {
                if conn.generation() == ev.conn_generation {
                    conn.timer_expired(ev.deadline);
                    schedule(conn, &mut dispatch);
                }
            }
        }

        if accept_ready {
            accept_loop(
                id,
                &poller,
                &listener,
                &mut registry,
                &mut dispatch,
                &mut next_generation,
            );
        }

        let mut ctx = ConnCtx {
            timers: &mut timers,
            router: &router,
            log: &settings.log,
            idle_timeout: settings.idle_timeout,
        };

        while let Some((key, generation, kind)) = dispatch.pop_front() {
            let conn = match registry.get_mut(key) {
                Some(conn) if conn.generation() == generation => conn,
                _ => continue,
            };

            conn.mark_dequeued(kind);

            // the source may have been disabled or deleted since queuing
            if conn.watcher(kind).is_present() && conn.watcher(kind).is_enabled() {
                conn.handle_event(kind, &mut ctx);
            }

            schedule(conn, &mut dispatch);

            if conn.can_destroy() {
                let mut conn = registry.remove(key);
                conn.destroy(&poller);
            }
        }

        if last_dump.elapsed() >= DUMP_INTERVAL {
            registry.dump(Instant::now());
            last_dump = Instant::now();
        }
    }

    // teardown: drop every remaining connection
    for key in registry.keys() {
        let mut conn = registry.remove(key);
        conn.close(&mut timers);
        conn.destroy(&poller);
    }

    debug!("worker {}: stopped", id);
}

fn accept_loop(
    id: usize,
    poller: &Poller,
    listener: &TcpListener,
    registry: &mut ConnectionRegistry,
    dispatch: &mut VecDeque<(usize, u64, SourceKind)>,
    next_generation: &mut u64,
) {
    loop {
        let (mut sock, peer_addr) = match listener.accept() {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                // transient accept failures are not fatal to the worker
                error!("worker {}: accept failed: {}", id, e);
                break;
            }
        };

        if registry.is_full() {
            warn!("worker {}: connection limit reached, dropping {}", id, peer_addr);
            continue;
        }

        let key = registry.next_key();

        if let Err(e) = poller.register(
            &mut sock,
            conn_token(key),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            error!("worker {}: failed to register {}: {}", id, peer_addr, e);
            continue;
        }

        let generation = *next_generation;
        *next_generation += 1;

        let inserted = registry.insert(Connection::new(key, generation, sock, peer_addr));
        assert_eq!(inserted, key);

        debug!("worker {}: accepted {} as conn {}", id, peer_addr, key);

        if let Some(conn) = registry.get_mut(key) {
            schedule(conn, dispatch);
        }
    }
}

fn schedule(conn: &mut Connection, dispatch: &mut VecDeque<(usize, u64, SourceKind)>) {
    for &kind in SOURCE_KINDS.iter() {
        if conn.watcher(kind).needs_dispatch() {
            conn.mark_queued(kind);
            dispatch.push_back((conn.key(), conn.generation(), kind));
        }
    }
}
