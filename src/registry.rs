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

use crate::connection::Connection;
use log::debug;
use slab::Slab;
use std::time::Instant;

/// Slab of live connections, owned by a single worker thread. Keys are
/// reused, which is why dispatch entries carry a generation alongside the
/// key.
pub struct ConnectionRegistry {
    conns: Slab<Connection>,
    conns_max: usize,

    // how many connections the last dump reported, so an idle server
    // logs "0 active" once instead of forever
    last_reported: Option<usize>,
}

impl ConnectionRegistry {
    pub fn new(conns_max: usize) -> Self {
        Self {
            conns: Slab::with_capacity(conns_max),
            conns_max,
            last_reported: None,
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.conns.len() >= self.conns_max
    }

    /// Key the next insert will use.
    pub fn next_key(&self) -> usize {
        self.conns.vacant_key()
    }

    pub fn insert(&mut self, conn: Connection) -> usize {
        assert!(!self.is_full());

        let key = self.conns.insert(conn);

        assert_eq!(key, conn_key_check(&self.conns, key));

        key
    }

    pub fn remove(&mut self, key: usize) -> Connection {
        self.conns.remove(key)
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut Connection> {
        self.conns.get_mut(key)
    }

    pub fn keys(&self) -> Vec<usize> {
        self.conns.iter().map(|(key, _)| key).collect()
    }

    /// Logs a snapshot of every connection. Repeated empty snapshots are
    /// suppressed.
    pub fn dump(&mut self, now: Instant) {
        let len = self.conns.len();

        if len == 0 && self.last_reported == Some(0) {
            return;
        }

        self.last_reported = Some(len);

        debug!("{} active connection(s)", len);

        for (_, conn) in self.conns.iter() {
            conn.dump(now);
        }
    }
}

fn conn_key_check(conns: &Slab<Connection>, key: usize) -> usize {
    conns[key].key()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::{TcpListener, TcpStream};
    use std::net::SocketAddr;

    fn make_conn(key: usize) -> Connection {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(addr).unwrap();
        let peer = listener.local_addr().unwrap();
        let sock = TcpStream::connect(peer).unwrap();

        Connection::new(key, 1, sock, peer)
    }

    #[test]
    fn test_capacity() {
        let mut reg = ConnectionRegistry::new(2);
        assert!(reg.is_empty());
        assert!(!reg.is_full());

        let k0 = reg.insert(make_conn(reg.next_key()));
        let k1 = reg.insert(make_conn(reg.next_key()));
        assert!(reg.is_full());
        assert_eq!(reg.len(), 2);

        reg.remove(k0);
        assert!(!reg.is_full());

        // keys are reused
        let k2 = reg.insert(make_conn(reg.next_key()));
        assert_eq!(k2, k0);
        assert!(reg.get_mut(k1).is_some());
    }
}
