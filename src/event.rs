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

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Token reserved for waking the poll loop from another thread.
pub const WAKER_TOKEN: Token = Token(0);

/// Token of the shared listener registration.
pub const LISTENER_TOKEN: Token = Token(1);

/// Connection socket tokens start here; a connection's token is
/// `CONN_TOKEN_BASE + key`.
pub const CONN_TOKEN_BASE: usize = 2;

pub struct Poller {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl Poller {
    pub fn new(events_max: usize) -> Result<Self, io::Error> {
        let poll = Poll::new()?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            poll,
            events: Events::with_capacity(events_max),
            waker,
        })
    }

    /// Handle for waking `poll` from another thread.
    pub fn waker(&self) -> &Arc<Waker> {
        &self.waker
    }

    pub fn register<S: Source>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), io::Error> {
        if token == WAKER_TOKEN {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        self.poll.registry().register(source, token, interest)
    }

    pub fn deregister<S: Source>(&self, source: &mut S) -> Result<(), io::Error> {
        self.poll.registry().deregister(source)
    }

    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<(), io::Error> {
        self.poll.poll(&mut self.events, timeout)
    }

    pub fn events(&self) -> mio::event::Iter<'_> {
        self.events.iter()
    }
}

pub fn conn_token(key: usize) -> Token {
    Token(CONN_TOKEN_BASE + key)
}

pub fn conn_key(token: Token) -> Option<usize> {
    if token.0 >= CONN_TOKEN_BASE {
        Some(token.0 - CONN_TOKEN_BASE)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_mapping() {
        assert_eq!(conn_token(0), Token(2));
        assert_eq!(conn_key(conn_token(13)), Some(13));
        assert_eq!(conn_key(WAKER_TOKEN), None);
        assert_eq!(conn_key(LISTENER_TOKEN), None);
    }

    #[test]
    fn test_waker_wakes_poll() {
        let mut poller = Poller::new(8).unwrap();
        let waker = poller.waker().clone();

        waker.wake().unwrap();

        poller.poll(Some(Duration::from_secs(5))).unwrap();

        let tokens: Vec<Token> = poller.events().map(|e| e.token()).collect();
        assert_eq!(tokens, vec![WAKER_TOKEN]);
    }

    #[test]
    fn test_register_reserved_token() {
        let poller = Poller::new(8).unwrap();

        let mut listener =
            mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let r = poller.register(&mut listener, WAKER_TOKEN, Interest::READABLE);
        assert!(r.is_err());
    }
}
