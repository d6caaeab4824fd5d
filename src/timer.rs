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

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Set of one-shot deadlines, ordered by expiration. Keys are unique for
/// the lifetime of the set so a removed entry's key can never match a
/// later one.
pub struct TimerSet<T> {
    entries: BTreeMap<(Instant, usize), T>,
    deadlines: HashMap<usize, Instant>,
    next_key: usize,
}

impl<T> TimerSet<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_key: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn add(&mut self, expires: Instant, data: T) -> usize {
        let key = self.next_key;
        self.next_key += 1;

        self.entries.insert((expires, key), data);
        self.deadlines.insert(key, expires);

        key
    }

    pub fn remove(&mut self, key: usize) -> Option<T> {
        let expires = self.deadlines.remove(&key)?;

        self.entries.remove(&(expires, key))
    }

    /// Time until the earliest deadline, or None if the set is empty.
    /// Zero if the deadline has already passed.
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        self.entries
            .keys()
            .next()
            .map(|&(expires, _)| expires.saturating_duration_since(now))
    }

    /// Pops the earliest entry whose deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Option<(usize, T)> {
        let &(expires, key) = self.entries.keys().next()?;

        if expires > now {
            return None;
        }

        self.deadlines.remove(&key);

        let data = self
            .entries
            .remove(&(expires, key))
            .map(|data| (key, data));

        assert!(data.is_some());

        data
    }
}
