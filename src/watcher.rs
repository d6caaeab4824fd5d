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

// per-connection readiness subscription. the poller is edge-triggered, so
// `ready` is sticky: it is set when an edge arrives and cleared only by the
// handler observing WouldBlock (or consuming the event, for logical
// sources). this way a source disabled while ready is redispatched as soon
// as it is re-enabled, without needing a new edge.
#[derive(Debug, Default)]
pub struct Watcher {
    present: bool,
    enabled: bool,
    ready: bool,
    queued: bool,
    timer_key: Option<usize>,
}

impl Watcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the subscription in the enabled state. Readiness starts
    /// false and is set by the event loop (or by the caller, for sources
    /// that are always ready).
    pub fn arm(&mut self) {
        assert!(!self.present);

        self.present = true;
        self.enabled = true;
        self.ready = false;
    }

    /// Same as `arm`, additionally recording the timer entry backing this
    /// subscription so `delete` can hand it back for removal.
    pub fn arm_timer(&mut self, timer_key: usize) {
        self.arm();
        self.timer_key = Some(timer_key);
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn is_queued(&self) -> bool {
        self.queued
    }

    pub fn set_queued(&mut self, queued: bool) {
        self.queued = queued;
    }

    /// Clears the timer association once the entry has fired and no longer
    /// exists in the timer set.
    pub fn take_timer_key(&mut self) -> Option<usize> {
        self.timer_key.take()
    }

    /// Idempotent. No-op if the subscription doesn't exist.
    pub fn enable(&mut self) {
        if self.present {
            self.enabled = true;
        }
    }

    /// Idempotent. No-op if the subscription doesn't exist.
    pub fn disable(&mut self) {
        if self.present {
            self.enabled = false;
        }
    }

    /// Tears down the subscription. Safe to call when it doesn't exist.
    /// A disabled subscription is re-enabled first, so a dispatch entry
    /// already in the queue drains instead of stranding; the entry then
    /// sees `present == false` and is skipped. Returns the timer entry to
    /// remove, if any. The `queued` flag is left alone for the same reason.
    pub fn delete(&mut self) -> Option<usize> {
        if !self.present {
            return None;
        }

        self.enable();

        self.present = false;
        self.enabled = false;
        self.ready = false;

        self.timer_key.take()
    }

    /// True when a dispatch entry should be queued for this source.
    pub fn needs_dispatch(&self) -> bool {
        self.present && self.enabled && self.ready && !self.queued
    }
}
