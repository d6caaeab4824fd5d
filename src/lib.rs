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

pub mod accesslog;
pub mod buffer;
pub mod connection;
pub mod deflate;
pub mod event;
pub mod registry;
pub mod router;
pub mod server;
pub mod timer;
pub mod watcher;

use log::info;
use server::{Config, Server};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::iterator::Signals;
use std::error::Error;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub fn run(config: &Config) -> Result<(), Box<dyn Error>> {
    info!("starting...");

    {
        let server = Server::new(config)?;

        info!("started");

        wait_for_term()?;

        info!("stopping...");

        server.stop();
    }

    info!("stopped");

    Ok(())
}

fn wait_for_term() -> Result<(), Box<dyn Error>> {
    let mut signals = Signals::new(TERM_SIGNALS)?;

    let term_now = Arc::new(AtomicBool::new(false));

    // ensure two term signals in a row cause an immediate exit
    for signal_type in TERM_SIGNALS {
        signal_hook::flag::register_conditional_shutdown(
            *signal_type,
            1, // exit code
            Arc::clone(&term_now),
        )?;

        signal_hook::flag::register(*signal_type, Arc::clone(&term_now))?;
    }

    for signal in &mut signals {
        match signal {
            signal_type if TERM_SIGNALS.contains(&signal_type) => break,
            _ => unreachable!(),
        }
    }

    Ok(())
}
