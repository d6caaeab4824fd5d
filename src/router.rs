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

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use thiserror::Error;

const HEADERS_MAX: usize = 32;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("bad request: {0}")]
    BadRequest(&'static str),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("not found")]
    NotFound(#[source] io::Error),
}

impl RouteError {
    pub fn status(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::MethodNotAllowed => 405,
            Self::NotFound(_) => 404,
        }
    }
}

/// An opened file ready to be streamed.
#[derive(Debug)]
pub struct Route {
    pub file: File,
    pub size: u64,

    /// Whether to deflate-compress the body.
    pub deflate: bool,
}

pub struct Router {
    doc_root: PathBuf,
}

impl Router {
    pub fn new(doc_root: PathBuf) -> Self {
        Self { doc_root }
    }

    /// Parses a complete request head and resolves it to a file under the
    /// document root.
    pub fn route(&self, head: &[u8]) -> Result<Route, RouteError> {
        let mut headers = [httparse::EMPTY_HEADER; HEADERS_MAX];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(RouteError::BadRequest("incomplete request head"))
            }
            Err(_) => return Err(RouteError::BadRequest("malformed request head")),
        }

        if req.method != Some("GET") {
            return Err(RouteError::MethodNotAllowed);
        }

        let target = match req.path {
            Some(s) => s,
            None => return Err(RouteError::BadRequest("missing request target")),
        };

        // drop any query string
        let path = match target.find('?') {
            Some(pos) => &target[..pos],
            None => target,
        };

        if !path.starts_with('/') {
            return Err(RouteError::BadRequest("request target must be absolute"));
        }

        // no escaping the document root
        if path.split('/').any(|part| part == "..") {
            return Err(RouteError::NotFound(io::Error::from(
                io::ErrorKind::NotFound,
            )));
        }

        let rel = path.trim_start_matches('/');
        let rel = if rel.is_empty() { "index.html" } else { rel };

        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(self.doc_root.join(rel))
            .map_err(RouteError::NotFound)?;

        let md = file.metadata().map_err(RouteError::NotFound)?;

        if !md.is_file() {
            return Err(RouteError::NotFound(io::Error::from(
                io::ErrorKind::NotFound,
            )));
        }

        // empty bodies are sent raw: there would be no input to terminate
        // a compressed stream with
        let deflate = md.len() > 0 && accepts_deflate(req.headers);

        Ok(Route {
            file,
            size: md.len(),
            deflate,
        })
    }
}

fn accepts_deflate(headers: &[httparse::Header]) -> bool {
    for h in headers.iter() {
        if h.name.eq_ignore_ascii_case("Accept-Encoding") {
            if let Ok(value) = std::str::from_utf8(h.value) {
                return value
                    .split(',')
                    .any(|enc| enc.trim().split(';').next() == Some("deflate"));
            }
        }
    }

    false
}
