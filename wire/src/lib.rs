// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![deny(missing_debug_implementations, rust_2018_idioms, unused_imports)]

//! Wire-level HTTP/1.1 framing: methods, versions, status codes, request/
//! response parsing, chunked transfer-encoding, and the growable buffers
//! connections read into and write out of.
//!
//! This crate knows nothing about scheduling, dispatch, or jobs — it is the
//! external collaborator the `dispatch` crate's `CommTask` depends on for
//! "request complete" and "bytes to write" events.

pub mod buffer;
pub mod chunked;
pub mod h1;
pub mod method;
pub mod raw_request;
pub mod status;
pub mod version;

pub use buffer::Buffer;
pub use h1::{ParseError, ParseResult};
pub use method::Method;
pub use status::Status;
pub use version::Version;
