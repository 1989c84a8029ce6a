// Copyright 2025 jonefeewang@gmail.com
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

//! Event loop
//!
//! Readiness of every connection is expressed as [`Event`]s. The
//! [`Multiplexer`] owns the per-connection sources (transport reader and
//! timer); events are routed by connection id onto the channels of a
//! `MultipleChannelWorkerPool`, whose workers run the [`EventHandler`].

pub use event::{AcceptRequest, BoxedReader, Event};
pub(crate) use handler::EventHandler;
pub use multiplexer::Multiplexer;

mod event;
mod handler;
mod multiplexer;
