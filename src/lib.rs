/* Copyright (c) 2019 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! A software model of a NIC messaging engine's portal-table offload:
//! priority/overflow/unexpected lists, the rendezvous long-message
//! protocol, flow control, and the FI_PEEK/FI_CLAIM probe flows, all
//! driven off the generic `Nic` hardware seam in `nic`.
//!
//! `Endpoint` is the single entry point applications hold: every
//! `send`/`recv`/`peek`/`claim` call and every `progress()` poll takes
//! its one lock (`endpoint::Inner`) and leaves having either completed
//! inline or pushed an entry onto the completion queue in `completion`.
//! Nothing here talks to real hardware directly; a concrete `Nic` is
//! supplied by the caller, and `mock_nic::MockNic` stands in for tests.

pub mod completion;
pub mod config;
pub mod deferred;
pub mod endpoint;
pub mod error;
pub mod matchbits;
pub mod mrecv;
pub mod nic;
pub mod oflow;
pub mod rdzv;
pub mod request;
pub mod rx;
pub mod stats;
pub mod tx;
pub mod unexpected;

#[cfg(test)]
mod mock_nic;

pub use completion::{CqError, CqFlags, Completion};
pub use config::EngineConfig;
pub use endpoint::Endpoint;
pub use error::{EngineError, EngineResult};
pub use nic::Nic;
pub use request::{RecvFlags, RequestId, SendFlags};
