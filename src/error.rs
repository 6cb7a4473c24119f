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

//! Error taxonomy for the RX/TX messaging engine.
//!
//! A plain enum instead of `thiserror`/`anyhow`, with `Result<T,
//! EngineError>` threaded through the call stack the way `db::master`
//! threads `Result<Box<Task>, (..)>`.

use std::fmt;

/// The error taxonomy named in the engine's error handling design: every
/// variant maps to one of the kinds the event-handler propagation policy
/// recognizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// NIC command queue full, completion queue full, deferred-event
    /// allocation failed, peer disabled at enqueue, or waiting on another
    /// in-flight event. Caller may retry; engine invariants are unchanged.
    Transient,

    /// FI_PEEK with no match, or the software matcher was exhausted.
    NotFound,

    /// The receive's advertised remote length exceeded the user buffer.
    /// Carries the remote length so a CQ error entry can report it.
    Truncation { rlen: usize },

    /// An unlink was observed before the request matched.
    Canceled,

    /// Reverse address-vector lookup missed for a source-address request.
    /// Carries the raw peer address bytes for the CQ error entry.
    AddressUnavailable { raw: Vec<u8> },

    /// Bad argument or flag combination, validated at the public surface.
    InvalidArgument,

    /// The request was issued while the endpoint was not in a state that
    /// permits it (e.g. posting a receive to a disabled RX context).
    BadState,

    /// Message size exceeds what the selected protocol can carry.
    MessageTooLarge,

    /// A flag combination the public surface does not support.
    BadFlags,

    /// An event/status pair, or a state-graph edge, outside everything
    /// enumerated in the design. Unlike the other variants, this is *not*
    /// meant to be caught and retried: it's a reason to abort.
    Fatal(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Transient => write!(f, "transient: retry"),
            EngineError::NotFound => write!(f, "not found"),
            EngineError::Truncation { rlen } => {
                write!(f, "truncated, remote length {}", rlen)
            }
            EngineError::Canceled => write!(f, "canceled"),
            EngineError::AddressUnavailable { .. } => write!(f, "address unavailable"),
            EngineError::InvalidArgument => write!(f, "invalid argument"),
            EngineError::BadState => write!(f, "bad endpoint state"),
            EngineError::MessageTooLarge => write!(f, "message too large"),
            EngineError::BadFlags => write!(f, "unsupported flags"),
            EngineError::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = Result<T, EngineError>;

/// Panics with a consistent message. Called from the wildcard arm of an
/// exhaustive match on an event/state pair the state graph or dispatch
/// table does not admit. Not a recoverable error.
#[track_caller]
pub fn fatal(ctx: &str) -> ! {
    panic!("rxtx-engine: fatal condition: {}", ctx);
}
