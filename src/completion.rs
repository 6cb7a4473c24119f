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

//! The completion queue surface user-visible success/error entries land
//! on. The engine never hands a request back to its caller directly;
//! everything is observed here or through the counters in `crate::stats`.

use crate::error::EngineError;
use crate::request::RequestId;
use bitflags::bitflags;

bitflags! {
    #[derive(Default)]
    pub struct CqFlags: u32 {
        const MSG        = 0b0000_0001;
        const TAGGED     = 0b0000_0010;
        const RECV       = 0b0000_0100;
        const SEND       = 0b0000_1000;
        const MULTI_RECV = 0b0001_0000;
    }
}

/// A successful completion. `buf_offset`/`len` describe the slice of the
/// multi-recv parent's buffer a child delivered into; for an ordinary
/// single receive or a send, `buf_offset` is always 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub req_id: RequestId,
    pub context: u64,
    pub flags: CqFlags,
    pub len: usize,
    pub buf_offset: usize,
    pub tag: u64,
    pub data: u64,
}

/// A CQ error entry. Truncation carries the remote length the receive
/// advertised so the application can see how much it was short by;
/// address-unavailable carries the raw peer bytes a reverse AV lookup
/// couldn't resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CqError {
    pub req_id: RequestId,
    pub context: u64,
    pub err: EngineError,
}
