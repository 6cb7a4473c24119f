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

//! The software unexpected-send list and the FI_PEEK/FI_CLAIM probe
//! flows layered on top of it.
//!
//! An unexpected Send is one that arrived (or was onloaded) before a
//! matching receive was posted. Once onloaded, each is kept here as a
//! `UxSend` until a `recv` call matches it, or a claim probe binds it
//! for later completion.

use crate::error::{EngineError, EngineResult};
use crate::matchbits::MatchBits;
use crate::nic::TargetEvent;
use crate::request::{mrecv_req_dup, RequestId, RequestPool};

/// Tag match as CXI defines it: `(tag & ~ignore) == (candidate & ~ignore)`.
pub fn tag_match(candidate: u64, tag: u64, ignore: u64) -> bool {
    (candidate | ignore) == (tag | ignore)
}

/// Address match. A wildcard `match_id` (`u32::MAX`) matches anything;
/// otherwise the initiator's encoded id must match exactly.
pub fn init_match(initiator: u32, match_id: u32) -> bool {
    match_id == u32::MAX || initiator == match_id
}

/// An onloaded unexpected Send, pending a posted receive to drain into.
#[derive(Debug, Clone)]
pub struct UxSend {
    pub id: u64,
    pub put_event: TargetEvent,
    pub oflow_req: RequestId,
    pub mrecv_start: usize,
    pub mrecv_len: usize,
    /// Set once an FI_CLAIM probe has bound this entry; a later `recv`
    /// posted with `FI_CLAIM` must present the matching claim context
    /// rather than matching tags again.
    pub claimed: bool,
}

#[derive(Debug, Default)]
pub struct UnexpectedList {
    entries: Vec<UxSend>,
    next_id: u64,
}

impl UnexpectedList {
    pub fn new() -> Self {
        UnexpectedList::default()
    }

    /// Appends an entry, stamping it with a stable id that survives
    /// later removals elsewhere in the list (used to correlate an
    /// FI_CLAIM probe's context back to this exact entry).
    pub fn push(&mut self, mut ux: UxSend) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        ux.id = id;
        self.entries.push(ux);
        id
    }

    /// Finds an entry by its stable id, for consuming a previously
    /// claimed message.
    pub fn find_by_id(&self, id: u64) -> Option<usize> {
        self.entries.iter().position(|ux| ux.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the first unclaimed entry matching `tag`/`ignore`/`match_id`,
    /// used both by ordinary `recv` matching against onloaded sends and by
    /// FI_PEEK.
    pub fn find_match(&self, tag: u64, ignore: u64, match_id: u32, tagged: bool) -> Option<usize> {
        self.entries.iter().position(|ux| {
            if ux.claimed {
                return false;
            }
            let mb = MatchBits::decode(ux.put_event.match_bits);
            if mb.tagged != tagged {
                return false;
            }
            if tagged && !tag_match(mb.tag as u64, tag, ignore) {
                return false;
            }
            init_match(ux.put_event.initiator, match_id)
        })
    }

    /// Removes and returns a matched entry, for delivery to a posted
    /// receive.
    pub fn take(&mut self, index: usize) -> UxSend {
        self.entries.remove(index)
    }

    /// Borrows an entry without removing it, for FI_PEEK's diagnostic
    /// dump and `build_ux_entry_info`.
    pub fn peek(&self, index: usize) -> &UxSend {
        &self.entries[index]
    }

    /// Every onloaded entry, for `build_ux_entry_info`'s full-list dump.
    pub fn iter(&self) -> impl Iterator<Item = &UxSend> {
        self.entries.iter()
    }

    /// Marks a matched entry as claimed in place, for FI_CLAIM: the
    /// message stays onloaded but further `recv` matching skips it until
    /// the claim completes.
    pub fn mark_claimed(&mut self, index: usize) {
        self.entries[index].claimed = true;
    }
}

/// Outcome of draining an unexpected Send into a posted receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UxOutcome {
    /// Delivered in full; the matched request (a multi-recv child, if
    /// applicable) is complete and ready to report.
    Delivered { matched_req: RequestId, bytes: usize },
    /// The initiator required match-completion guarantees: the receive
    /// event must wait until that notification finishes.
    MatchCompletePending { matched_req: RequestId },
    /// This was the eager portion of a rendezvous message; the rest is
    /// deferred until the RGet completes.
    RendezvousDeferred { matched_req: RequestId },
}

/// Progresses an unexpected Send against a posted receive request,
/// copying the eager payload out of the overflow buffer snapshot and
/// updating the (possibly newly duplicated, for multi-recv) target
/// request's bookkeeping.
pub fn deliver_ux_send(
    pool: &mut RequestPool,
    match_req_id: RequestId,
    oflow_bytes: &[u8],
    put_event: &TargetEvent,
    mrecv_start: usize,
    mrecv_len: usize,
) -> EngineResult<UxOutcome> {
    let multi_recv = pool.get(match_req_id).ok_or(EngineError::NotFound)?.recv().multi_recv;

    let target_id = if multi_recv {
        if put_event.rendezvous {
            match_req_id
        } else {
            mrecv_req_dup(pool, match_req_id, mrecv_start)
        }
    } else {
        match_req_id
    };

    let mb = MatchBits::decode(put_event.match_bits);

    let (copy_len, child_offset) = {
        let target = pool.get_mut(target_id).ok_or(EngineError::NotFound)?;
        let recv = target.recv_mut();
        recv.tgt_event = Some(put_event.kind);
        recv.initiator = put_event.initiator;
        recv.rlen = put_event.rlength;
        recv.rc = put_event.return_code;

        if multi_recv {
            recv.data_len = mrecv_len;
        } else {
            recv.data_len = put_event.rlength.min(recv.ulen);
        }

        if put_event.rendezvous {
            recv.rdzv_mlen = put_event.mlength;
            return Ok(UxOutcome::RendezvousDeferred { matched_req: target_id });
        }

        (put_event.mlength.min(recv.data_len), recv.child_offset)
    };

    // A multi-recv child has no buffer of its own (`mrecv_req_dup` clears
    // it); the eager bytes land in the parent's buffer at `child_offset`.
    if multi_recv {
        let parent = pool.get_mut(match_req_id).ok_or(EngineError::NotFound)?;
        let recv = parent.recv_mut();
        if let Some(buf) = recv.buf.as_mut() {
            let dst_start = child_offset.min(buf.len());
            let dst_len = (buf.len() - dst_start).min(copy_len);
            let src_len = oflow_bytes.len().min(copy_len).min(dst_len);
            buf[dst_start..dst_start + src_len].copy_from_slice(&oflow_bytes[..src_len]);
        }
    } else {
        let target = pool.get_mut(target_id).ok_or(EngineError::NotFound)?;
        let recv = target.recv_mut();
        if let Some(buf) = recv.buf.as_mut() {
            let dst_len = buf.len().min(copy_len);
            let src_len = oflow_bytes.len().min(copy_len);
            let n = dst_len.min(src_len);
            buf[..n].copy_from_slice(&oflow_bytes[..n]);
        }
    }

    if mb.match_comp {
        return Ok(UxOutcome::MatchCompletePending { matched_req: target_id });
    }

    Ok(UxOutcome::Delivered { matched_req: target_id, bytes: copy_len })
}

/// Progresses the zero-byte variant: an unexpected Send whose Put
/// Overflow event alone (no companion Put — zero-byte Puts for
/// unexpected sends are dropped at the source) carries everything
/// needed.
pub fn deliver_ux_send_zero_byte(
    pool: &mut RequestPool,
    match_req_id: RequestId,
    oflow_event: &TargetEvent,
    mrecv_start: usize,
) -> EngineResult<UxOutcome> {
    debug_assert_eq!(oflow_event.rlength, 0);
    let multi_recv = pool.get(match_req_id).ok_or(EngineError::NotFound)?.recv().multi_recv;

    let target_id =
        if multi_recv { mrecv_req_dup(pool, match_req_id, mrecv_start) } else { match_req_id };

    let mb = MatchBits::decode(oflow_event.match_bits);
    let target = pool.get_mut(target_id).ok_or(EngineError::NotFound)?;
    let recv = target.recv_mut();
    recv.tgt_event = Some(oflow_event.kind);
    recv.initiator = oflow_event.initiator;
    recv.data_len = 0;

    if mb.match_comp {
        return Ok(UxOutcome::MatchCompletePending { matched_req: target_id });
    }
    Ok(UxOutcome::Delivered { matched_req: target_id, bytes: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::{EventKind, ReturnCode};
    use crate::request::{Payload, RecvFlags, RecvPayload};

    fn ux(tag: u64, tagged: bool, initiator: u32) -> UxSend {
        let mut mb = MatchBits::default();
        mb.tagged = tagged;
        mb.tag = tag as u32;
        UxSend {
            id: 0,
            put_event: TargetEvent {
                kind: EventKind::Put,
                return_code: ReturnCode::Ok,
                user_ptr: 0,
                initiator,
                match_bits: mb.encode(),
                start: 0,
                mlength: 8,
                rlength: 8,
                rendezvous: false,
                auto_unlinked: false,
                manage_local: false,
                payload: Vec::new(),
            },
            oflow_req: RequestId(0),
            mrecv_start: 0,
            mrecv_len: 8,
            claimed: false,
        }
    }

    #[test]
    fn tag_match_respects_ignore_bits() {
        assert!(tag_match(0b1010, 0b1010, 0));
        assert!(tag_match(0b1011, 0b1010, 0b0001));
        assert!(!tag_match(0b1011, 0b1010, 0));
    }

    #[test]
    fn find_match_skips_claimed_entries() {
        let mut list = UnexpectedList::new();
        list.push(ux(42, true, 1));
        list.mark_claimed(0);
        assert!(list.find_match(42, 0, 1, true).is_none());
    }

    #[test]
    fn deliver_ux_send_copies_eager_bytes_into_target_buffer() {
        let mut pool = RequestPool::new();
        let recv = RecvPayload::new(vec![0u8; 8], 42, 0, u32::MAX, RecvFlags::empty(), true);
        let req_id = pool.alloc(0, Payload::Recv(recv));

        let event = TargetEvent {
            kind: EventKind::PutOverflow,
            return_code: ReturnCode::Ok,
            user_ptr: 0,
            initiator: 1,
            match_bits: 0,
            start: 0,
            mlength: 8,
            rlength: 8,
            rendezvous: false,
            auto_unlinked: false,
            manage_local: true,
            payload: Vec::new(),
        };
        let data = [7u8; 8];
        let outcome = deliver_ux_send(&mut pool, req_id, &data, &event, 0, 8).unwrap();
        assert_eq!(outcome, UxOutcome::Delivered { matched_req: req_id, bytes: 8 });
        assert_eq!(pool.get(req_id).unwrap().recv().buf.as_ref().unwrap(), &vec![7u8; 8]);
    }
}
