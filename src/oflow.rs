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

//! Overflow buffers: where unexpected Sends land.
//!
//! Overflow buffers only ever see Link, Unlink, and Put events. A Put
//! here must be correlated with the Put-Overflow event the matching
//! priority-list receive buffer generated — whichever arrives first is
//! deposited into the deferred-event table, and the second drives the
//! handler. `oflow_cb` is that handler, plus the LE-pool preemption
//! watchdog consulted on every successful Link when hybrid mode is
//! asking for them.

use crate::deferred::DeferredTable;
use crate::nic::{DisableReason, LeStats, ReturnCode, TargetEvent};
use crate::request::RequestId;

/// One linked overflow buffer. `bufs_linked` on the owning pool tracks
/// how many of these are currently posted to the NIC.
///
/// `cur_offset` is the count of unconsumed-byte accounting described in
/// the data model: it only increases, and the buffer is released back
/// to the pool exactly once it reaches `unlink_length`. `unlink_length`
/// is the sentinel "unknown" (`None`) until the auto-unlink event sets
/// it.
#[derive(Debug, Clone)]
pub struct OflowBuf {
    pub req: RequestId,
    pub size: usize,
    pub linked: bool,
    pub cur_offset: usize,
    pub unlink_length: Option<usize>,
}

pub struct OflowPool {
    pub bufs: Vec<OflowBuf>,
    pub bufs_linked: u32,
    pub buf_size: usize,
    pub min_posted: usize,
    pub max_cached: usize,
}

impl OflowPool {
    pub fn new(buf_size: usize, min_posted: usize, max_cached: usize) -> Self {
        OflowPool { bufs: Vec::new(), bufs_linked: 0, buf_size, min_posted, max_cached }
    }

    pub fn needs_replenish(&self) -> bool {
        (self.bufs_linked as usize) < self.min_posted
    }

    fn find_mut(&mut self, req: RequestId) -> Option<&mut OflowBuf> {
        self.bufs.iter_mut().find(|b| b.req == req)
    }

    /// Whether `req` names one of this pool's overflow buffers, used by
    /// the event router to decide whether an incoming event belongs to
    /// the overflow list or the priority list.
    pub fn contains(&self, req: RequestId) -> bool {
        self.bufs.iter().any(|b| b.req == req)
    }

    /// Registers a freshly-linked overflow buffer, called after emitting
    /// its `AppendOverflow` command.
    pub fn insert(&mut self, req: RequestId, size: usize) {
        self.bufs.push(OflowBuf { req, size, linked: true, cur_offset: 0, unlink_length: None });
        self.bufs_linked += 1;
    }

    /// Debits `consumed` bytes of a Put landed on `req`'s buffer
    /// (Invariant 3), releasing it back to the pool exactly once
    /// `cur_offset` reaches the recorded auto-unlink length. Returns
    /// whether this call released the buffer.
    pub fn debit(&mut self, req: RequestId, consumed: usize) -> bool {
        let released = match self.find_mut(req) {
            Some(buf) => {
                buf.cur_offset += consumed;
                buf.unlink_length == Some(buf.cur_offset)
            }
            None => false,
        };
        if released {
            self.bufs.retain(|b| b.req != req);
        }
        released
    }
}

/// What the caller (the RX router) must do in response to an overflow
/// buffer event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OflowOutcome {
    /// Link succeeded; nothing further needed.
    Linked,
    /// Link failed for lack of space: the caller should move the RX
    /// context toward `PendingPtlteDisable`.
    LinkFailed,
    /// A successful Link pushed LE-pool usage over the preemption
    /// threshold: the caller should force a software-mode transition.
    PreemptRequested,
    /// A manual Unlink completed; the buffer is free to release.
    Unlinked,
    /// A zero-byte unexpected Put: nothing further needed.
    DroppedZeroByte,
    /// This Put's partner (a Put-Overflow from the matching receive
    /// buffer) hasn't arrived yet; deposited in the deferred table.
    Deposited,
    /// This Put's partner had already arrived; the caller should copy
    /// data into the waiting request and release the deferred entry.
    Matched { target_req: RequestId, event: TargetEvent, mrecv_start: usize, mrecv_len: usize },
}

/// Examines LE-pool usage watermarks and reports whether a preemptive
/// hardware-to-software transition should be forced. Skid between the
/// two counters is expected: they are relative to hardware processing of
/// the event, not software processing of it.
pub fn check_le_usage_hybrid_preempt(stats: LeStats) -> bool {
    stats.lpe_stat_1 > (stats.lpe_stat_2 >> 1)
}

/// Handles a Link-success event on an overflow buffer.
pub fn on_link_ok(hybrid_preemptive: bool, stats: LeStats) -> OflowOutcome {
    if !hybrid_preemptive {
        return OflowOutcome::Linked;
    }
    if check_le_usage_hybrid_preempt(stats) {
        OflowOutcome::PreemptRequested
    } else {
        OflowOutcome::Linked
    }
}

/// Handles a Link-failure event (`NoSpace`): the buffer never attached.
pub fn on_link_failed(_reason: DisableReason) -> OflowOutcome {
    OflowOutcome::LinkFailed
}

/// Handles a manual Unlink (teardown). Automatic unlinks arrive folded
/// into the triggering Put event instead (`event.auto_unlinked`).
pub fn on_unlink(pool: &mut OflowPool, req: RequestId) -> OflowOutcome {
    if let Some(buf) = pool.find_mut(req) {
        buf.linked = false;
    }
    pool.bufs_linked = pool.bufs_linked.saturating_sub(1);
    OflowOutcome::Unlinked
}

/// Handles a Put landing on an overflow buffer: bookkeeping for
/// auto-unlink, then correlates against the deferred-event table.
pub fn on_put(
    pool: &mut OflowPool,
    deferred: &mut DeferredTable<()>,
    req: RequestId,
    event: TargetEvent,
) -> OflowOutcome {
    debug_assert_eq!(event.return_code, ReturnCode::Ok);

    if event.auto_unlinked {
        if let Some(buf) = pool.find_mut(req) {
            buf.unlink_length = Some((event.start as usize) + event.mlength);
            buf.linked = false;
        }
        pool.bufs_linked = pool.bufs_linked.saturating_sub(1);
    }

    if event.rlength == 0 {
        return OflowOutcome::DroppedZeroByte;
    }

    let mrecv_start = event.start as usize;
    let mrecv_len = event.mlength;
    let (found, matched) = deferred.match_or_insert(req, event.clone(), mrecv_start, mrecv_len);
    if !matched {
        return OflowOutcome::Deposited;
    }
    let def_ev = found.expect("matched deferred lookup always returns an entry");
    OflowOutcome::Matched {
        target_req: def_ev.req,
        event: def_ev.event,
        mrecv_start: def_ev.mrecv_start,
        mrecv_len: def_ev.mrecv_len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::EventKind;

    fn put(start: u64, mlength: usize, rlength: usize, auto_unlinked: bool) -> TargetEvent {
        TargetEvent {
            kind: EventKind::Put,
            return_code: ReturnCode::Ok,
            user_ptr: 0,
            initiator: 3,
            match_bits: 0,
            start,
            mlength,
            rlength,
            rendezvous: false,
            auto_unlinked,
            manage_local: false,
            payload: Vec::new(),
        }
    }

    #[test]
    fn zero_byte_put_is_dropped_without_touching_deferred_table() {
        let mut pool = OflowPool::new(4096, 3, 3);
        let mut deferred = DeferredTable::new(8);
        let outcome = on_put(&mut pool, &mut deferred, RequestId(1), put(0, 0, 0, false));
        assert_eq!(outcome, OflowOutcome::DroppedZeroByte);
        assert!(deferred.is_empty());
    }

    #[test]
    fn first_put_deposits_second_matches() {
        let mut pool = OflowPool::new(4096, 3, 3);
        let mut deferred = DeferredTable::new(8);
        let outcome = on_put(&mut pool, &mut deferred, RequestId(1), put(128, 32, 32, false));
        assert_eq!(outcome, OflowOutcome::Deposited);

        let mut partner = put(128, 32, 32, false);
        partner.kind = EventKind::PutOverflow;
        let outcome = on_put(&mut pool, &mut deferred, RequestId(2), partner);
        match outcome {
            OflowOutcome::Matched { target_req, .. } => assert_eq!(target_req, RequestId(1)),
            other => panic!("expected Matched, got {:?}", other),
        }
    }

    #[test]
    fn auto_unlinked_put_decrements_linked_count() {
        let mut pool = OflowPool::new(4096, 3, 3);
        pool.bufs.push(OflowBuf { req: RequestId(9), size: 4096, linked: true, cur_offset: 0, unlink_length: None });
        pool.bufs_linked = 1;
        let mut deferred = DeferredTable::new(8);
        on_put(&mut pool, &mut deferred, RequestId(9), put(4000, 96, 96, true));
        assert_eq!(pool.bufs_linked, 0);
        assert!(!pool.bufs[0].linked);
        assert_eq!(pool.bufs[0].unlink_length, Some(4096));
    }

    #[test]
    fn debit_releases_buffer_once_cur_offset_reaches_unlink_length() {
        let mut pool = OflowPool::new(4096, 3, 3);
        pool.insert(RequestId(9), 4096);
        pool.bufs[0].unlink_length = Some(96);
        assert!(!pool.debit(RequestId(9), 32));
        assert_eq!(pool.bufs[0].cur_offset, 32);
        assert!(!pool.debit(RequestId(9), 32));
        assert!(pool.debit(RequestId(9), 32));
        assert!(!pool.contains(RequestId(9)));
    }

    #[test]
    fn hybrid_preempt_triggers_past_half_capacity_skid() {
        assert!(!check_le_usage_hybrid_preempt(LeStats { lpe_stat_1: 40, lpe_stat_2: 100 }));
        assert!(check_le_usage_hybrid_preempt(LeStats { lpe_stat_1: 51, lpe_stat_2: 100 }));
    }
}
