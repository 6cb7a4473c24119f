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

//! The user-receive event dispatch table: every event a posted
//! priority-list receive (or multi-recv parent) can observe, routed to
//! the handler that owns that event type.

use crate::deferred::DeferredTable;
use crate::error::{EngineError, EngineResult};
use crate::nic::{DisableReason, EventKind, ReturnCode, SwManagedReason, TargetEvent};
use crate::rdzv;
use crate::request::{RequestId, RequestPool};

/// What the caller must do next in response to a dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterOutcome {
    /// The buffer attached to the priority list; nothing further.
    Linked,
    /// The NIC asked for software-managed mode instead of attaching.
    SoftwareManaged(SwManagedReason),
    /// The append failed for lack of list space.
    LinkFailedNoSpace,
    /// A manual (not auto-) unlink completed; the request is free to
    /// release once any in-flight children drain.
    Unlinked,
    /// A Put-Overflow event with no Put partner yet: deposited.
    PutOverflowDeposited,
    /// A Put-Overflow event whose Put partner had already arrived.
    PutOverflowMatched { target_req: RequestId, event: TargetEvent, mrecv_start: usize, mrecv_len: usize },
    /// An eager Put delivered directly to a priority-list buffer (no
    /// overflow correlation needed: `manage_local` orders Put after any
    /// Put-Overflow for the same transaction).
    PutDelivered { child: RequestId },
    /// The eager portion of a rendezvous message landed; the transaction
    /// is still pending its Rendezvous and Reply (and maybe Ack) events.
    RendezvousPending { child: RequestId },
    /// A rendezvous transaction observed all of its expected events and
    /// is ready to report completion.
    RendezvousComplete { child: RequestId },
    /// A source-side Send event on an unexpected or rendezvous-notify
    /// path; carries no target-side bookkeeping.
    SendIgnored,
}

/// Dispatches one target-list event against its owning request, the
/// priority-list analogue of `oflow::on_put`/`on_link_ok`/`on_unlink`.
pub fn dispatch(
    pool: &mut RequestPool,
    deferred: &mut DeferredTable<()>,
    req_id: RequestId,
    event: &TargetEvent,
) -> EngineResult<RouterOutcome> {
    match event.kind {
        EventKind::Link => match event.return_code {
            ReturnCode::Ok => Ok(RouterOutcome::Linked),
            ReturnCode::PtlteSoftwareManaged(reason) => Ok(RouterOutcome::SoftwareManaged(reason)),
            ReturnCode::NoSpace => Ok(RouterOutcome::LinkFailedNoSpace),
            other => Err(EngineError::Fatal(format!("unexpected Link return code {:?}", other))),
        },

        EventKind::Unlink => {
            let recv = pool.get_mut(req_id).ok_or(EngineError::NotFound)?.recv_mut();
            recv.unlinked = true;
            Ok(RouterOutcome::Unlinked)
        }

        EventKind::PutOverflow => {
            let mrecv_start = event.start as usize;
            let mrecv_len = event.mlength;
            let (found, matched) = deferred.match_or_insert(req_id, event.clone(), mrecv_start, mrecv_len);
            if !matched {
                return Ok(RouterOutcome::PutOverflowDeposited);
            }
            let def_ev = found.expect("matched deferred lookup always returns an entry");
            Ok(RouterOutcome::PutOverflowMatched {
                target_req: def_ev.req,
                event: def_ev.event,
                mrecv_start: def_ev.mrecv_start,
                mrecv_len: def_ev.mrecv_len,
            })
        }

        EventKind::Put => {
            let recv = pool.get_mut(req_id).ok_or(EngineError::NotFound)?.recv_mut();
            recv.tgt_event = Some(EventKind::Put);
            recv.initiator = event.initiator;
            recv.rlen = event.rlength;
            recv.rc = event.return_code;
            recv.data_len = event.mlength.min(recv.ulen);
            if event.rendezvous {
                recv.rdzv_mlen = event.mlength;
                return match rdzv::recv_req_event(pool, req_id, EventKind::Put) {
                    rdzv::RdzvEventOutcome::Pending => Ok(RouterOutcome::RendezvousPending { child: req_id }),
                    rdzv::RdzvEventOutcome::Complete => Ok(RouterOutcome::RendezvousComplete { child: req_id }),
                };
            }
            Ok(RouterOutcome::PutDelivered { child: req_id })
        }

        EventKind::Rendezvous | EventKind::Reply | EventKind::Ack => {
            match rdzv::recv_req_event(pool, req_id, event.kind) {
                rdzv::RdzvEventOutcome::Pending => Ok(RouterOutcome::RendezvousPending { child: req_id }),
                rdzv::RdzvEventOutcome::Complete => Ok(RouterOutcome::RendezvousComplete { child: req_id }),
            }
        }

        EventKind::Send => Ok(RouterOutcome::SendIgnored),

        other => Err(EngineError::Fatal(format!("event kind {:?} not valid on the receive router", other))),
    }
}

/// The manual disable path's pre-check on `event.return_code` for a
/// PtlTE-disable event arriving outside a Link — shares
/// `DisableReason` with the flow-control state machine's trigger.
pub fn disable_reason_of(rc: ReturnCode) -> Option<DisableReason> {
    match rc {
        ReturnCode::PtlteDisabled(reason) => Some(reason),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::ReturnCode;
    use crate::request::{Payload, RecvFlags, RecvPayload};

    fn recv_req(pool: &mut RequestPool) -> RequestId {
        let payload = RecvPayload::new(vec![0u8; 64], 0, 0, u32::MAX, RecvFlags::empty(), false);
        pool.alloc(0, Payload::Recv(payload))
    }

    fn ev(kind: EventKind, rc: ReturnCode) -> TargetEvent {
        TargetEvent {
            kind,
            return_code: rc,
            user_ptr: 0,
            initiator: 1,
            match_bits: 0,
            start: 0,
            mlength: 16,
            rlength: 16,
            rendezvous: false,
            auto_unlinked: false,
            manage_local: false,
            payload: Vec::new(),
        }
    }

    #[test]
    fn link_ok_reports_linked() {
        let mut pool = RequestPool::new();
        let mut deferred = DeferredTable::new(8);
        let id = recv_req(&mut pool);
        let outcome = dispatch(&mut pool, &mut deferred, id, &ev(EventKind::Link, ReturnCode::Ok)).unwrap();
        assert_eq!(outcome, RouterOutcome::Linked);
    }

    #[test]
    fn link_software_managed_is_reported_not_fatal() {
        let mut pool = RequestPool::new();
        let mut deferred = DeferredTable::new(8);
        let id = recv_req(&mut pool);
        let outcome = dispatch(
            &mut pool,
            &mut deferred,
            id,
            &ev(EventKind::Link, ReturnCode::PtlteSoftwareManaged(SwManagedReason::AppendFail)),
        )
        .unwrap();
        assert_eq!(outcome, RouterOutcome::SoftwareManaged(SwManagedReason::AppendFail));
    }

    #[test]
    fn eager_put_delivers_directly() {
        let mut pool = RequestPool::new();
        let mut deferred = DeferredTable::new(8);
        let id = recv_req(&mut pool);
        let outcome = dispatch(&mut pool, &mut deferred, id, &ev(EventKind::Put, ReturnCode::Ok)).unwrap();
        assert_eq!(outcome, RouterOutcome::PutDelivered { child: id });
    }

    #[test]
    fn rendezvous_put_is_pending_until_reply() {
        let mut pool = RequestPool::new();
        let mut deferred = DeferredTable::new(8);
        let id = recv_req(&mut pool);
        let mut rdzv_put = ev(EventKind::Put, ReturnCode::Ok);
        rdzv_put.rendezvous = true;
        let outcome = dispatch(&mut pool, &mut deferred, id, &rdzv_put).unwrap();
        assert_eq!(outcome, RouterOutcome::RendezvousPending { child: id });

        dispatch(&mut pool, &mut deferred, id, &ev(EventKind::Rendezvous, ReturnCode::Ok)).unwrap();
        let outcome = dispatch(&mut pool, &mut deferred, id, &ev(EventKind::Reply, ReturnCode::Ok)).unwrap();
        assert_eq!(outcome, RouterOutcome::RendezvousComplete { child: id });
    }

    #[test]
    fn put_overflow_then_put_overflow_partner_matches() {
        let mut pool = RequestPool::new();
        let mut deferred = DeferredTable::new(8);
        let id = recv_req(&mut pool);
        let outcome = dispatch(&mut pool, &mut deferred, id, &ev(EventKind::PutOverflow, ReturnCode::Ok)).unwrap();
        assert_eq!(outcome, RouterOutcome::PutOverflowDeposited);
    }

    #[test]
    fn send_event_is_ignored() {
        let mut pool = RequestPool::new();
        let mut deferred = DeferredTable::new(8);
        let id = recv_req(&mut pool);
        let outcome = dispatch(&mut pool, &mut deferred, id, &ev(EventKind::Send, ReturnCode::Ok)).unwrap();
        assert_eq!(outcome, RouterOutcome::SendIgnored);
    }
}
