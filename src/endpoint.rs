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

//! Ties an RX context and a TX context together behind one endpoint lock
//! and exposes the public surface: `recv_common`, `send_common`,
//! `recv_cancel`, `build_ux_entry_info`, and the `progress` loop that
//! drains NIC events. Every other module in this crate is a pure
//! component the endpoint drives; this is the only place state from more
//! than one of them is mutated in a single call, mirroring the way
//! `db::Master` is the one type that reaches into `tenants`, `heap`, and
//! `extensions` together.

use std::collections::VecDeque;

use log::{debug, warn};
use spin::Mutex;

use crate::completion::{CqError, CqFlags, Completion};
use crate::config::EngineConfig;
use crate::error::{fatal, EngineError, EngineResult};
use crate::matchbits::{LeType, MatchBits};
use crate::mrecv;
use crate::nic::{
    CaDdr, Command, CtrlEvent, DisableReason, Event, EventKind, InitEvent, Nic, PtlList,
    ReturnCode, TargetEvent,
};
use crate::oflow::{self, OflowOutcome};
use crate::rdzv;
use crate::request::{Payload, RecvFlags, RecvPayload, RequestId, RequestPool, SendFlags, SendPayload};
use crate::rx::flowcontrol::{DisableTrigger, RxState};
use crate::rx::{router, RxContext};
use crate::stats::{HmemIface, RxStats, TxStats};
use crate::tx::{self, FcPeerTable, TxOutcome, TxProtocol};
use crate::unexpected::{self, UxOutcome, UxSend};

/// A diagnostic snapshot of one onloaded (or still-hardware-resident,
/// where the `Nic` integrator supports it) unexpected message, returned
/// by `build_ux_entry_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UxEntryInfo {
    pub claim_id: u64,
    pub initiator: u32,
    pub tag: u64,
    pub tagged: bool,
    pub len: usize,
}

/// The RX-side state an endpoint owns: the shared request pool's
/// receive-side bookkeeping lives in `Endpoint::pool`, but everything
/// else specific to the receive path (overflow pool, unexpected list,
/// deferred-event table, flow-control state machine) is grouped here.
struct RxSide {
    ctx: RxContext,
    /// Receives posted while in software-managed mode (or queued for
    /// replay after a forced hardware transition), matched by linear
    /// `recv_common`-time scan instead of a NIC append.
    sw_recv_queue: VecDeque<RequestId>,
    /// Receives whose `AppendPriority`/`AppendOverflow` needs reissuing
    /// once flow control re-enables hardware offload.
    replay_queue: VecDeque<RequestId>,
    stats: RxStats,
}

/// The TX-side state: the peer-disabled table, the FIFO of in-flight
/// sends (order is the ordering guarantee the flow-control replay must
/// preserve), and the shared TX-credit counter §9's Open Question notes
/// is coupled with RX-issued rendezvous Gets.
struct TxSide {
    fc_peers: FcPeerTable,
    msg_queue: VecDeque<RequestId>,
    stats: TxStats,
    next_tx_id: u16,
    next_rdzv_id: u64,
}

struct Inner<N: Nic> {
    config: EngineConfig,
    nic: N,
    pool: RequestPool,
    rx: RxSide,
    tx: TxSide,
    /// `orx_tx_reqs`: TX credits in use, shared between RX-issued
    /// rendezvous Gets and ordinary TX sends, bounded by `config.max_tx`.
    tx_credits_used: usize,
    cq: Vec<Completion>,
    cq_err: Vec<CqError>,
}

/// One endpoint: an RX context, a TX context, a shared request pool, and
/// the NIC collaborator they drive, all behind a single lock per §5's
/// single-threaded-cooperative-per-endpoint model.
pub struct Endpoint<N: Nic> {
    inner: Mutex<Inner<N>>,
}

impl<N: Nic> Endpoint<N> {
    pub fn new(config: EngineConfig, nic: N) -> Self {
        let rx_ctx = RxContext::new(&config);
        let inner = Inner {
            config,
            nic,
            pool: RequestPool::new(),
            rx: RxSide {
                ctx: rx_ctx,
                sw_recv_queue: VecDeque::new(),
                replay_queue: VecDeque::new(),
                stats: RxStats::new(),
            },
            tx: TxSide {
                fc_peers: FcPeerTable::new(),
                msg_queue: VecDeque::new(),
                stats: TxStats::default(),
                next_tx_id: 0,
                next_rdzv_id: 0,
            },
            tx_credits_used: 0,
            cq: Vec::new(),
            cq_err: Vec::new(),
        };
        Endpoint { inner: Mutex::new(inner) }
    }

    /// Transitions the RX context from `Disabled` to `Enabled`, required
    /// before any receive can be posted to hardware.
    pub fn enable(&self) {
        self.inner.lock().rx.ctx.flow_control.enable();
    }

    /// Drains one success completion, oldest first.
    pub fn poll_cq(&self) -> Option<Completion> {
        let mut inner = self.inner.lock();
        if inner.cq.is_empty() {
            None
        } else {
            Some(inner.cq.remove(0))
        }
    }

    /// Drains one error completion, oldest first.
    pub fn poll_cq_err(&self) -> Option<CqError> {
        let mut inner = self.inner.lock();
        if inner.cq_err.is_empty() {
            None
        } else {
            Some(inner.cq_err.remove(0))
        }
    }

    // ---- Public receive surface -------------------------------------

    /// `recv_common`: posts a receive. `FI_PEEK` and `FI_CLAIM` take a
    /// different path (§4.9 tail) and never post a buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn recv_common(
        &self,
        buf: Vec<u8>,
        match_id: u32,
        tag: u64,
        ignore: u64,
        context: u64,
        flags: RecvFlags,
        tagged: bool,
    ) -> EngineResult<RequestId> {
        if flags.contains(RecvFlags::MULTI_RECV) && buf.len() < 1 {
            return Err(EngineError::InvalidArgument);
        }

        let mut inner = self.inner.lock();

        if flags.contains(RecvFlags::PEEK) {
            return Self::peek_locked(&mut inner, tag, ignore, match_id, tagged, flags, context);
        }

        let claim_context = if flags.contains(RecvFlags::CLAIM) { Some(context) } else { None };

        let payload = RecvPayload::new(buf, tag, ignore, match_id, flags, tagged);
        let req_id = inner.pool.alloc(context, Payload::Recv(payload));
        inner.pool.get_mut(req_id).unwrap().recv_mut().claim_context = claim_context;

        if flags.contains(RecvFlags::CLAIM) {
            return Self::claim_locked(&mut inner, req_id);
        }

        if let Some(done) = Self::try_match_unexpected_locked(&mut inner, req_id)? {
            return Ok(done);
        }

        Self::post_recv_locked(&mut inner, req_id)?;
        Ok(req_id)
    }

    fn post_recv_locked(inner: &mut Inner<N>, req_id: RequestId) -> EngineResult<()> {
        let hw = Self::hw_posting_enabled(inner);
        if hw {
            let recv = inner.pool.get(req_id).unwrap().recv();
            let ulen = recv.ulen;
            let (tag, ignore, match_id) = (recv.tag, recv.ignore, recv.match_id);
            match inner.nic.emit(Command::AppendPriority { req_id: req_id.0, tag, ignore, match_id, len: ulen }) {
                Ok(()) => {
                    inner.pool.get_mut(req_id).unwrap().recv_mut().hw_offloaded = true;
                }
                Err(EngineError::Transient) => {
                    inner.rx.replay_queue.push_back(req_id);
                }
                Err(e) => return Err(e),
            }
        } else {
            inner.rx.sw_recv_queue.push_back(req_id);
        }
        Ok(())
    }

    /// Whether a freshly-posted receive should go straight to the
    /// hardware priority list: only while fully hardware-offloaded.
    fn hw_posting_enabled(inner: &Inner<N>) -> bool {
        inner.rx.ctx.flow_control.state == RxState::Enabled
    }

    /// Scans the onloaded unexpected list for a match; on a hit, drains
    /// it into the just-posted request and reports (or defers, for
    /// rendezvous/match-complete) the completion.
    fn try_match_unexpected_locked(inner: &mut Inner<N>, req_id: RequestId) -> EngineResult<Option<RequestId>> {
        loop {
            let (tag, ignore, match_id, tagged) = {
                let recv = inner.pool.get(req_id).unwrap().recv();
                (recv.tag, recv.ignore, recv.match_id, recv.tagged)
            };
            let Some(idx) = inner.rx.ctx.unexpected.find_match(tag, ignore, match_id, tagged) else {
                return Ok(None);
            };
            let ux = inner.rx.ctx.unexpected.take(idx);
            let outcome = Self::drain_ux_into(inner, req_id, ux)?;
            match outcome {
                DrainOutcome::Done(done) => return Ok(Some(done)),
                DrainOutcome::KeepMatching => continue,
            }
        }
    }

    fn drain_ux_into(inner: &mut Inner<N>, req_id: RequestId, ux: UxSend) -> EngineResult<DrainOutcome> {
        let zero_byte = ux.put_event.rlength == 0;
        let outcome = if zero_byte {
            unexpected::deliver_ux_send_zero_byte(&mut inner.pool, req_id, &ux.put_event, ux.mrecv_start)?
        } else {
            inner.rx.ctx.oflow.debit(ux.oflow_req, ux.put_event.mlength);
            unexpected::deliver_ux_send(
                &mut inner.pool,
                req_id,
                &ux.put_event.payload,
                &ux.put_event,
                ux.mrecv_start,
                ux.mrecv_len,
            )?
        };

        match outcome {
            UxOutcome::Delivered { matched_req, .. } => {
                let parent_released = Self::complete_recv(inner, matched_req)?;
                let still_multi_recv = inner.pool.get(req_id).map(|r| r.recv().multi_recv).unwrap_or(false);
                if parent_released || !still_multi_recv {
                    Ok(DrainOutcome::Done(req_id))
                } else {
                    Ok(DrainOutcome::KeepMatching)
                }
            }
            UxOutcome::MatchCompletePending { matched_req } => {
                let initiator = ux.put_event.initiator;
                Self::emit_match_complete_notify(inner, initiator, ux.put_event.match_bits)?;
                Ok(DrainOutcome::Done(matched_req))
            }
            UxOutcome::RendezvousDeferred { matched_req } => {
                // The eager prefix landed; the Get for the remainder is
                // only issued once the Rendezvous event itself names the
                // initiator DFA, so just reserve the transaction count.
                rdzv::recv_req_event(&mut inner.pool, matched_req, EventKind::PutOverflow);
                Ok(DrainOutcome::Done(matched_req))
            }
        }
    }

    fn emit_match_complete_notify(inner: &mut Inner<N>, initiator: u32, put_match_bits: u64) -> EngineResult<()> {
        let mb = MatchBits::decode(put_match_bits);
        let mut notify = MatchBits::default();
        notify.le_type = Some(LeType::Zbp);
        notify.set_tx_id(mb.tx_id());
        let dest = CaDdr { nic: initiator, pid: 0, vni: 0 };
        inner.nic.emit(Command::ZeroBytePut { req_id: u32::MAX, dest, match_bits: notify.encode() })
    }

    /// FI_PEEK: searches the software unexpected list (and, if offload is
    /// enabled, asks the NIC via a non-deleting `Search`) without
    /// consuming anything.
    fn peek_locked(
        inner: &mut Inner<N>,
        tag: u64,
        ignore: u64,
        match_id: u32,
        tagged: bool,
        flags: RecvFlags,
        context: u64,
    ) -> EngineResult<RequestId> {
        if let Some(idx) = inner.rx.ctx.unexpected.find_match(tag, ignore, match_id, tagged) {
            let ux_id = inner.rx.ctx.unexpected.peek(idx).id;
            let payload = crate::request::SearchPayload { complete: true, puts_pending: 0 };
            let req_id = inner.pool.alloc(context, Payload::Search(payload));
            if flags.contains(RecvFlags::CLAIM) {
                inner.rx.ctx.unexpected.mark_claimed(idx);
                inner.pool.get_mut(req_id).unwrap().context = ux_id;
            }
            return Ok(req_id);
        }

        if Self::hw_posting_enabled(inner) {
            let payload = crate::request::SearchPayload::default();
            let req_id = inner.pool.alloc(context, Payload::Search(payload));
            inner.nic.emit(Command::Search { req_id: req_id.0 })?;
            return Err(EngineError::Transient);
        }

        Err(EngineError::NotFound)
    }

    /// FI_CLAIM without a prior FI_PEEK binding: attempt an immediate
    /// match-and-claim against the software list.
    fn claim_locked(inner: &mut Inner<N>, req_id: RequestId) -> EngineResult<RequestId> {
        let claim_ctx = inner.pool.get(req_id).unwrap().recv().claim_context;
        if let Some(ux_id) = claim_ctx {
            if let Some(idx) = inner.rx.ctx.unexpected.find_by_id(ux_id) {
                let ux = inner.rx.ctx.unexpected.take(idx);
                match Self::drain_ux_into(inner, req_id, ux)? {
                    DrainOutcome::Done(done) => return Ok(done),
                    DrainOutcome::KeepMatching => return Ok(req_id),
                }
            }
        }
        inner.pool.free(req_id);
        Err(EngineError::NotFound)
    }

    /// `recv_cancel`: removes a software-queued receive outright; a
    /// hardware-posted one gets an `Unlink` command and only finishes
    /// canceling once that event comes back.
    pub fn recv_cancel(&self, req_id: RequestId) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.rx.sw_recv_queue.iter().position(|&id| id == req_id) {
            inner.rx.sw_recv_queue.remove(pos);
            let recv = inner.pool.get_mut(req_id).ok_or(EngineError::NotFound)?.recv_mut();
            recv.canceled = true;
            Self::complete_recv_error(&mut inner, req_id, EngineError::Canceled);
            return Ok(());
        }
        inner.nic.emit(Command::Unlink { req_id: req_id.0 })
    }

    /// `build_ux_entry_info`: a synchronous diagnostic dump of every
    /// onloaded unexpected message, for the public introspection API.
    pub fn build_ux_entry_info(&self, out: &mut Vec<UxEntryInfo>) -> usize {
        let inner = self.inner.lock();
        let mut count = 0;
        for ux in inner.rx.ctx.unexpected.iter() {
            let mb = MatchBits::decode(ux.put_event.match_bits);
            out.push(UxEntryInfo {
                claim_id: ux.id,
                initiator: ux.put_event.initiator,
                tag: mb.tag as u64,
                tagged: mb.tagged,
                len: ux.put_event.rlength,
            });
            count += 1;
        }
        count
    }

    // ---- Public send surface -----------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn send_common(
        &self,
        buf: Vec<u8>,
        dest: CaDdr,
        tag: u64,
        data: u64,
        context: u64,
        flags: SendFlags,
        tagged: bool,
        hmem_source: bool,
    ) -> EngineResult<RequestId> {
        let mut inner = self.inner.lock();

        if flags.contains(SendFlags::INJECT) && buf.len() > inner.config.inject_size {
            return Err(EngineError::MessageTooLarge);
        }

        let idc_enabled = !inner.config.disable_non_inject_msg_idc;
        let protocol = tx::select_protocol(buf.len(), flags, idc_enabled, &inner.config);

        let mut send = SendPayload::new(buf, dest, tag, tagged, flags);
        send.data = data;
        send.tx_id = inner.tx.next_tx_id;
        inner.tx.next_tx_id = inner.tx.next_tx_id.wrapping_add(1);

        if tx::needs_bounce_buffer(protocol, flags, hmem_source) {
            send.ibuf = Some(send.buf.clone());
        }

        let req_id = inner.pool.alloc(context, Payload::Send(send));

        if inner.tx.fc_peers.is_disabled(dest) {
            inner.tx.fc_peers.queue_existing(dest, req_id);
            return Ok(req_id);
        }

        Self::issue_send(&mut inner, req_id, protocol)?;
        Ok(req_id)
    }

    fn issue_send(inner: &mut Inner<N>, req_id: RequestId, protocol: TxProtocol) -> EngineResult<()> {
        inner.tx.msg_queue.push_back(req_id);
        let send = inner.pool.get(req_id).unwrap().send().clone();
        let mb = tx::build_send_match_bits(&send, protocol);

        match protocol {
            TxProtocol::Idc | TxProtocol::Eager => {
                inner.nic.emit(Command::Put {
                    req_id: req_id.0,
                    dest: send.caddr,
                    match_bits: mb.encode(),
                    len: send.len,
                    rendezvous: false,
                })
            }
            TxProtocol::Rendezvous => {
                let rdzv_id = inner.tx.next_rdzv_id;
                inner.tx.next_rdzv_id += 1;
                inner.pool.get_mut(req_id).unwrap().send_mut().rdzv_id = rdzv_id;
                let mut rdzv_mb = mb;
                rdzv_mb.set_rdzv_id(rdzv_id);
                let eager_len = send.len.min(inner.config.rdzv_eager_size);
                inner.nic.emit(Command::Put {
                    req_id: req_id.0,
                    dest: send.caddr,
                    match_bits: rdzv_mb.encode(),
                    len: eager_len,
                    rendezvous: true,
                })
            }
        }
    }

    /// Replays a send after its peer issued `FC_RESUME`, via the same
    /// path a fresh `send_common` call would take.
    fn replay_send(inner: &mut Inner<N>, req_id: RequestId) -> EngineResult<()> {
        let (len, flags) = {
            let send = inner.pool.get(req_id).unwrap().send();
            (send.len, send.flags)
        };
        let idc_enabled = !inner.config.disable_non_inject_msg_idc;
        let protocol = tx::select_protocol(len, flags, idc_enabled, &inner.config);
        Self::issue_send(inner, req_id, protocol)?;
        inner.tx.stats.replayed += 1;
        Ok(())
    }

    // ---- Event dispatch ------------------------------------------------

    /// Drains one NIC event, mutating whatever component(s) own the
    /// request or peer it names. Returns `Ok(())` once the event is fully
    /// consumed; a `Transient` error means the caller should leave the
    /// triggering command un-acked and retry on the next progress cycle.
    pub fn progress(&self, event: Event) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        match event {
            Event::Target(te) => Self::progress_target(&mut inner, te),
            Event::Init(ie) => Self::progress_init(&mut inner, ie),
            Event::Control(ce) => Self::progress_control(&mut inner, ce),
        }
    }

    fn progress_target(inner: &mut Inner<N>, ev: TargetEvent) -> EngineResult<()> {
        let mut req_id = RequestId(ev.user_ptr);

        if inner.rx.ctx.oflow.contains(req_id) {
            return Self::progress_oflow_event(inner, req_id, ev);
        }

        // Any event in a rendezvous transaction that names a multi-recv
        // parent directly (rather than a per-message child the router
        // already demultiplexed) needs its own child slot, keyed by
        // (initiator, rdzv_id), so concurrent rendezvous transactions
        // against the same buffer don't clobber each other's bookkeeping.
        let is_rdzv_series_event = matches!(ev.kind, EventKind::Rendezvous | EventKind::Reply | EventKind::Ack)
            || (ev.kind == EventKind::Put && ev.rendezvous);
        if is_rdzv_series_event {
            let is_mrecv_parent = inner
                .pool
                .get(req_id)
                .map(|r| r.recv().multi_recv && r.recv().parent.is_none())
                .unwrap_or(false);
            if is_mrecv_parent {
                let mb = MatchBits::decode(ev.match_bits);
                req_id = match rdzv::mrecv_req_event(
                    &mut inner.pool,
                    &mut inner.rx.ctx.rdzv_children,
                    req_id,
                    ev.initiator,
                    mb.rdzv_id(),
                    ev.start as usize,
                ) {
                    rdzv::MrecvLookup::Found(id) | rdzv::MrecvLookup::Created(id) => id,
                };
            }
        }

        Self::record_rx_stat(inner, &ev);

        let outcome = router::dispatch(&mut inner.pool, &mut inner.rx.ctx.deferred, req_id, &ev)?;
        Self::apply_router_outcome(inner, outcome)
    }

    fn record_rx_stat(inner: &mut Inner<N>, ev: &TargetEvent) {
        let list = match ev.kind {
            EventKind::PutOverflow => PtlList::Overflow,
            _ => PtlList::Priority,
        };
        inner.rx.stats.record(list, HmemIface::System);
        if ev.kind == EventKind::PutOverflow && inner.rx.ctx.flow_control.state == RxState::OnloadFlowControl {
            inner.rx.ctx.flow_control.on_ule_freed();
        }
    }

    fn apply_router_outcome(inner: &mut Inner<N>, outcome: router::RouterOutcome) -> EngineResult<()> {
        use router::RouterOutcome::*;
        match outcome {
            Linked => Ok(()),
            SoftwareManaged(reason) => {
                inner.rx.ctx.flow_control.on_disable_event(DisableTrigger::SoftwareManaged(reason), false);
                Ok(())
            }
            LinkFailedNoSpace => {
                inner.rx.ctx.flow_control.request_manual_disable(false)?;
                Ok(())
            }
            Unlinked => Ok(()),
            PutOverflowDeposited => Ok(()),
            PutOverflowMatched { target_req, event, mrecv_start, mrecv_len } => {
                let outcome = unexpected::deliver_ux_send(
                    &mut inner.pool,
                    target_req,
                    &event.payload,
                    &event,
                    mrecv_start,
                    mrecv_len,
                )?;
                Self::apply_ux_outcome(inner, outcome)
            }
            PutDelivered { child } => Self::complete_recv(inner, child).map(|_| ()),
            RendezvousPending { child } => Self::maybe_issue_rdzv_get(inner, child),
            RendezvousComplete { child } => Self::complete_recv(inner, child).map(|_| ()),
            SendIgnored => Ok(()),
        }
    }

    fn apply_ux_outcome(inner: &mut Inner<N>, outcome: UxOutcome) -> EngineResult<()> {
        match outcome {
            UxOutcome::Delivered { matched_req, .. } => Self::complete_recv(inner, matched_req).map(|_| ()),
            UxOutcome::MatchCompletePending { matched_req } => {
                let initiator = inner.pool.get(matched_req).unwrap().recv().initiator;
                Self::emit_match_complete_notify(inner, initiator, 0)?;
                Ok(())
            }
            UxOutcome::RendezvousDeferred { matched_req } => {
                rdzv::recv_req_event(&mut inner.pool, matched_req, EventKind::PutOverflow);
                Self::maybe_issue_rdzv_get(inner, matched_req)
            }
        }
    }

    /// A Rendezvous-bearing event landed: counts it, and if the receiver
    /// (rather than the NIC) must pull the body, issues the Get.
    fn maybe_issue_rdzv_get(inner: &mut Inner<N>, req_id: RequestId) -> EngineResult<()> {
        let already_issued = inner.pool.get(req_id).unwrap().recv().get_issued;
        if already_issued {
            return Ok(());
        }
        let has_rendezvous_event = {
            let recv = inner.pool.get(req_id).unwrap().recv();
            recv.rdzv_event_types.iter().any(|e| *e == Some(EventKind::Rendezvous))
        };
        if !has_rendezvous_event {
            return Ok(());
        }
        if inner.tx_credits_used >= inner.config.max_tx {
            return Err(EngineError::Transient);
        }
        let cmd = rdzv::issue_get(&mut inner.pool, &inner.config, req_id);
        inner.nic.emit(cmd)?;
        inner.tx_credits_used += 1;
        Ok(())
    }

    fn progress_oflow_event(inner: &mut Inner<N>, req_id: RequestId, ev: TargetEvent) -> EngineResult<()> {
        match ev.kind {
            EventKind::Link => {
                let outcome = match ev.return_code {
                    ReturnCode::Ok => oflow::on_link_ok(inner.config.hybrid_preemptive, inner.nic.le_stats()),
                    ReturnCode::NoSpace => oflow::on_link_failed(DisableReason::NoMatch),
                    other => return Err(EngineError::Fatal(format!("overflow Link return code {:?}", other))),
                };
                match outcome {
                    OflowOutcome::Linked => {
                        inner.rx.ctx.oflow.insert(req_id, inner.config.oflow_buf_size);
                        Ok(())
                    }
                    OflowOutcome::LinkFailed => inner.rx.ctx.flow_control.request_manual_disable(false),
                    OflowOutcome::PreemptRequested => {
                        inner.rx.ctx.oflow.insert(req_id, inner.config.oflow_buf_size);
                        inner.rx.ctx.flow_control.request_manual_disable(false)
                    }
                    _ => unreachable!("on_link_ok/on_link_failed only ever return Link outcomes"),
                }
            }
            EventKind::Unlink => {
                oflow::on_unlink(&mut inner.rx.ctx.oflow, req_id);
                Ok(())
            }
            EventKind::Put => {
                let outcome = oflow::on_put(&mut inner.rx.ctx.oflow, &mut inner.rx.ctx.deferred, req_id, ev.clone());
                Self::apply_oflow_put_outcome(inner, req_id, ev, outcome)
            }
            other => Err(EngineError::Fatal(format!("event kind {:?} not valid on an overflow buffer", other))),
        }
    }

    fn apply_oflow_put_outcome(
        inner: &mut Inner<N>,
        oflow_req: RequestId,
        ev: TargetEvent,
        outcome: OflowOutcome,
    ) -> EngineResult<()> {
        match outcome {
            OflowOutcome::DroppedZeroByte | OflowOutcome::Deposited => Ok(()),
            OflowOutcome::Matched { target_req, event, mrecv_start, mrecv_len } => {
                inner.rx.ctx.oflow.debit(oflow_req, ev.mlength);
                let ux_outcome = unexpected::deliver_ux_send(
                    &mut inner.pool,
                    target_req,
                    &event.payload,
                    &event,
                    mrecv_start,
                    mrecv_len,
                )?;
                Self::apply_ux_outcome(inner, ux_outcome)
            }
            OflowOutcome::Linked | OflowOutcome::LinkFailed | OflowOutcome::PreemptRequested | OflowOutcome::Unlinked => {
                // These are Link/Unlink outcomes; `on_put` never produces
                // them, but routing through one match keeps the compiler
                // honest about `OflowOutcome`'s full variant set.
                let _ = (oflow_req, ev);
                Ok(())
            }
        }
    }

    fn progress_init(inner: &mut Inner<N>, ev: InitEvent) -> EngineResult<()> {
        let req_id = RequestId(ev.user_ptr);
        let is_send = matches!(inner.pool.get(req_id).map(|r| &r.payload), Some(Payload::Send(_)));
        if is_send {
            Self::progress_tx_init(inner, req_id, ev)
        } else {
            Self::progress_rx_init(inner, req_id, ev)
        }
    }

    fn progress_rx_init(inner: &mut Inner<N>, req_id: RequestId, ev: InitEvent) -> EngineResult<()> {
        match ev.kind {
            EventKind::Reply | EventKind::Ack => {
                if ev.kind == EventKind::Reply {
                    inner.tx_credits_used = inner.tx_credits_used.saturating_sub(1);
                }
                match rdzv::recv_req_event(&mut inner.pool, req_id, ev.kind) {
                    rdzv::RdzvEventOutcome::Pending => Ok(()),
                    rdzv::RdzvEventOutcome::Complete => Self::complete_recv(inner, req_id).map(|_| ()),
                }
            }
            other => Err(EngineError::Fatal(format!("event kind {:?} not valid on a receive's initiator side", other))),
        }
    }

    fn progress_tx_init(inner: &mut Inner<N>, req_id: RequestId, ev: InitEvent) -> EngineResult<()> {
        let send_snapshot = inner.pool.get(req_id).unwrap().send().clone();
        let idc_enabled = !inner.config.disable_non_inject_msg_idc;
        let protocol =
            tx::select_protocol(send_snapshot.len, send_snapshot.flags, idc_enabled, &inner.config);

        let outcome = if protocol == TxProtocol::Rendezvous {
            let mut send = send_snapshot;
            let out = tx::send_rdzv_put_cb(&mut send, ev.kind, ev.return_code);
            inner.pool.get_mut(req_id).unwrap().send_mut().rdzv_send_events = send.rdzv_send_events;
            out
        } else {
            let landed_on_overflow =
                ev.return_code == ReturnCode::Ok && send_snapshot.flags.contains(SendFlags::MATCH_COMPLETE);
            tx::send_eager_cb(&send_snapshot, ev.return_code, landed_on_overflow)
        };

        match outcome {
            TxOutcome::Complete => Self::complete_send(inner, req_id),
            TxOutcome::Pending => Ok(()),
            TxOutcome::SuspendForMatchComplete => Ok(()),
            TxOutcome::StashedForReplay => {
                inner.tx.stats.dropped += 1;
                let dest = inner.pool.get(req_id).unwrap().send().caddr;
                Self::record_tx_disabled(inner, req_id, dest);
                if inner.tx.fc_peers.ready_to_notify(dest) {
                    Self::emit_fc_notify(inner, dest)?;
                }
                Ok(())
            }
        }
    }

    /// Folds one newly-observed `PtlteDisabled` Ack into `fc_peers`,
    /// draining any other sends to the same destination that are still
    /// outstanding in `tx.msg_queue` the first time this peer is seen
    /// (§4.10's "drains the TX message queue" step) so their own
    /// eventual Acks are recognized as already-accounted-for instead of
    /// re-triggering peer creation.
    fn record_tx_disabled(inner: &mut Inner<N>, req_id: RequestId, dest: CaDdr) {
        if inner.tx.fc_peers.ack_pending(dest, req_id) {
            if let Some(pos) = inner.tx.msg_queue.iter().position(|&id| id == req_id) {
                inner.tx.msg_queue.remove(pos);
            }
            return;
        }
        if !inner.tx.fc_peers.has_peer(dest) {
            let others: Vec<RequestId> = inner
                .tx
                .msg_queue
                .iter()
                .copied()
                .filter(|&id| {
                    id != req_id
                        && matches!(inner.pool.get(id).map(|r| &r.payload), Some(Payload::Send(s)) if s.caddr == dest)
                })
                .collect();
            inner.tx.fc_peers.register_peer_drop(dest, req_id, &others);
            for id in std::iter::once(req_id).chain(others.into_iter()) {
                if let Some(pos) = inner.tx.msg_queue.iter().position(|&x| x == id) {
                    inner.tx.msg_queue.remove(pos);
                }
            }
        } else {
            inner.tx.fc_peers.force_drop(dest, req_id);
            if let Some(pos) = inner.tx.msg_queue.iter().position(|&id| id == req_id) {
                inner.tx.msg_queue.remove(pos);
            }
        }
    }

    fn emit_fc_notify(inner: &mut Inner<N>, dest: CaDdr) -> EngineResult<()> {
        if !inner.tx.fc_peers.ready_to_notify(dest) {
            return Ok(());
        }
        let drops = inner.tx.fc_peers.dropped_count(dest);
        inner.nic.emit(Command::CtrlMessage { req_id: u32::MAX, dest, is_resume: false, drops })?;
        inner.tx.fc_peers.mark_notified(dest);
        Ok(())
    }

    fn progress_control(inner: &mut Inner<N>, ev: CtrlEvent) -> EngineResult<()> {
        match ev.kind {
            EventKind::FcNotify => {
                inner.rx.ctx.flow_control.nic_drop_count = inner.nic.nic_drop_count();
                Ok(())
            }
            EventKind::FcResume => {
                let replay = inner.tx.fc_peers.on_resume(ev.peer);
                for req_id in replay {
                    Self::replay_send(inner, req_id)?;
                }
                if inner.tx.fc_peers.can_release(ev.peer) {
                    inner.tx.fc_peers.release(ev.peer);
                }
                Ok(())
            }
            other => Err(EngineError::Fatal(format!("event kind {:?} not valid as a control event", other))),
        }
    }

    // ---- Flow-control onload orchestration ----------------------------

    /// Forces a software-mode transition (the hybrid preemption watchdogs
    /// call this rather than mutating `FlowControl` directly, since
    /// forcing a disable is itself a NIC command).
    pub fn force_disable(&self) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        inner.rx.ctx.flow_control.request_manual_disable(true)?;
        inner.nic.emit(Command::Unlink { req_id: u32::MAX })
    }

    /// Runs the onload sequence (§4.7 steps 1-2): flushes in-flight
    /// Appends with a non-matching Search, then Search-And-Deletes the
    /// NIC's unexpected list into `sw_ux_list`, snapshotting remote
    /// offsets until two consecutive reads agree.
    pub fn onload_unexpected(&self) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        inner.nic.emit(Command::Search { req_id: u32::MAX })?;

        let mut prev = inner.nic.snapshot_ule_offsets();
        for _ in 0..2 {
            let next = inner.nic.snapshot_ule_offsets();
            if next == prev {
                break;
            }
            prev = next;
        }

        inner.nic.emit(Command::SearchAndDelete { req_id: u32::MAX })
    }

    /// The terminating Search event of the onload sequence (§4.7 step 3).
    pub fn on_search_terminated(&self) {
        self.inner.lock().rx.ctx.flow_control.on_search_terminated();
    }

    /// An onloaded unexpected header arrives via Search-And-Delete: files
    /// it on `sw_ux_list`, correlating with any deferred overflow Put the
    /// same transaction already deposited.
    pub fn onload_ux_entry(&self, put_event: TargetEvent, oflow_req: RequestId) {
        let mut inner = self.inner.lock();
        let mrecv_start = put_event.start as usize;
        let mrecv_len = put_event.mlength;
        let ux = UxSend { id: 0, put_event, oflow_req, mrecv_start, mrecv_len, claimed: false };
        inner.rx.ctx.unexpected.push(ux);
        inner.rx.ctx.flow_control.on_ule_freed();
    }

    /// §4.7 step 4: `ux_onload_complete` — splices any pending onload
    /// entries in, then either replays software-queued appends or
    /// attempts the hardware re-enable handshake.
    pub fn ux_onload_complete(&self) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        inner.rx.ctx.flow_control.on_ux_onload_complete();

        match inner.rx.ctx.flow_control.state {
            RxState::EnabledSoftware => {
                let replay: Vec<RequestId> = inner.rx.replay_queue.drain(..).collect();
                for req_id in replay {
                    inner.rx.sw_recv_queue.push_back(req_id);
                }
                Ok(())
            }
            RxState::FlowControl => Self::try_reenable(&mut inner),
            other => fatal(&format!("ux_onload_complete finished in unexpected state {:?}", other)),
        }
    }

    fn try_reenable(inner: &mut Inner<N>) -> EngineResult<()> {
        inner.rx.ctx.flow_control.nic_drop_count = inner.nic.nic_drop_count();
        match inner.rx.ctx.flow_control.try_reenable() {
            Ok(()) => {
                let replay: Vec<RequestId> = inner.rx.replay_queue.drain(..).collect();
                for req_id in replay {
                    Self::post_recv_locked(inner, req_id)?;
                }
                let peers: Vec<CaDdr> = inner.rx.ctx.flow_control.fc_drops.drain(..).collect();
                for peer in peers {
                    Self::retry_fc_resume(inner, peer)?;
                }
                Ok(())
            }
            Err(EngineError::Transient) => {
                debug!(target: "fc", "re-enable deferred: drop counts not yet reconciled");
                Err(EngineError::Transient)
            }
            Err(e) => Err(e),
        }
    }

    fn retry_fc_resume(inner: &mut Inner<N>, peer: CaDdr) -> EngineResult<()> {
        match inner.nic.emit(Command::CtrlMessage { req_id: u32::MAX, dest: peer, is_resume: true, drops: 0 }) {
            Ok(()) => Ok(()),
            Err(EngineError::Transient) => {
                warn!(target: "fc", "FC_RESUME hit ENTRY_NOT_FOUND, retrying after {}us", inner.config.fc_retry_usec_delay);
                unsafe { libc::usleep(inner.config.fc_retry_usec_delay as u32) };
                inner.rx.ctx.flow_control.fc_drops.push(peer);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ---- Completion plumbing -------------------------------------------

    /// Reports one receive's completion to the CQ. Returns whether this
    /// call was the one that released a multi-recv parent (always
    /// `false` for a non-multi-recv request) — callers use it to decide
    /// whether to keep matching further unexpected sends against the
    /// same buffer.
    fn complete_recv(inner: &mut Inner<N>, req_id: RequestId) -> EngineResult<bool> {
        let recv = inner.pool.get(req_id).ok_or(EngineError::NotFound)?.recv().clone();

        if recv.rlen > recv.ulen && !recv.multi_recv {
            let context = inner.pool.get(req_id).unwrap().context;
            inner.cq_err.push(CqError { req_id, context, err: EngineError::Truncation { rlen: recv.rlen } });
            inner.pool.free(req_id);
            return Ok(false);
        }

        // Multi-recv space is debited, and the parent's release condition
        // (§4 Invariant 2) checked, against the real parent record —
        // never against this completing child's own cloned fields.
        let mrecv_released = if recv.multi_recv {
            let parent_id = recv.parent.unwrap_or(req_id);
            mrecv::child_completed(&mut inner.pool, parent_id, recv.data_len, inner.rx.ctx.min_multi_recv)
        } else {
            false
        };

        let mut flags = CqFlags::MSG | CqFlags::RECV;
        if recv.tagged {
            flags |= CqFlags::TAGGED;
        }
        if mrecv_released {
            flags |= CqFlags::MULTI_RECV;
        }

        let parent_for_offset = recv.parent;
        let child_offset = recv.child_offset;
        let context = inner.pool.get(req_id).unwrap().context;

        inner.cq.push(Completion {
            req_id,
            context,
            flags,
            len: recv.data_len,
            buf_offset: child_offset,
            tag: recv.tag,
            data: 0,
        });

        // A multi-recv child never owns the buffer; only the last entry
        // against the parent frees anything, and only once the parent
        // itself is retired (`mrecv_released`).
        if parent_for_offset.is_some() {
            inner.pool.free(req_id);
        } else if !recv.multi_recv || mrecv_released {
            inner.pool.free(req_id);
        }
        Ok(mrecv_released)
    }

    fn complete_recv_error(inner: &mut Inner<N>, req_id: RequestId, err: EngineError) {
        if let Some(req) = inner.pool.get(req_id) {
            let context = req.context;
            inner.cq_err.push(CqError { req_id, context, err });
        }
        inner.pool.free(req_id);
    }

    fn complete_send(inner: &mut Inner<N>, req_id: RequestId) -> EngineResult<()> {
        let send = inner.pool.get(req_id).ok_or(EngineError::NotFound)?.send().clone();
        let idc_enabled = !inner.config.disable_non_inject_msg_idc;
        let protocol = tx::select_protocol(send.len, send.flags, idc_enabled, &inner.config);
        if protocol == TxProtocol::Rendezvous {
            inner.tx.stats.rendezvous_sent += 1;
        } else {
            inner.tx.stats.eager_sent += 1;
        }

        if let Some(pos) = inner.tx.msg_queue.iter().position(|&id| id == req_id) {
            inner.tx.msg_queue.remove(pos);
        }

        let mut flags = CqFlags::MSG | CqFlags::SEND;
        if send.tagged {
            flags |= CqFlags::TAGGED;
        }
        let context = inner.pool.get(req_id).unwrap().context;
        inner.cq.push(Completion { req_id, context, flags, len: send.len, buf_offset: 0, tag: send.tag, data: send.data });
        inner.pool.free(req_id);
        Ok(())
    }
}

enum DrainOutcome {
    Done(RequestId),
    KeepMatching,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::mock_nic::MockNic;

    fn endpoint() -> Endpoint<MockNic> {
        let ep = Endpoint::new(EngineConfig::default(), MockNic::new());
        ep.enable();
        ep
    }

    fn target_event(kind: EventKind, user_ptr: u32, payload: Vec<u8>) -> Event {
        let len = payload.len();
        Event::Target(TargetEvent {
            kind,
            return_code: ReturnCode::Ok,
            user_ptr,
            initiator: 1,
            match_bits: {
                let mut mb = MatchBits::default();
                mb.tagged = true;
                mb.tag = 0x1234;
                mb.encode()
            },
            start: 0,
            mlength: len,
            rlength: len,
            rendezvous: false,
            auto_unlinked: false,
            manage_local: false,
            payload,
        })
    }

    #[test]
    fn s1_expected_eager_tagged_send_completes_with_full_buffer() {
        let ep = endpoint();
        let req_id =
            ep.recv_common(vec![0u8; 128], u32::MAX, 0x1234, 0, 42, RecvFlags::COMPLETION, true).unwrap();

        let payload = vec![0xABu8; 128];
        ep.progress(target_event(EventKind::Put, req_id.0, payload)).unwrap();

        let completion = ep.poll_cq().expect("receive should have completed");
        assert_eq!(completion.len, 128);
        assert_eq!(completion.tag, 0x1234);
        assert!(completion.flags.contains(CqFlags::TAGGED | CqFlags::RECV));

        let recv_buf = {
            let inner = ep.inner.lock();
            assert!(inner.pool.get(req_id).is_none(), "single receive releases on completion");
            vec![]
        };
        let _ = recv_buf;
    }

    #[test]
    fn unexpected_send_drains_into_late_posted_receive() {
        let ep = endpoint();
        {
            let mut inner = ep.inner.lock();
            let oflow_req = RequestId(900);
            let mut mb = MatchBits::default();
            mb.tagged = true;
            mb.tag = 7;
            let put_event = TargetEvent {
                kind: EventKind::Put,
                return_code: ReturnCode::Ok,
                user_ptr: oflow_req.0,
                initiator: 2,
                match_bits: mb.encode(),
                start: 0,
                mlength: 4,
                rlength: 4,
                rendezvous: false,
                auto_unlinked: false,
                manage_local: true,
                payload: vec![9, 9, 9, 9],
            };
            inner.rx.ctx.unexpected.push(UxSend {
                id: 0,
                put_event,
                oflow_req,
                mrecv_start: 0,
                mrecv_len: 4,
                claimed: false,
            });
        }

        let req_id = ep.recv_common(vec![0u8; 4], u32::MAX, 7, 0, 0, RecvFlags::empty(), true).unwrap();
        let completion = ep.poll_cq().expect("should drain the onloaded unexpected send immediately");
        assert_eq!(completion.req_id, req_id);
        assert_eq!(completion.len, 4);
    }

    #[test]
    fn recv_cancel_on_software_queued_receive_reports_canceled() {
        let mut config = EngineConfig::default();
        config.rx_match_mode = crate::config::RxMatchMode::Software;
        let ep = Endpoint::new(config, MockNic::new());
        ep.enable();

        let req_id = ep.recv_common(vec![0u8; 8], u32::MAX, 0, 0, 0, RecvFlags::empty(), false).unwrap();
        ep.recv_cancel(req_id).unwrap();

        let err = ep.poll_cq_err().expect("canceled receive reports a CQ error");
        assert_eq!(err.err, EngineError::Canceled);
    }

    #[test]
    fn s4_fc_notify_then_resume_replays_sends_in_order() {
        let ep = endpoint();
        let dest = CaDdr { nic: 9, pid: 0, vni: 0 };

        let a = ep.send_common(vec![1], dest, 0, 0, 1, SendFlags::empty(), false, false).unwrap();
        let b = ep.send_common(vec![2], dest, 0, 0, 2, SendFlags::empty(), false, false).unwrap();

        let disabled_ack = |req: RequestId| Event::Init(InitEvent {
            kind: EventKind::Ack,
            return_code: ReturnCode::PtlteDisabled(DisableReason::EqFull),
            user_ptr: req.0,
            match_bits: 0,
            rendezvous: false,
        });
        ep.progress(disabled_ack(a)).unwrap();
        ep.progress(disabled_ack(b)).unwrap();

        ep.progress(Event::Control(CtrlEvent {
            kind: EventKind::FcResume,
            return_code: ReturnCode::Ok,
            user_ptr: 0,
            peer: dest,
            drops: 2,
        }))
        .unwrap();

        let nic_commands = { ep.inner.lock().nic.commands() };
        let puts: Vec<u32> = nic_commands
            .iter()
            .filter_map(|c| if let Command::Put { req_id, .. } = c { Some(*req_id) } else { None })
            .collect();
        assert_eq!(puts, vec![a.0, b.0, a.0, b.0], "replay reissues sends in original FIFO order");
    }
}
