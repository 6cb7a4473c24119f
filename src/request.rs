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

//! Requests: the polymorphic record tracking an in-flight send or
//! receive, and the per-EVTQ allocator that hands out stable ids.
//!
//! Redesign note: the original's intrusive, pointer-linked
//! request struct becomes an owned arena entry addressed by a small
//! `RequestId`, with parent/child and deferred-event/overflow-buffer
//! relationships expressed as ids rather than raw pointers.

use crate::config::RdzvProto;
use crate::nic::{CaDdr, EventKind, ReturnCode};
use bitflags::bitflags;
use std::collections::HashMap;

bitflags! {
    #[derive(Default)]
    pub struct RecvFlags: u32 {
        const COMPLETION  = 0b0000_0001;
        const MULTI_RECV  = 0b0000_0010;
        const PEEK        = 0b0000_0100;
        const CLAIM       = 0b0000_1000;
        const DIRECTED_RECV = 0b0001_0000;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct SendFlags: u32 {
        const COMPLETION     = 0b0000_0001;
        const INJECT         = 0b0000_0010;
        const TAGGED         = 0b0000_0100;
        const REMOTE_CQ_DATA = 0b0000_1000;
        const FENCE          = 0b0001_0000;
        const MATCH_COMPLETE = 0b0010_0000;
        const MORE           = 0b0100_0000;
    }
}

/// Stable id carried as a NIC command's `user_ptr` and handed back on
/// every event that touches this request. Index into a `RequestPool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u32);

/// Fields specific to a receive.
#[derive(Debug, Clone)]
pub struct RecvPayload {
    pub ulen: usize,
    pub data_len: usize,
    pub start_offset: usize,
    pub mrecv_bytes: usize,
    pub mrecv_unlink_bytes: usize,
    pub auto_unlinked: bool,

    /// `None` for a root request; the buffer then lives in `buf`. `Some`
    /// for a multi-recv/rendezvous child, which instead indexes into the
    /// parent's buffer at `child_offset`.
    pub parent: Option<RequestId>,
    pub children: Vec<RequestId>,
    /// Owned receive buffer. Only the root of a multi-recv family (or an
    /// ordinary single receive) carries one; see `parent`.
    pub buf: Option<Vec<u8>>,
    pub child_offset: usize,

    pub initiator: u32,
    pub vni: u16,
    pub rlen: usize,
    pub rc: ReturnCode,

    pub rdzv_id: u64,
    pub rdzv_events: u8,
    pub rdzv_event_types: [Option<EventKind>; 4],
    pub rdzv_initiator: u32,
    pub rdzv_lac: u8,
    pub rdzv_proto: RdzvProto,
    pub rdzv_mlen: usize,
    pub rget_nic: u32,
    pub rget_pid: u32,
    pub src_offset: u64,
    /// Whether a software (or restricted) Get has already been issued
    /// for this rendezvous transaction.
    pub get_issued: bool,

    pub tag: u64,
    pub ignore: u64,
    pub match_id: u32,
    pub tagged: bool,
    pub multi_recv: bool,
    pub flags: RecvFlags,

    pub software_list: bool,
    pub unlinked: bool,
    pub canceled: bool,
    pub done_notify: bool,
    pub hw_offloaded: bool,
    pub tgt_event: Option<EventKind>,
    pub ule_offsets: Vec<u64>,
    pub ux_dump: bool,

    /// Opaque claim context set by an FI_CLAIM probe; a
    /// later FI_CLAIM receive with matching context consumes exactly
    /// this entry.
    pub claim_context: Option<u64>,
}

impl RecvPayload {
    pub fn new(buf: Vec<u8>, tag: u64, ignore: u64, match_id: u32, flags: RecvFlags, tagged: bool) -> Self {
        let ulen = buf.len();
        RecvPayload {
            ulen,
            data_len: 0,
            start_offset: 0,
            mrecv_bytes: 0,
            mrecv_unlink_bytes: 0,
            auto_unlinked: false,
            parent: None,
            children: Vec::new(),
            buf: Some(buf),
            child_offset: 0,
            initiator: 0,
            vni: 0,
            rlen: 0,
            rc: ReturnCode::Ok,
            rdzv_id: 0,
            rdzv_events: 0,
            rdzv_event_types: [None; 4],
            rdzv_initiator: 0,
            rdzv_lac: 0,
            rdzv_proto: RdzvProto::Default,
            rdzv_mlen: 0,
            rget_nic: 0,
            rget_pid: 0,
            src_offset: 0,
            get_issued: false,
            tag,
            ignore,
            match_id,
            tagged,
            multi_recv: flags.contains(RecvFlags::MULTI_RECV),
            flags,
            software_list: false,
            unlinked: false,
            canceled: false,
            done_notify: false,
            hw_offloaded: false,
            tgt_event: None,
            ule_offsets: Vec::new(),
            ux_dump: false,
            claim_context: None,
        }
    }

    /// Total event count this rendezvous transaction must observe before
    /// it is complete.
    pub fn rdzv_total_events(&self) -> u8 {
        if self.done_notify {
            4
        } else {
            3
        }
    }
}

/// Fields specific to a send.
#[derive(Debug, Clone)]
pub struct SendPayload {
    pub buf: Vec<u8>,
    pub len: usize,
    pub data: u64,
    pub caddr: CaDdr,
    pub dest_addr: u64,
    pub tag: u64,
    pub tagged: bool,
    pub flags: SendFlags,
    pub tclass: u8,
    pub tx_id: u16,
    pub rdzv_id: u64,
    pub rdzv_send_events: u8,
    /// Bounce buffer contents; mutually exclusive with registering the
    /// user buffer directly.
    pub ibuf: Option<Vec<u8>>,
    pub cntr: bool,
    /// Non-owning reference to the disabled-peer record this send is
    /// queued against while its destination is flow-controlled.
    pub fc_peer: Option<CaDdr>,
    pub rc: ReturnCode,
    /// Set once the receiver's match-bits carried `match_comp`, meaning
    /// completion waits for the notify Put's Ack instead of the Send's.
    pub match_complete_pending: bool,
}

impl SendPayload {
    pub fn new(buf: Vec<u8>, caddr: CaDdr, tag: u64, tagged: bool, flags: SendFlags) -> Self {
        let len = buf.len();
        SendPayload {
            buf,
            len,
            data: 0,
            caddr,
            dest_addr: 0,
            tag,
            tagged,
            flags,
            tclass: 0,
            tx_id: 0,
            rdzv_id: 0,
            rdzv_send_events: 0,
            ibuf: None,
            cntr: false,
            fc_peer: None,
            rc: ReturnCode::Ok,
            match_complete_pending: false,
        }
    }

    /// Total events a rendezvous send must observe (Ack + Get) before
    /// completion.
    pub fn rdzv_total_events(&self) -> u8 {
        2
    }
}

/// Tracks an in-flight hardware search (FI_PEEK / onload), keeping just
/// enough state to know when the matching Search event has landed.
#[derive(Debug, Clone, Default)]
pub struct SearchPayload {
    pub complete: bool,
    pub puts_pending: u32,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Recv(RecvPayload),
    Send(SendPayload),
    Search(SearchPayload),
}

#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub context: u64,
    pub payload: Payload,
}

impl Request {
    pub fn recv(&self) -> &RecvPayload {
        match &self.payload {
            Payload::Recv(r) => r,
            _ => panic!("rxtx-engine: request {:?} is not a receive", self.id),
        }
    }

    pub fn recv_mut(&mut self) -> &mut RecvPayload {
        match &mut self.payload {
            Payload::Recv(r) => r,
            _ => panic!("rxtx-engine: request {:?} is not a receive", self.id),
        }
    }

    pub fn send(&self) -> &SendPayload {
        match &self.payload {
            Payload::Send(s) => s,
            _ => panic!("rxtx-engine: request {:?} is not a send", self.id),
        }
    }

    pub fn send_mut(&mut self) -> &mut SendPayload {
        match &mut self.payload {
            Payload::Send(s) => s,
            _ => panic!("rxtx-engine: request {:?} is not a send", self.id),
        }
    }
}

/// A per-EVTQ allocator of requests, addressed by stable `RequestId`.
///
/// Freed slots are recycled via a free list, an array-backed allocator
/// style (close to `db::master`'s fixed tenant buckets) rather than a C
/// `malloc`/`free` per request.
#[derive(Debug, Default)]
pub struct RequestPool {
    slots: Vec<Option<Request>>,
    free: Vec<u32>,
}

impl RequestPool {
    pub fn new() -> Self {
        RequestPool { slots: Vec::new(), free: Vec::new() }
    }

    pub fn alloc(&mut self, context: u64, payload: Payload) -> RequestId {
        let id = if let Some(idx) = self.free.pop() {
            idx
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(None);
            idx
        };
        let req_id = RequestId(id);
        self.slots[id as usize] = Some(Request { id: req_id, context, payload });
        req_id
    }

    pub fn get(&self, id: RequestId) -> Option<&Request> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    pub fn free(&mut self, id: RequestId) -> Option<Request> {
        let slot = self.slots.get_mut(id.0 as usize)?;
        let req = slot.take();
        if req.is_some() {
            self.free.push(id.0);
        }
        req
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `mrecv_req_dup()`: duplicates a multi-recv
/// parent into an in-memory-only child with no NIC-visible buffer id of
/// its own, linked back to the parent by id. The parent keeps exclusive
/// ownership of the user buffer; the child only ever reads/writes the
/// slice at `[child_offset, child_offset + mlen)`.
pub fn mrecv_req_dup(pool: &mut RequestPool, parent_id: RequestId, child_offset: usize) -> RequestId {
    let parent = pool.get(parent_id).expect("parent must exist");
    let parent_recv = parent.recv();
    let mut child = parent_recv.clone();
    child.parent = Some(parent_id);
    child.buf = None;
    child.child_offset = child_offset;
    child.children = Vec::new();
    child.rdzv_events = 0;
    child.rdzv_event_types = [None; 4];

    let child_id = pool.alloc(0, Payload::Recv(child));

    let parent_mut = pool.get_mut(parent_id).unwrap().recv_mut();
    parent_mut.children.push(child_id);

    child_id
}

/// Map from `(initiator, rdzv_id)` to the rendezvous child request that
/// owns that transaction, used by `rdzv_mrecv_req_lookup`
/// to avoid a linear scan of every parent's children on each event.
pub type RdzvChildIndex = HashMap<(u32, u64), RequestId>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::CaDdr;

    #[test]
    fn pool_recycles_freed_ids() {
        let mut pool = RequestPool::new();
        let a = pool.alloc(0, Payload::Search(SearchPayload::default()));
        pool.free(a);
        let b = pool.alloc(0, Payload::Search(SearchPayload::default()));
        assert_eq!(a, b);
    }

    #[test]
    fn mrecv_dup_links_parent_and_child() {
        let mut pool = RequestPool::new();
        let parent_payload = RecvPayload::new(vec![0u8; 512], 0, 0, 0, RecvFlags::MULTI_RECV, false);
        let parent = pool.alloc(0, Payload::Recv(parent_payload));

        let child = mrecv_req_dup(&mut pool, parent, 100);

        assert_eq!(pool.get(child).unwrap().recv().parent, Some(parent));
        assert_eq!(pool.get(parent).unwrap().recv().children, vec![child]);
        assert!(pool.get(child).unwrap().recv().buf.is_none());
    }

    #[test]
    fn send_payload_defaults_round_trip() {
        let caddr = CaDdr { nic: 1, pid: 2, vni: 0 };
        let send = SendPayload::new(vec![1, 2, 3], caddr, 9, true, SendFlags::TAGGED);
        assert_eq!(send.len, 3);
        assert_eq!(send.rdzv_total_events(), 2);
    }
}
