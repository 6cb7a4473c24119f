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

//! The deferred-event table.
//!
//! A Put and its paired Put-Overflow event (or, for the zero-eager
//! degenerate case, a lone Put-Overflow) may be delivered in either
//! order. This hash-bucketed table lets whichever arrives first deposit
//! itself, so the second arrival can find its partner and drive the
//! handler: the first event of a pair deposits, the second triggers
//! the handler.

use crate::nic::{EventKind, ReturnCode, TargetEvent};
use crate::request::RequestId;

/// The correlation key: a rendezvous transaction is keyed by
/// `(initiator, rdzv_id)`; an eager message is keyed by the overflow
/// buffer's start address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeferredKey {
    Rendezvous { initiator: u32, rdzv_id: u64 },
    Overflow { start_addr: u64 },
}

impl DeferredKey {
    fn raw(&self) -> u64 {
        match *self {
            DeferredKey::Rendezvous { initiator, rdzv_id } => {
                // High tag bit set so a rendezvous key can never collide
                // with a plain start-address key.
                (1u64 << 63) ^ (initiator as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ rdzv_id
            }
            DeferredKey::Overflow { start_addr } => start_addr & !(1u64 << 63),
        }
    }
}

/// A small, fast, non-cryptographic mix good enough for bucket
/// selection: FNV-1a over the 8 key bytes.
fn fasthash64(raw: u64) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for byte in raw.to_le_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// A deferred event, generic over an extra payload `T` some callers
/// attach once a match completes — used by the flow-control onload path
/// (see `crate::rx::flowcontrol`) to stash a pending unexpected-send
/// record. Ordinary eager/rendezvous matching doesn't need it and uses
/// `DeferredTable<()>`.
#[derive(Debug, Clone)]
pub struct DeferredEvent<T> {
    pub key: DeferredKey,
    pub req: RequestId,
    pub event: TargetEvent,
    pub mrecv_start: usize,
    pub mrecv_len: usize,
    pub extra: Option<T>,
}

pub struct DeferredTable<T> {
    buckets: Vec<Vec<DeferredEvent<T>>>,
}

impl<T> DeferredTable<T> {
    pub fn new(bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        DeferredTable { buckets: (0..bucket_count).map(|_| Vec::new()).collect() }
    }

    fn bucket_index(&self, key: &DeferredKey) -> usize {
        (fasthash64(key.raw()) as usize) % self.buckets.len()
    }

    fn key_for(event: &TargetEvent) -> DeferredKey {
        if event.rendezvous {
            let mb = crate::matchbits::MatchBits::decode(event.match_bits);
            DeferredKey::Rendezvous { initiator: event.initiator, rdzv_id: mb.rdzv_id() }
        } else {
            DeferredKey::Overflow { start_addr: event.start }
        }
    }

    fn partner_event_type(event_type: EventKind) -> EventKind {
        match event_type {
            EventKind::Put => EventKind::PutOverflow,
            EventKind::PutOverflow => EventKind::Put,
            other => other,
        }
    }

    /// `match_or_insert()`: looks for an already-deposited partner event
    /// with the identical key, opposite event type, return code,
    /// initiator, and match-bits. If found, removes and returns it
    /// (`matched = true`). Otherwise deposits `event` for a later caller
    /// to find (`matched = false`).
    pub fn match_or_insert(
        &mut self,
        req: RequestId,
        event: TargetEvent,
        mrecv_start: usize,
        mrecv_len: usize,
    ) -> (Option<DeferredEvent<T>>, bool) {
        let key = Self::key_for(&event);
        let want_type = Self::partner_event_type(event.kind);
        let idx = self.bucket_index(&key);
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.iter().position(|def_ev| {
            def_ev.key == key
                && def_ev.event.kind == want_type
                && def_ev.event.return_code == event.return_code
                && def_ev.event.initiator == event.initiator
                && def_ev.event.match_bits == event.match_bits
        }) {
            let found = bucket.remove(pos);
            return (Some(found), true);
        }

        bucket.push(DeferredEvent { key, req, event, mrecv_start, mrecv_len, extra: None });
        (None, false)
    }

    /// Attaches an extra payload to the most recently deposited entry for
    /// `key`, used by the onload path to stash a `UxSend` record until
    /// its paired Put arrives.
    pub fn attach_extra(&mut self, key: DeferredKey, extra: T) -> bool {
        let idx = self.bucket_index(&key);
        if let Some(def_ev) = self.buckets[idx].iter_mut().find(|e| e.key == key && e.extra.is_none()) {
            def_ev.extra = Some(extra);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::ReturnCode;

    fn put_event(kind: EventKind, start: u64) -> TargetEvent {
        TargetEvent {
            kind,
            return_code: ReturnCode::Ok,
            user_ptr: 0,
            initiator: 7,
            match_bits: 0xAB,
            start,
            mlength: 16,
            rlength: 16,
            rendezvous: false,
            auto_unlinked: false,
            manage_local: kind == EventKind::PutOverflow,
            payload: Vec::new(),
        }
    }

    #[test]
    fn put_then_overflow_matches_commutatively() {
        let mut table: DeferredTable<()> = DeferredTable::new(8);
        let (found, matched) = table.match_or_insert(RequestId(1), put_event(EventKind::Put, 100), 0, 16);
        assert!(found.is_none());
        assert!(!matched);
        assert_eq!(table.len(), 1);

        let (found, matched) =
            table.match_or_insert(RequestId(2), put_event(EventKind::PutOverflow, 100), 0, 16);
        assert!(matched);
        assert_eq!(found.unwrap().req, RequestId(1));
        assert!(table.is_empty());
    }

    #[test]
    fn overflow_then_put_matches_in_reverse_order() {
        let mut table: DeferredTable<()> = DeferredTable::new(8);
        let (_, matched) =
            table.match_or_insert(RequestId(1), put_event(EventKind::PutOverflow, 200), 0, 16);
        assert!(!matched);

        let (found, matched) = table.match_or_insert(RequestId(2), put_event(EventKind::Put, 200), 0, 16);
        assert!(matched);
        assert_eq!(found.unwrap().req, RequestId(1));
    }

    #[test]
    fn distinct_keys_do_not_cross_match() {
        let mut table: DeferredTable<()> = DeferredTable::new(8);
        table.match_or_insert(RequestId(1), put_event(EventKind::Put, 100), 0, 16);
        let (found, matched) =
            table.match_or_insert(RequestId(2), put_event(EventKind::PutOverflow, 999), 0, 16);
        assert!(!matched);
        assert!(found.is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn rendezvous_events_key_on_initiator_and_rdzv_id() {
        let mut table: DeferredTable<()> = DeferredTable::new(8);
        let mut mb = crate::matchbits::MatchBits::default();
        mb.set_rdzv_id(55);
        let mut ev = put_event(EventKind::Put, 0);
        ev.rendezvous = true;
        ev.match_bits = mb.encode();

        let (_, matched) = table.match_or_insert(RequestId(1), ev.clone(), 0, 0);
        assert!(!matched);

        let mut ev2 = ev.clone();
        ev2.kind = EventKind::PutOverflow;
        let (found, matched) = table.match_or_insert(RequestId(2), ev2, 0, 0);
        assert!(matched);
        assert_eq!(found.unwrap().req, RequestId(1));
    }
}
