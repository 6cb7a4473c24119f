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

//! Multi-recv buffer lifecycle bookkeeping shared by the hardware and
//! software receive paths.
//!
//! A multi-recv buffer services many incoming messages out of one
//! posted region until either it auto-unlinks in hardware or too little
//! space remains for another message. Children report their consumed
//! bytes back to the parent as they complete; this module is where that
//! accounting lives.

use crate::request::{RequestId, RequestPool};

/// Consumes `rlen` bytes of priority-list space from a multi-recv
/// buffer tracked purely by offset (used when a Put Overflow event
/// doesn't carry its own Priority-list offset, so software must track it
/// from ordered events). Returns the number of bytes actually available,
/// clamped to what remains in the buffer.
pub fn put_bytes(pool: &mut RequestPool, parent_id: RequestId, rlen: usize) -> usize {
    let recv = pool.get_mut(parent_id).expect("parent must exist").recv_mut();
    let remaining = recv.ulen - recv.start_offset;
    let taken = remaining.min(rlen);
    recv.start_offset += taken;
    taken
}

/// Whether a completing child should trigger the parent's unlink, called
/// once a child request finishes and reports its consumed bytes up.
///
/// Two distinct unlink conditions apply depending on whether the buffer
/// is still hardware-offloaded: an auto-unlinked hardware buffer is done
/// once every byte the NIC already consumed has been accounted for by
/// software; a buffer still accepting new matches is done once the
/// remaining space drops below the configured floor.
pub fn child_completed(pool: &mut RequestPool, parent_id: RequestId, child_data_len: usize, min_multi_recv: usize) -> bool {
    let recv = pool.get_mut(parent_id).expect("parent must exist").recv_mut();
    recv.mrecv_bytes += child_data_len;

    if recv.hw_offloaded {
        recv.auto_unlinked && recv.mrecv_bytes == recv.mrecv_unlink_bytes
    } else {
        (recv.ulen - recv.mrecv_bytes) < min_multi_recv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Payload, RecvFlags, RecvPayload};

    fn parent(pool: &mut RequestPool, ulen: usize) -> RequestId {
        let payload = RecvPayload::new(vec![0u8; ulen], 0, 0, u32::MAX, RecvFlags::MULTI_RECV, false);
        pool.alloc(0, Payload::Recv(payload))
    }

    #[test]
    fn put_bytes_clamps_to_remaining_space() {
        let mut pool = RequestPool::new();
        let id = parent(&mut pool, 100);
        assert_eq!(put_bytes(&mut pool, id, 60), 60);
        assert_eq!(put_bytes(&mut pool, id, 60), 40);
        assert_eq!(put_bytes(&mut pool, id, 10), 0);
    }

    #[test]
    fn software_managed_buffer_unlinks_below_floor() {
        let mut pool = RequestPool::new();
        let id = parent(&mut pool, 100);
        pool.get_mut(id).unwrap().recv_mut().hw_offloaded = false;

        assert!(!child_completed(&mut pool, id, 20, 64));
        assert!(child_completed(&mut pool, id, 40, 64));
    }

    #[test]
    fn hw_offloaded_buffer_unlinks_only_after_matching_consumed_bytes() {
        let mut pool = RequestPool::new();
        let id = parent(&mut pool, 100);
        {
            let recv = pool.get_mut(id).unwrap().recv_mut();
            recv.hw_offloaded = true;
            recv.auto_unlinked = true;
            recv.mrecv_unlink_bytes = 50;
        }
        assert!(!child_completed(&mut pool, id, 30, 64));
        assert!(child_completed(&mut pool, id, 20, 64));
    }
}
