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

//! Per-list, per-HMEM-interface message counters.
//!
//! `Master` keeps simple counters/maps behind its lock rather than a
//! metrics-library handle; here the counters are plain `u64` fields
//! bumped under the endpoint lock, with a snapshot type for
//! introspection/tests.

use crate::nic::PtlList;
use std::collections::HashMap;

/// A memory interface a message's payload lives in. HMEM-aware copies
/// are billed to whichever interface the
/// destination buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HmemIface {
    System,
    Cuda,
    Rocm,
    Ze,
}

impl Default for HmemIface {
    fn default() -> Self {
        HmemIface::System
    }
}

#[derive(Debug, Clone, Default)]
pub struct RxStats {
    per_list: HashMap<(PtlListKey, HmemIface), u64>,
    pub drops: u64,
    pub onloaded: u64,
}

/// `PtlList` isn't `Hash`/`Eq` (it models hardware state, not a map key);
/// this is the small key wrapper stats needs instead of deriving those on
/// the nic module's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PtlListKey {
    Priority,
    Overflow,
    Unexpected,
    Request,
}

impl From<PtlList> for PtlListKey {
    fn from(l: PtlList) -> Self {
        match l {
            PtlList::Priority => PtlListKey::Priority,
            PtlList::Overflow => PtlListKey::Overflow,
            PtlList::Unexpected => PtlListKey::Unexpected,
            PtlList::Request => PtlListKey::Request,
        }
    }
}

impl RxStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, list: PtlList, iface: HmemIface) {
        *self.per_list.entry((list.into(), iface)).or_insert(0) += 1;
    }

    pub fn count(&self, list: PtlList, iface: HmemIface) -> u64 {
        *self.per_list.get(&(list.into(), iface)).unwrap_or(&0)
    }

    pub fn record_drop(&mut self) {
        self.drops += 1;
    }

    pub fn record_onload(&mut self) {
        self.onloaded += 1;
    }
}

#[derive(Debug, Clone, Default)]
pub struct TxStats {
    pub eager_sent: u64,
    pub rendezvous_sent: u64,
    pub dropped: u64,
    pub replayed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_stats_track_list_and_iface_independently() {
        let mut stats = RxStats::new();
        stats.record(PtlList::Priority, HmemIface::System);
        stats.record(PtlList::Priority, HmemIface::System);
        stats.record(PtlList::Overflow, HmemIface::Cuda);

        assert_eq!(stats.count(PtlList::Priority, HmemIface::System), 2);
        assert_eq!(stats.count(PtlList::Overflow, HmemIface::Cuda), 1);
        assert_eq!(stats.count(PtlList::Overflow, HmemIface::System), 0);
    }
}
