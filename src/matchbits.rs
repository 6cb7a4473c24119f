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

//! The match-bit wire layout.
//!
//! This must be bit-identical across a rewrite for interop with existing
//! peers, so it is hand-rolled bit-twiddling rather than a serde format.
//! The engine never interprets reserved bits and must zero them on emit.
//!
//! ```text
//! [le_type : 2] [tagged : 1] [cq_data : 1] [match_comp : 1] [rdzv_done : 1]
//! [tx_id or rdzv_id_lo : 16] [rdzv_id_hi : 8] [rdzv_lac : 4] [rdzv_proto : 2]
//! [tag : 24] [reserved : 4]
//! ```

/// Low-half width of a rendezvous id, i.e. how many bits of it share the
/// `tx_id` slot. `rdzv_id_hi || rdzv_id_lo` reconstructs the full id.
pub const RDZV_ID_CMD_WIDTH: u32 = 16;
const RDZV_ID_HI_WIDTH: u32 = 8;
const TAG_WIDTH: u32 = 24;

const LE_TYPE_SHIFT: u32 = 0;
const TAGGED_SHIFT: u32 = 2;
const CQ_DATA_SHIFT: u32 = 3;
const MATCH_COMP_SHIFT: u32 = 4;
const RDZV_DONE_SHIFT: u32 = 5;
const TXID_OR_RDZV_LO_SHIFT: u32 = 6;
const RDZV_ID_HI_SHIFT: u32 = TXID_OR_RDZV_LO_SHIFT + RDZV_ID_CMD_WIDTH;
const RDZV_LAC_SHIFT: u32 = RDZV_ID_HI_SHIFT + RDZV_ID_HI_WIDTH;
const RDZV_PROTO_SHIFT: u32 = RDZV_LAC_SHIFT + 4;
const TAG_SHIFT: u32 = RDZV_PROTO_SHIFT + 2;
// Bits above TAG_SHIFT + TAG_WIDTH are reserved and always zeroed on emit.

fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// The LE type a match-bits value was posted under. Only the values the
/// engine itself emits or dispatches on are modeled; unknown encodings
/// decode to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeType {
    /// A normal user receive buffer.
    Rx,
    /// Zero-byte put: match-complete notify, or rendezvous-done notify.
    Zbp,
    /// Flow-control control message (FC_NOTIFY / FC_RESUME).
    CtrlMsg,
    Other(u8),
}

impl LeType {
    fn to_bits(self) -> u64 {
        match self {
            LeType::Rx => 0,
            LeType::Zbp => 1,
            LeType::CtrlMsg => 2,
            LeType::Other(v) => v as u64 & mask(2),
        }
    }

    fn from_bits(bits: u64) -> Self {
        match bits & mask(2) {
            0 => LeType::Rx,
            1 => LeType::Zbp,
            2 => LeType::CtrlMsg,
            other => LeType::Other(other as u8),
        }
    }
}

/// A decoded/encoded match-bits value. `tx_id` and `rdzv_id_lo` share the
/// same wire slot: which interpretation applies depends on
/// context (eager send vs. rendezvous), exactly as in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchBits {
    pub le_type: Option<LeType>,
    pub tagged: bool,
    pub cq_data: bool,
    pub match_comp: bool,
    pub rdzv_done: bool,
    /// Raw 16-bit value of the shared tx_id/rdzv_id_lo slot.
    pub txid_or_rdzv_lo: u16,
    pub rdzv_id_hi: u8,
    pub rdzv_lac: u8,
    pub rdzv_proto: u8,
    pub tag: u32,
}

impl Default for LeType {
    fn default() -> Self {
        LeType::Rx
    }
}

impl MatchBits {
    /// Full rendezvous id reconstructed from the hi/lo halves.
    pub fn rdzv_id(&self) -> u64 {
        ((self.rdzv_id_hi as u64) << RDZV_ID_CMD_WIDTH) | (self.txid_or_rdzv_lo as u64)
    }

    /// Splits a full rendezvous id into the hi/lo halves this layout
    /// carries on the wire.
    pub fn set_rdzv_id(&mut self, id: u64) {
        self.txid_or_rdzv_lo = (id & mask(RDZV_ID_CMD_WIDTH)) as u16;
        self.rdzv_id_hi = ((id >> RDZV_ID_CMD_WIDTH) & mask(RDZV_ID_HI_WIDTH)) as u8;
    }

    pub fn tx_id(&self) -> u16 {
        self.txid_or_rdzv_lo
    }

    pub fn set_tx_id(&mut self, tx_id: u16) {
        self.txid_or_rdzv_lo = tx_id;
    }

    /// Encodes this value to its 64-bit wire representation, zeroing all
    /// reserved bits.
    pub fn encode(&self) -> u64 {
        let mut raw = 0u64;
        raw |= self.le_type.unwrap_or(LeType::Rx).to_bits() << LE_TYPE_SHIFT;
        raw |= (self.tagged as u64) << TAGGED_SHIFT;
        raw |= (self.cq_data as u64) << CQ_DATA_SHIFT;
        raw |= (self.match_comp as u64) << MATCH_COMP_SHIFT;
        raw |= (self.rdzv_done as u64) << RDZV_DONE_SHIFT;
        raw |= (self.txid_or_rdzv_lo as u64 & mask(RDZV_ID_CMD_WIDTH)) << TXID_OR_RDZV_LO_SHIFT;
        raw |= (self.rdzv_id_hi as u64 & mask(RDZV_ID_HI_WIDTH)) << RDZV_ID_HI_SHIFT;
        raw |= (self.rdzv_lac as u64 & mask(4)) << RDZV_LAC_SHIFT;
        raw |= (self.rdzv_proto as u64 & mask(2)) << RDZV_PROTO_SHIFT;
        raw |= (self.tag as u64 & mask(TAG_WIDTH)) << TAG_SHIFT;
        // Bits above TAG_SHIFT + TAG_WIDTH stay zero: reserved.
        raw
    }

    /// Decodes a 64-bit wire value. Reserved bits are ignored on read.
    pub fn decode(raw: u64) -> Self {
        MatchBits {
            le_type: Some(LeType::from_bits(raw >> LE_TYPE_SHIFT)),
            tagged: (raw >> TAGGED_SHIFT) & 1 != 0,
            cq_data: (raw >> CQ_DATA_SHIFT) & 1 != 0,
            match_comp: (raw >> MATCH_COMP_SHIFT) & 1 != 0,
            rdzv_done: (raw >> RDZV_DONE_SHIFT) & 1 != 0,
            txid_or_rdzv_lo: ((raw >> TXID_OR_RDZV_LO_SHIFT) & mask(RDZV_ID_CMD_WIDTH)) as u16,
            rdzv_id_hi: ((raw >> RDZV_ID_HI_SHIFT) & mask(RDZV_ID_HI_WIDTH)) as u8,
            rdzv_lac: ((raw >> RDZV_LAC_SHIFT) & mask(4)) as u8,
            rdzv_proto: ((raw >> RDZV_PROTO_SHIFT) & mask(2)) as u8,
            tag: ((raw >> TAG_SHIFT) & mask(TAG_WIDTH)) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plain_tagged_send() {
        let mut mb = MatchBits::default();
        mb.le_type = Some(LeType::Rx);
        mb.tagged = true;
        mb.tag = 0x1234;
        mb.set_tx_id(77);

        let decoded = MatchBits::decode(mb.encode());
        assert_eq!(decoded.tagged, true);
        assert_eq!(decoded.tag, 0x1234);
        assert_eq!(decoded.tx_id(), 77);
        assert_eq!(decoded.le_type, Some(LeType::Rx));
    }

    #[test]
    fn round_trips_rendezvous_id_hi_lo_split() {
        let mut mb = MatchBits::default();
        mb.rdzv_lac = 3;
        mb.rdzv_proto = 1;
        mb.set_rdzv_id(0xABCDEF);

        let raw = mb.encode();
        let decoded = MatchBits::decode(raw);
        assert_eq!(decoded.rdzv_id(), 0xABCDEF);
        assert_eq!(decoded.rdzv_lac, 3);
        assert_eq!(decoded.rdzv_proto, 1);
    }

    #[test]
    fn reserved_bits_are_zeroed_on_emit() {
        let mb = MatchBits::default();
        let raw = mb.encode();
        let reserved_mask = !((1u64 << (TAG_SHIFT + TAG_WIDTH)) - 1);
        assert_eq!(raw & reserved_mask, 0);
    }

    #[test]
    fn zbp_le_type_round_trips() {
        let mut mb = MatchBits::default();
        mb.le_type = Some(LeType::Zbp);
        mb.set_tx_id(42);
        let decoded = MatchBits::decode(mb.encode());
        assert_eq!(decoded.le_type, Some(LeType::Zbp));
        assert_eq!(decoded.tx_id(), 42);
    }
}
