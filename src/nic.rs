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

//! The NIC collaborator interface.
//!
//! The raw NIC command/event encoding is out of scope here, assumed
//! available as opaque `Event` and `Command` values built on a small set
//! of primitives the engine is allowed to assume: append, put, get,
//! link/unlink, search/search-and-delete, zero-byte put. This module is
//! that seam: a sum-type `Event` (replacing the original's `union
//! c_event` tagged-union pun with a proper Rust enum), a `Command` the
//! engine emits, and a `Nic` trait an integrator implements against real
//! hardware. Tests in this crate drive the engine against
//! `crate::mock_nic::MockNic` instead.

use crate::error::EngineResult;

/// NIC id + process id + virtual network id: the addressing quadruple
/// used to route a Put/Get back to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CaDdr {
    pub nic: u32,
    pub pid: u32,
    pub vni: u16,
}

/// The portal list an event or append applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtlList {
    Priority,
    Overflow,
    Unexpected,
    Request,
}

/// Reasons a PtlTE disable event can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    SoftwareInitiated,
    EqFull,
    NoMatch,
    UnexpectedFail,
    RequestFull,
}

/// Reasons a PtlTE software-managed transition event can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwManagedReason {
    AppendFail,
    UnexpectedFail,
}

/// Event/append outcome. Distinct from `EngineError`: this is what the NIC
/// reports happened, not what the engine is returning to its own caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok,
    NoSpace,
    PtlteDisabled(DisableReason),
    PtlteSoftwareManaged(SwManagedReason),
    EntryNotFound,
    Dropped,
    Other(u16),
}

/// The event types dispatched on in the receive router's table, plus the
/// source-side `Get`/`Send` events used by the TX engine and onload path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Link,
    Unlink,
    Put,
    PutOverflow,
    Rendezvous,
    Reply,
    Ack,
    Send,
    Search,
    Get,
    /// A peer notifying us that it dropped sends while our PtlTE was
    /// disabled (§6 `FC_NOTIFY`).
    FcNotify,
    /// A peer acking that it reconciled its drop count and re-enabled
    /// (§6 `FC_RESUME`).
    FcResume,
}

/// An event landing on a target list entry (a receive buffer, an overflow
/// buffer, or a search request) — the `tgt_long` variant of the original
/// tagged union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEvent {
    pub kind: EventKind,
    pub return_code: ReturnCode,
    /// Opaque per-request id carried as the NIC command's `user_ptr`.
    pub user_ptr: u32,
    pub initiator: u32,
    pub match_bits: u64,
    /// Start address/offset the data landed at (overflow buffer offset
    /// for Put-Overflow, or priority-buffer offset for multi-recv Put).
    pub start: u64,
    /// Bytes actually written locally (the eager portion for a
    /// rendezvous message).
    pub mlength: usize,
    /// Total remote message length.
    pub rlength: usize,
    /// Set when this transaction is a rendezvous (long) message.
    pub rendezvous: bool,
    /// Set on a Put/Put-Overflow that triggered an overflow buffer's
    /// auto-unlink.
    pub auto_unlinked: bool,
    /// True only for Put-Overflow events, which alone are guaranteed
    /// `manage_local`-ordered.
    pub manage_local: bool,
    /// The bytes this Put actually carried, local to this crate's test
    /// harness: real memory registration/DMA is out of scope (§1), so a
    /// production `Nic` impl would instead hand back a descriptor the
    /// engine copies through; the mock NIC hands back the bytes
    /// directly so the eager-copy paths stay testable end to end.
    pub payload: Vec<u8>,
}

/// An event landing on the initiator side of a transaction — the
/// `init_short` variant: Reply, Ack, Send, Get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitEvent {
    pub kind: EventKind,
    pub return_code: ReturnCode,
    pub user_ptr: u32,
    pub match_bits: u64,
    /// For a Reply: true if the initiating Get was issued by hardware
    /// directly off the Rendezvous event (no software `get_issued` path).
    pub rendezvous: bool,
}

/// A control-plane event (FC_NOTIFY / FC_RESUME acks) — the third arm of
/// the tagged union, kept distinct from message-path events because it
/// carries a peer address instead of a request-local match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtrlEvent {
    pub kind: EventKind,
    pub return_code: ReturnCode,
    pub user_ptr: u32,
    pub peer: CaDdr,
    /// The drop count carried by an `FcNotify`/`FcResume` message.
    pub drops: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Target(TargetEvent),
    Init(InitEvent),
    Control(CtrlEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Target(e) => e.kind,
            Event::Init(e) => e.kind,
            Event::Control(e) => e.kind,
        }
    }

    pub fn return_code(&self) -> ReturnCode {
        match self {
            Event::Target(e) => e.return_code,
            Event::Init(e) => e.return_code,
            Event::Control(e) => e.return_code,
        }
    }

    pub fn user_ptr(&self) -> u32 {
        match self {
            Event::Target(e) => e.user_ptr,
            Event::Init(e) => e.user_ptr,
            Event::Control(e) => e.user_ptr,
        }
    }
}

/// Commands the engine emits onto the NIC command queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AppendPriority { req_id: u32, tag: u64, ignore: u64, match_id: u32, len: usize },
    AppendOverflow { req_id: u32, len: usize },
    AppendRequestList { req_id: u32, len: usize },
    Unlink { req_id: u32 },
    Put { req_id: u32, dest: CaDdr, match_bits: u64, len: usize, rendezvous: bool },
    Get {
        req_id: u32,
        dest: CaDdr,
        match_bits: u64,
        restricted: bool,
        local_addr: u64,
        remote_offset: u64,
        request_len: usize,
    },
    Search { req_id: u32 },
    SearchAndDelete { req_id: u32 },
    ZeroBytePut { req_id: u32, dest: CaDdr, match_bits: u64 },
    /// `FC_NOTIFY`/`FC_RESUME`: a zero-byte put on the control LE
    /// (`ctrl_le_type = CTRL_MSG`) carrying a drop count.
    CtrlMessage { req_id: u32, dest: CaDdr, is_resume: bool, drops: u32 },
}

/// LE-pool usage watermarks consulted by the hybrid-preemption watchdogs
///.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeStats {
    pub lpe_stat_1: u32,
    pub lpe_stat_2: u32,
}

/// The external collaborator this crate treats as out of scope: memory
/// registration, address-vector lookup, counters, completion queues, and
/// command-queue emission. An integrator implements this against real
/// hardware; this crate only ever calls through it.
pub trait Nic {
    /// Emits a command. Returns `EngineError::Transient` if the command
    /// queue is full — the caller leaves the triggering event un-acked
    /// and retries next progress cycle.
    fn emit(&mut self, command: Command) -> EngineResult<()>;

    /// Current LE-pool usage watermarks, for the hybrid watchdogs.
    fn le_stats(&self) -> LeStats;

    /// Cumulative Put-drop counter the NIC maintains for a PtlTE, used to
    /// reconcile `drop_count` before re-enabling.
    fn nic_drop_count(&self) -> u64;

    /// Snapshots the remote offsets of all currently unmatched unexpected
    /// list entries.
    fn snapshot_ule_offsets(&self) -> Vec<u64>;
}
