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

//! Endpoint configuration.
//!
//! The original provider reads a process-wide `cxip_env` global; that is
//! lifted here into an immutable record constructed once and handed to
//! `Endpoint::new`. Fields map one-to-one onto the provider's tunable
//! knobs.

use serde::{Deserialize, Serialize};

/// Receive-side match-list offload posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RxMatchMode {
    /// Always post to the hardware priority list.
    Hardware,
    /// Never post to the hardware priority list; matching happens in
    /// software against `sw_recv_queue`/`sw_ux_list`.
    Software,
    /// Start hardware-offloaded, fall back to software under the
    /// preemption watchdogs or explicit NIC-driven mode switches.
    Hybrid,
}

/// Rendezvous (long-message) protocol variant a receiver should attempt
/// first when pulling the body of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RdzvProto {
    /// Unrestricted, match-bearing Get.
    Default,
    /// Restricted Get plus a notify Put/Ack round trip.
    AltRead,
    /// Declared but never implemented upstream; accepted here for API compatibility and silently downgraded
    /// to `Default` the first time it is attempted (see `rdzv::issue_get`).
    AltWrite,
}

/// Hardware generation affects when the RX drop counter resets during flow
/// control recovery. Both behaviors are kept
/// explicit rather than guessed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsicGeneration {
    /// Drop counter is reset to `-1` and incremented on software-initiated
    /// flow control (modeled here as `u64::MAX`, wrapping back to 0 on the
    /// first increment).
    Legacy,
    /// Drop counter resets to `0`.
    Current,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub rx_match_mode: RxMatchMode,

    /// Enables the LE-usage watchdog on overflow-buffer Link events.
    pub hybrid_preemptive: bool,
    /// Enables the same watchdog on priority-list Link events.
    pub hybrid_recv_preemptive: bool,
    /// Trigger a software-mode switch when the onloaded ULE count exceeds
    /// the posted-receive queue size.
    pub hybrid_unexpected_msg_preemptive: bool,
    /// Trigger a software-mode switch when the posted-receive count
    /// exceeds the queue size.
    pub hybrid_posted_recv_preemptive: bool,

    pub oflow_buf_size: usize,
    pub oflow_buf_min_posted: usize,
    pub oflow_buf_max_cached: usize,

    pub req_buf_size: usize,

    /// Microseconds to sleep before retrying an FC_NOTIFY/FC_RESUME that
    /// hit ENTRY_NOT_FOUND.
    pub fc_retry_usec_delay: u64,

    /// Eager prefix length carried alongside a rendezvous put.
    pub rdzv_eager_size: usize,

    pub rdzv_proto: RdzvProto,

    /// Initial offload bias; cleared once the RX context transitions to
    /// software-managed mode.
    pub msg_offload: bool,

    /// Force DMA even for small non-inject messages, bypassing IDC.
    pub disable_non_inject_msg_idc: bool,

    /// Maximum payload size eligible for the eager DMA path before the
    /// engine falls back to rendezvous.
    pub max_eager_size: usize,

    /// Maximum payload size eligible for inline-data commands.
    pub inject_size: usize,

    /// Outstanding TX-credit ceiling shared by RX-issued Gets and
    /// TX-issued sends.
    pub max_tx: usize,

    /// Below this many remaining bytes, a multi-recv buffer is no longer
    /// eligible to receive another message and is unlinked.
    pub min_multi_recv: usize,

    /// Cache-line alignment mask applied to software-issued rendezvous
    /// Gets.
    pub rget_align_mask: u64,

    pub asic_generation: AsicGeneration,

    /// Number of buckets in the deferred-event hash table.
    pub deferred_event_buckets: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            rx_match_mode: RxMatchMode::Hardware,
            hybrid_preemptive: false,
            hybrid_recv_preemptive: false,
            hybrid_unexpected_msg_preemptive: false,
            hybrid_posted_recv_preemptive: false,
            oflow_buf_size: 2 * 1024 * 1024,
            oflow_buf_min_posted: 3,
            oflow_buf_max_cached: 3,
            req_buf_size: 2 * 1024 * 1024,
            fc_retry_usec_delay: 1000,
            rdzv_eager_size: 2048,
            rdzv_proto: RdzvProto::Default,
            msg_offload: true,
            disable_non_inject_msg_idc: false,
            max_eager_size: 1 << 18,
            inject_size: 192,
            max_tx: 512,
            min_multi_recv: 64,
            rget_align_mask: 63,
            asic_generation: AsicGeneration::Current,
            deferred_event_buckets: 64,
        }
    }
}

impl EngineConfig {
    /// Parses a configuration record from a TOML document, overlaying
    /// onto the defaults so a caller only has to specify the knobs they
    /// want to change.
    pub fn from_toml(document: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_hardware_offloaded() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.rx_match_mode, RxMatchMode::Hardware);
        assert!(cfg.msg_offload);
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let cfg = EngineConfig::from_toml("rx_match_mode = \"hybrid\"\nmax_tx = 16\n").unwrap();
        assert_eq!(cfg.rx_match_mode, RxMatchMode::Hybrid);
        assert_eq!(cfg.max_tx, 16);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.oflow_buf_min_posted, 3);
    }
}
