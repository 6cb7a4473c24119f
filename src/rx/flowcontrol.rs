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

//! The RX flow-control state machine: hardware-offload ↔
//! software-managed mode transitions, unexpected-header onload, and
//! re-enable/resume handshaking.

use crate::config::AsicGeneration;
use crate::error::{fatal, EngineError, EngineResult};
use crate::nic::{CaDdr, DisableReason, SwManagedReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Disabled,
    Enabled,
    EnabledSoftware,
    PendingPtlteDisable,
    PendingPtlteSoftwareManaged,
    OnloadFlowControl,
    OnloadFlowControlReenable,
    FlowControl,
}

/// Reasons the NIC drove `Enabled` out of hardware-offloaded mode;
/// tracked alongside `prev_state` so `new_state` can later be promoted
/// to `EnabledSoftware` when the reason calls for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableTrigger {
    Disable(DisableReason),
    SoftwareManaged(SwManagedReason),
    ManualDisable,
}

/// The RX context's flow-control state, including the scratch fields
/// the transition sequence threads through `ONLOAD_FLOW_CONTROL`.
#[derive(Debug, Clone)]
pub struct FlowControl {
    pub state: RxState,
    pub prev_state: RxState,
    pub new_state: RxState,
    pub drop_count: i64,
    pub nic_drop_count: u64,
    pub fc_drops: Vec<CaDdr>,
    asic: AsicGeneration,
}

impl FlowControl {
    pub fn new(asic: AsicGeneration) -> Self {
        let drop_count = match asic {
            AsicGeneration::Legacy => -1,
            AsicGeneration::Current => 0,
        };
        FlowControl {
            state: RxState::Disabled,
            prev_state: RxState::Disabled,
            new_state: RxState::Disabled,
            drop_count,
            nic_drop_count: 0,
            fc_drops: Vec::new(),
            asic,
        }
    }

    pub fn enable(&mut self) {
        assert_eq!(self.state, RxState::Disabled, "rxtx-engine: double enable of RX context");
        self.state = RxState::Enabled;
    }

    /// A manual, software-initiated disable request: legal from
    /// `Enabled`, `OnloadFlowControl` (and its reenable variant),
    /// `FlowControl`, or `PendingPtlteSoftwareManaged` — anywhere the
    /// hardware side is already winding down. A disable arriving while
    /// already in plain `FlowControl` signals LE exhaustion under
    /// software-endpoint mode and is fatal.
    pub fn request_manual_disable(&mut self, check_fc: bool) -> EngineResult<()> {
        match self.state {
            RxState::Enabled
            | RxState::OnloadFlowControl
            | RxState::OnloadFlowControlReenable
            | RxState::FlowControl
            | RxState::PendingPtlteSoftwareManaged
            | RxState::PendingPtlteDisable => {}
            other => fatal(&format!("manual disable requested from unexpected state {:?}", other)),
        }

        if check_fc && self.state == RxState::FlowControl {
            fatal("flow control triggered while already in flow control: LE exhaustion under software mode");
        }

        if self.state != RxState::Enabled {
            return Ok(());
        }

        self.state = RxState::PendingPtlteDisable;
        Ok(())
    }

    /// The NIC's own `PTLTE_DISABLED` or `PTLTE_SOFTWARE_MANAGED` event,
    /// the trigger that actually starts the onload sequence.
    pub fn on_disable_event(&mut self, trigger: DisableTrigger, hybrid_software_initiated: bool) {
        match trigger {
            DisableTrigger::SoftwareManaged(_) => {
                self.state = RxState::PendingPtlteSoftwareManaged;
                return;
            }
            DisableTrigger::Disable(reason) => {
                self.prev_state = self.state;
                self.new_state = self.prev_state;

                let promote_to_software = match reason {
                    DisableReason::SoftwareInitiated => hybrid_software_initiated,
                    DisableReason::EqFull | DisableReason::NoMatch | DisableReason::RequestFull => true,
                    DisableReason::UnexpectedFail => false,
                };
                if promote_to_software {
                    self.new_state = RxState::EnabledSoftware;
                }
                self.state = RxState::OnloadFlowControl;
            }
            DisableTrigger::ManualDisable => {
                self.state = RxState::OnloadFlowControl;
            }
        }
    }

    /// At least one unexpected list entry was freed during onload: moves
    /// `OnloadFlowControl` one step closer to completion.
    pub fn on_ule_freed(&mut self) {
        if self.state == RxState::OnloadFlowControl {
            self.state = RxState::OnloadFlowControlReenable;
        }
    }

    /// The terminating Search event of the onload sequence. Escalates to
    /// `OnloadFlowControlReenable` if we're headed to software mode and
    /// hadn't already gotten there via a freed ULE; otherwise, still
    /// being stuck in bare `OnloadFlowControl` at this point is LE
    /// exhaustion the hardware can't recover from on its own.
    pub fn on_search_terminated(&mut self) {
        if self.state == RxState::OnloadFlowControl {
            if self.new_state == RxState::EnabledSoftware {
                self.state = RxState::OnloadFlowControlReenable;
            } else {
                fatal("onload terminated without reaching software mode: LE exhaustion");
            }
        }
    }

    /// Unexpected-send onload is complete: software transitions land in
    /// `EnabledSoftware` directly; hardware re-enable attempts continue
    /// through `FlowControl`.
    pub fn on_ux_onload_complete(&mut self) {
        match self.state {
            RxState::PendingPtlteSoftwareManaged => {
                self.state = RxState::EnabledSoftware;
            }
            RxState::OnloadFlowControlReenable => {
                self.state = RxState::FlowControl;
            }
            other => fatal(&format!("ux onload completed in unexpected state {:?}", other)),
        }
    }

    /// Attempts the hardware re-enable handshake. Requires the tracked
    /// `drop_count` to have caught up with what the NIC itself reports;
    /// a mismatch means another FC_NOTIFY from a peer is still pending.
    pub fn try_reenable(&mut self) -> EngineResult<()> {
        assert_eq!(self.state, RxState::FlowControl);

        if self.drop_count != self.nic_drop_count as i64 {
            return Err(EngineError::Transient);
        }

        self.state = self.new_state;
        Ok(())
    }

    /// NIC requests software mode again from `EnabledSoftware` — the
    /// only transition back out of steady-state software mode.
    pub fn on_software_mode_requested_again(&mut self) {
        assert_eq!(self.state, RxState::EnabledSoftware);
        self.state = RxState::PendingPtlteSoftwareManaged;
    }

    /// Records a software-initiated drop for the asic-version-dependent
    /// counter: legacy parts start at -1 and increment from there;
    /// current parts start at (and increment from) 0.
    pub fn record_software_initiated_drop(&mut self) {
        self.drop_count += 1;
    }

    pub fn asic_generation(&self) -> AsicGeneration {
        self.asic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_asic_starts_drop_count_at_negative_one() {
        let fc = FlowControl::new(AsicGeneration::Legacy);
        assert_eq!(fc.drop_count, -1);
    }

    #[test]
    fn current_asic_starts_drop_count_at_zero() {
        let fc = FlowControl::new(AsicGeneration::Current);
        assert_eq!(fc.drop_count, 0);
    }

    #[test]
    fn eq_full_promotes_to_software_even_without_hybrid_flag() {
        let mut fc = FlowControl::new(AsicGeneration::Current);
        fc.enable();
        fc.on_disable_event(DisableTrigger::Disable(DisableReason::EqFull), false);
        assert_eq!(fc.state, RxState::OnloadFlowControl);
        assert_eq!(fc.new_state, RxState::EnabledSoftware);
    }

    #[test]
    fn software_initiated_disable_only_promotes_in_hybrid_mode() {
        let mut fc = FlowControl::new(AsicGeneration::Current);
        fc.enable();
        fc.on_disable_event(DisableTrigger::Disable(DisableReason::SoftwareInitiated), false);
        assert_eq!(fc.new_state, RxState::Enabled);
    }

    #[test]
    fn full_recovery_returns_to_enabled() {
        let mut fc = FlowControl::new(AsicGeneration::Current);
        fc.enable();
        fc.on_disable_event(DisableTrigger::Disable(DisableReason::UnexpectedFail), false);
        assert_eq!(fc.state, RxState::OnloadFlowControl);
        fc.on_ule_freed();
        assert_eq!(fc.state, RxState::OnloadFlowControlReenable);
        fc.on_ux_onload_complete();
        assert_eq!(fc.state, RxState::FlowControl);
        fc.nic_drop_count = 0;
        fc.try_reenable().unwrap();
        assert_eq!(fc.state, RxState::Enabled);
    }

    #[test]
    fn reenable_is_transient_until_drop_counts_match() {
        let mut fc = FlowControl::new(AsicGeneration::Current);
        fc.state = RxState::FlowControl;
        fc.new_state = RxState::Enabled;
        fc.nic_drop_count = 3;
        assert!(matches!(fc.try_reenable(), Err(EngineError::Transient)));
        fc.drop_count = 3;
        assert!(fc.try_reenable().is_ok());
    }

    #[test]
    fn software_managed_event_goes_straight_to_pending_state() {
        let mut fc = FlowControl::new(AsicGeneration::Current);
        fc.enable();
        fc.on_disable_event(
            DisableTrigger::SoftwareManaged(SwManagedReason::AppendFail),
            false,
        );
        assert_eq!(fc.state, RxState::PendingPtlteSoftwareManaged);
        fc.on_ux_onload_complete();
        assert_eq!(fc.state, RxState::EnabledSoftware);
    }
}
