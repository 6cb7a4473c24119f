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

//! An in-memory `Nic` used only by this crate's own tests, in the spirit
//! of `sandstorm::MockDB`: commands the engine emits are recorded rather
//! than sent to hardware, and a test can assert on the recorded log
//! instead of standing up a real NIC.

#![cfg(test)]

use crate::error::{EngineError, EngineResult};
use crate::nic::{Command, LeStats, Nic};
use std::cell::RefCell;

#[derive(Default)]
pub struct MockNic {
    commands: RefCell<Vec<Command>>,
    le_stats: RefCell<LeStats>,
    drop_count: RefCell<u64>,
    ule_offsets: RefCell<Vec<u64>>,
    /// When set, `emit` returns this error instead of recording the
    /// command, modeling a full NIC command queue.
    fail_next: RefCell<Option<EngineError>>,
}

impl MockNic {
    pub fn new() -> Self {
        MockNic::default()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.borrow().clone()
    }

    pub fn clear_commands(&self) {
        self.commands.borrow_mut().clear();
    }

    pub fn assert_commands(&self, expected: &[Command]) {
        assert_eq!(self.commands.borrow().as_slice(), expected);
    }

    pub fn set_le_stats(&self, stats: LeStats) {
        *self.le_stats.borrow_mut() = stats;
    }

    pub fn set_drop_count(&self, count: u64) {
        *self.drop_count.borrow_mut() = count;
    }

    pub fn set_ule_offsets(&self, offsets: Vec<u64>) {
        *self.ule_offsets.borrow_mut() = offsets;
    }

    pub fn fail_next_emit(&self, err: EngineError) {
        *self.fail_next.borrow_mut() = Some(err);
    }
}

impl Nic for MockNic {
    fn emit(&mut self, command: Command) -> EngineResult<()> {
        if let Some(err) = self.fail_next.borrow_mut().take() {
            return Err(err);
        }
        self.commands.borrow_mut().push(command);
        Ok(())
    }

    fn le_stats(&self) -> LeStats {
        *self.le_stats.borrow()
    }

    fn nic_drop_count(&self) -> u64 {
        *self.drop_count.borrow()
    }

    fn snapshot_ule_offsets(&self) -> Vec<u64> {
        self.ule_offsets.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::CaDdr;

    #[test]
    fn records_emitted_commands_in_order() {
        let mut nic = MockNic::new();
        nic.emit(Command::Search { req_id: 1 }).unwrap();
        nic.emit(Command::Unlink { req_id: 2 }).unwrap();
        nic.assert_commands(&[Command::Search { req_id: 1 }, Command::Unlink { req_id: 2 }]);
    }

    #[test]
    fn fail_next_emit_returns_the_queued_error_once() {
        let mut nic = MockNic::new();
        nic.fail_next_emit(EngineError::Transient);
        assert_eq!(nic.emit(Command::Unlink { req_id: 1 }), Err(EngineError::Transient));
        nic.emit(Command::Unlink { req_id: 1 }).unwrap();
        assert_eq!(nic.commands().len(), 1);
    }

    #[test]
    fn reports_configured_drop_count_and_ule_offsets() {
        let nic = MockNic::new();
        nic.set_drop_count(7);
        nic.set_ule_offsets(vec![100, 200]);
        assert_eq!(nic.nic_drop_count(), 7);
        assert_eq!(nic.snapshot_ule_offsets(), vec![100, 200]);
        let _ = CaDdr::default();
    }
}
