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

//! The receive side: one `RxContext` per endpoint, bundling the request
//! pool's receive-side state, the overflow-buffer pool, the unexpected
//! list, the deferred-event correlation table, the rendezvous child
//! index, and the flow-control state machine.

pub mod flowcontrol;
pub mod router;

use crate::config::EngineConfig;
use crate::deferred::DeferredTable;
use crate::oflow::OflowPool;
use crate::request::RdzvChildIndex;
use crate::unexpected::UnexpectedList;
use flowcontrol::FlowControl;

pub struct RxContext {
    pub oflow: OflowPool,
    pub unexpected: UnexpectedList,
    pub deferred: DeferredTable<()>,
    pub rdzv_children: RdzvChildIndex,
    pub flow_control: FlowControl,
    pub min_multi_recv: usize,
}

impl RxContext {
    pub fn new(config: &EngineConfig) -> Self {
        RxContext {
            oflow: OflowPool::new(config.oflow_buf_size, config.oflow_buf_min_posted, config.oflow_buf_max_cached),
            unexpected: UnexpectedList::new(),
            deferred: DeferredTable::new(config.deferred_event_buckets),
            rdzv_children: RdzvChildIndex::new(),
            flow_control: FlowControl::new(config.asic_generation),
            min_multi_recv: config.min_multi_recv,
        }
    }
}
