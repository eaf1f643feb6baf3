//! Global ordering of per-flow op streams
//!
//! Every reassembled flow is individually time-ordered but flows are not
//! ordered relative to each other. The orderer funnels them through a
//! bounded min-timestamp heap: each arrival is pushed, and once the heap
//! reaches capacity the minimum is popped, given the next order index, and
//! emitted. The lookahead window is exactly the heap capacity: two ops
//! separated by more interleaved traffic than that can still be emitted
//! out of true order. That trade-off is deliberate and tunable, not a
//! defect to paper over with unbounded buffering.

use crate::error::Result;
use crate::order::heap::OrderHeap;
use crate::playback::format::RecordedOp;
use tokio::sync::mpsc;
use tracing::debug;

/// Default lookahead window in buffered ops
pub const DEFAULT_ORDER_BUFFER: usize = 1024;

/// Counters reported when ordering finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderSummary {
    pub ops: u64,
    /// Ops emitted with a timestamp earlier than one already emitted
    pub inversions: u64,
}

/// Drain `rx` into `tx` in globally non-decreasing timestamp order (within
/// the lookahead window), assigning sequential order indices
pub async fn order_ops(
    mut rx: mpsc::Receiver<RecordedOp>,
    tx: mpsc::Sender<RecordedOp>,
    buffer_size: usize,
) -> Result<OrderSummary> {
    let capacity = buffer_size.max(1);
    let mut heap = OrderHeap::with_capacity(capacity);
    let mut summary = OrderSummary::default();
    let mut next_order: u64 = 0;
    let mut last_emitted = None;

    let mut emit = |mut op: RecordedOp, next_order: &mut u64, summary: &mut OrderSummary| {
        op.order = *next_order;
        *next_order += 1;
        summary.ops += 1;
        if let Some(last) = last_emitted {
            if op.seen < last {
                summary.inversions += 1;
            }
        }
        last_emitted = Some(op.seen);
        op
    };

    while let Some(op) = rx.recv().await {
        heap.push(op);
        if heap.len() < capacity {
            continue;
        }
        if let Some(op) = heap.pop() {
            let op = emit(op, &mut next_order, &mut summary);
            if tx.send(op).await.is_err() {
                debug!("ordered-op consumer gone, stopping orderer");
                return Ok(summary);
            }
        }
    }

    while let Some(op) = heap.pop() {
        let op = emit(op, &mut next_order, &mut summary);
        if tx.send(op).await.is_err() {
            break;
        }
    }

    debug!(ops = summary.ops, inversions = summary.inversions, "ordering complete");
    Ok(summary)
}
