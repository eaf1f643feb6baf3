//! Temporal ordering of reassembled operation streams

pub mod heap;
pub mod orderer;

pub use heap::OrderHeap;
pub use orderer::{order_ops, OrderSummary, DEFAULT_ORDER_BUFFER};
