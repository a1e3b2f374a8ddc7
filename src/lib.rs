//! Intra-node shared-memory message passing.
//!
//! Every rank on a node owns one shared segment holding its inbound
//! multi-producer / single-consumer FIFO and an arena of fixed-size fragment
//! buffers. Senders fill a fragment from their own arena and link it onto the
//! receiver's FIFO using relative offsets, so no raw pointer ever crosses an
//! address space.

pub mod core;
pub mod endpoint;

pub use crate::core::{Error, NodeConfig, Result, SizeClass};
pub use endpoint::{LocalNode, Received};
