//! Terminal multiplexing for the flotilla overlay
//!
//! This crate provides:
//! - Credit-based duplex flow control ([`flow::DuplexFlowQueue`])
//! - The encrypted, message-framed terminal ([`terminal::Terminal`])
//! - The pluggable operation registry ([`op`])
//! - The counting operation used for testing and liveness

pub mod flow;
pub mod op;
pub mod op_counter;
pub mod terminal;

pub use flow::{DuplexFlowQueue, FlowState, FlowSubmission, DEFAULT_QUEUE_SIZE};
pub use op::{OpParams, OpTerminal, Operation, TerminalPermission};
pub use op_counter::{CounterOp, CounterOpts};
pub use terminal::{Terminal, TerminalHandle, TerminalInit, TerminalOpts, TerminalUpstream};
