//! Execution fan-out engine and backend protocol response machine for a
//! database sharding proxy/driver (spec.md §1–§2).
//!
//! This crate owns two collaborating subsystems: [`engine`] multiplexes one
//! logical SQL statement into N physical executions against backend
//! connections, and [`protocol`] parses the backend wire protocol and drives
//! a per-connection state machine that assembles structured results. SQL
//! parsing, sharding-rule evaluation, connection pooling policy, and TLS
//! negotiation are out of scope — see DESIGN.md.

pub mod constant;
pub mod engine;
pub mod error;
pub mod event;
mod pool;
pub mod protocol;
pub mod registry;

pub use engine::{
    ConnectionKey, DataSourceId, EngineConfig, ExecuteCallback, ExecutionContext, ExecutionEngine, StatementUnit,
};
pub use event::{EventSink, ExecutionEvent, ExecutionPhase, LoggingEventSink, NoopEventSink, SqlType};
pub use registry::{ChannelIdentity, ChannelRegistry, ConnectionId, FutureRegistry, ResponseFuture, ResponseFutureSender};
