//! Execution lifecycle events, per §3 `ExecutionEvent` and §4.6.

use std::fmt;
use std::sync::Arc;

use crate::engine::DataSourceId;
use crate::error::Error;

/// Tag selecting which event variant a unit's lifecycle emits (§3 `SqlType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Dql,
    Dml,
    Ddl,
    Dcl,
    Tcl,
}

/// Execution phase an event reports, per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    Before,
    Success,
    Failure,
}

/// One lifecycle event published by the fan-out engine (§3, §4.5).
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Emitted once per `execute()` call: BEFORE before dispatch, a
    /// terminal SUCCESS/FAILURE after all units settle.
    Overall {
        sql_type: SqlType,
        unit_count: usize,
        phase: ExecutionPhase,
        error: Option<Arc<Error>>,
    },
    /// Emitted once per parameter set of a DQL statement unit.
    DqlUnit {
        data_source_id: DataSourceId,
        sql: Arc<str>,
        phase: ExecutionPhase,
        error: Option<Arc<Error>>,
    },
    /// Emitted once per parameter set of a DML statement unit.
    DmlUnit {
        data_source_id: DataSourceId,
        sql: Arc<str>,
        phase: ExecutionPhase,
        error: Option<Arc<Error>>,
    },
}

impl ExecutionEvent {
    pub fn phase(&self) -> ExecutionPhase {
        match self {
            ExecutionEvent::Overall { phase, .. }
            | ExecutionEvent::DqlUnit { phase, .. }
            | ExecutionEvent::DmlUnit { phase, .. } => *phase,
        }
    }
}

impl fmt::Display for ExecutionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionEvent::Overall {
                sql_type,
                unit_count,
                phase,
                ..
            } => write!(f, "Overall({sql_type:?}, units={unit_count}, {phase:?})"),
            ExecutionEvent::DqlUnit {
                data_source_id, phase, ..
            } => write!(f, "DqlUnit({data_source_id}, {phase:?})"),
            ExecutionEvent::DmlUnit {
                data_source_id, phase, ..
            } => write!(f, "DmlUnit({data_source_id}, {phase:?})"),
        }
    }
}

/// Publish-only subscriber interface (§4.6, §9 Design Note 2). Injected
/// into the engine rather than a global singleton.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &ExecutionEvent);
}

/// The default sink: does nothing. Keeps the engine usable without an
/// observability stack wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: &ExecutionEvent) {}
}

/// Reference subscriber: logs each event at a level derived from its
/// phase (BEFORE/SUCCESS at debug, FAILURE at warn).
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn publish(&self, event: &ExecutionEvent) {
        match event.phase() {
            ExecutionPhase::Before | ExecutionPhase::Success => {
                tracing::debug!(target: "sharding_core::event", "{event}");
            }
            ExecutionPhase::Failure => {
                tracing::warn!(target: "sharding_core::event", "{event}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_accepts_every_event_kind_without_panicking() {
        let sink = NoopEventSink;
        sink.publish(&ExecutionEvent::Overall {
            sql_type: SqlType::Dql,
            unit_count: 4,
            phase: ExecutionPhase::Before,
            error: None,
        });
        sink.publish(&ExecutionEvent::DqlUnit {
            data_source_id: DataSourceId::from("ds0"),
            sql: Arc::from("select 1"),
            phase: ExecutionPhase::Success,
            error: None,
        });
        sink.publish(&ExecutionEvent::DmlUnit {
            data_source_id: DataSourceId::from("ds1"),
            sql: Arc::from("update t set x = 1"),
            phase: ExecutionPhase::Failure,
            error: Some(Arc::new(Error::Execution("boom".into()))),
        });
    }

    #[test]
    fn logging_sink_picks_warn_level_for_failure() {
        let sink = LoggingEventSink;
        let event = ExecutionEvent::Overall {
            sql_type: SqlType::Dml,
            unit_count: 1,
            phase: ExecutionPhase::Failure,
            error: Some(Arc::new(Error::Execution("boom".into()))),
        };
        assert_eq!(event.phase(), ExecutionPhase::Failure);
        sink.publish(&event); // smoke test: must not panic without a subscriber installed
    }
}
