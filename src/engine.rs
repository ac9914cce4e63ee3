//! Execution fan-out engine, per §4.5.
//!
//! Accepts a batch of statement units for one logical SQL statement and a
//! caller-supplied callback; runs one unit on the caller's thread,
//! dispatches the rest to the worker pool; enforces per-physical-connection
//! mutual exclusion; collects results preserving input order; emits
//! lifecycle events; unifies error propagation across the sync/async paths.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::event::{EventSink, ExecutionEvent, ExecutionPhase, NoopEventSink, SqlType};
use crate::pool::{PoolSize, WorkerPool};

/// Cheap, cloneable, hashable identifier for a logical backend shard
/// (§3 **[ADDED]**).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataSourceId(Arc<str>);

impl DataSourceId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }
}

impl From<&str> for DataSourceId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for DataSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hashable identifier for the *physical* connection a statement unit runs
/// against; keys the mutual-exclusion lock, distinct from the wire-level
/// `ConnectionId` (§3 **[ADDED]**).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey(Arc<str>);

impl ConnectionKey {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }
}

impl From<&str> for ConnectionKey {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

/// An immutable descriptor of one physical execution (§3 `StatementUnit`).
///
/// Generic over the opaque connection handle `H` and parameter type `P`
/// (§9 **[ADDED]** design note) so this crate has zero dependency on any
/// concrete SQL value representation.
#[derive(Debug, Clone)]
pub struct StatementUnit<H, P> {
    pub data_source_id: DataSourceId,
    pub connection_key: ConnectionKey,
    pub handle: H,
    pub sql: Arc<str>,
    pub parameter_sets: Vec<P>,
}

/// Caller-supplied strategy: given a statement unit, produce a `T`
/// (typically a row cursor or update count). The only component that
/// touches the underlying database API (§3 `ExecuteCallback<T>`).
pub trait ExecuteCallback<H, P, T>: Fn(&StatementUnit<H, P>) -> Result<T> + Send + Sync {}
impl<H, P, T, F: Fn(&StatementUnit<H, P>) -> Result<T> + Send + Sync> ExecuteCallback<H, P, T> for F {}

/// Explicit carry-over of caller-scoped data into worker tasks, replacing
/// thread-local storage (§9 Design Note 1, **[ADDED]** to §3). Snapshotted
/// once at `execute()` entry and handed to every worker task, sync leg
/// included.
#[derive(Clone)]
pub struct ExecutionContext {
    pub throw_on_error: bool,
    user_data: Arc<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl ExecutionContext {
    pub fn new(throw_on_error: bool) -> Self {
        Self {
            throw_on_error,
            user_data: Arc::new(HashMap::new()),
        }
    }

    pub fn with_user_data(throw_on_error: bool, user_data: HashMap<String, Arc<dyn Any + Send + Sync>>) -> Self {
        Self {
            throw_on_error,
            user_data: Arc::new(user_data),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.user_data.get(key)
    }
}

/// Configuration surface for the engine (§4.7 **[ADDED]**).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 0 selects the unbounded cached pool; N>0 a fixed pool of N threads.
    ///
    /// **[DECIDED — Open Question, §9]**: unlike the distilled source,
    /// `Default` here picks a bounded size (`num_cpus * 2`) rather than 0,
    /// per the source's own recommendation that the unbounded mode is
    /// operationally dangerous under load. `executor_size = 0` remains a
    /// fully supported, explicit opt-in.
    pub executor_size: usize,
    /// Overall budget `close()` waits for in-flight/queued work to drain
    /// before giving up on joining worker threads.
    pub shutdown_drain: Duration,
    /// Idle timeout before a cached-pool worker thread exits.
    pub idle_timeout: Duration,
    /// Default exception-throw flag for `execute()` calls.
    pub throw_on_error: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executor_size: num_cpus::get() * 2,
            shutdown_drain: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(60),
            throw_on_error: true,
        }
    }
}

/// The execution fan-out engine itself (§4.5).
pub struct ExecutionEngine {
    pool: WorkerPool,
    connection_locks: DashMap<ConnectionKey, Arc<Mutex<()>>>,
    event_sink: Arc<dyn EventSink>,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_event_sink(config, Arc::new(NoopEventSink))
    }

    pub fn with_event_sink(config: EngineConfig, event_sink: Arc<dyn EventSink>) -> Self {
        let pool_size = if config.executor_size == 0 {
            PoolSize::Cached
        } else {
            PoolSize::Fixed(config.executor_size)
        };
        Self {
            pool: WorkerPool::new(pool_size, config.idle_timeout),
            connection_locks: DashMap::new(),
            event_sink,
            config,
        }
    }

    /// §4.5 public operation: `execute(sqlType, units[], callback) -> results[]`.
    ///
    /// Uses `config.throw_on_error` as the per-call exception-throw flag;
    /// see [`ExecutionEngine::execute_with_context`] to override it.
    pub fn execute<H, P, T, F>(&self, sql_type: SqlType, units: Vec<StatementUnit<H, P>>, callback: F) -> Result<Vec<Option<T>>>
    where
        H: Send + Sync + 'static,
        P: Send + Sync + 'static,
        T: Send + 'static,
        F: ExecuteCallback<H, P, T> + 'static,
    {
        let context = ExecutionContext::new(self.config.throw_on_error);
        self.execute_with_context(sql_type, units, callback, context)
    }

    /// Same as [`ExecutionEngine::execute`] with an explicit
    /// [`ExecutionContext`] (exception-throw flag + user data), per §9
    /// Design Note 1.
    pub fn execute_with_context<H, P, T, F>(
        &self,
        sql_type: SqlType,
        mut units: Vec<StatementUnit<H, P>>,
        callback: F,
        context: ExecutionContext,
    ) -> Result<Vec<Option<T>>>
    where
        H: Send + Sync + 'static,
        P: Send + Sync + 'static,
        T: Send + 'static,
        F: ExecuteCallback<H, P, T> + 'static,
    {
        // Step 1.
        if units.is_empty() {
            return Ok(Vec::new());
        }

        // Step 2.
        self.event_sink.publish(&ExecutionEvent::Overall {
            sql_type,
            unit_count: units.len(),
            phase: ExecutionPhase::Before,
            error: None,
        });

        let callback = Arc::new(callback);

        // Step 3: one unit runs synchronously on the caller's thread,
        // overlapping dispatch latency of the rest with real work.
        let sync_unit = units.remove(0);

        // Step 4: submit the remainder, collecting a receiver per unit in
        // input order.
        let rest = units;
        let receivers: Vec<mpsc::Receiver<Result<UnitOutcome<T>>>> = rest
            .into_iter()
            .map(|unit| {
                let (tx, rx) = mpsc::sync_channel::<Result<UnitOutcome<T>>>(1);
                let callback = Arc::clone(&callback);
                let context = context.clone();
                let lock = self.connection_lock(&unit.connection_key);
                let event_sink = Arc::clone(&self.event_sink);
                let job_unit = unit;
                let submit_result = self.pool.submit(Box::new(move || {
                    let result = execute_internal(&job_unit, sql_type, callback.as_ref(), &context, &lock, event_sink.as_ref());
                    let _ = tx.send(result);
                }));
                (submit_result, rx)
            })
            .map(|(submit_result, rx)| {
                if let Err(err) = submit_result {
                    log::warn!("failed to submit statement unit to worker pool: {err}");
                }
                rx
            })
            .collect();

        // Step 3 (execution) / Step 5: run the synchronous leg.
        let sync_lock = self.connection_lock(&sync_unit.connection_key);
        let sync_result = execute_internal(&sync_unit, sql_type, callback.as_ref(), &context, &sync_lock, self.event_sink.as_ref());

        let mut results = Vec::with_capacity(receivers.len() + 1);
        // §7: "Overall events always carry the first error observed" — this
        // tracks a suppressed (throw_on_error = false) failure too, not just
        // a hard short-circuiting one. `propagate_error` is the narrower
        // subset that must actually escape `execute` as `Err` — a suppressed
        // failure still reports Overall FAILURE but returns `Ok` with a
        // sentinel, per §8(f) ("no exception escapes").
        let mut first_error: Option<Arc<Error>> = None;
        let mut propagate_error: Option<Arc<Error>> = None;

        match sync_result {
            Ok(outcome) => {
                if first_error.is_none() {
                    first_error = outcome.error.clone();
                }
                results.push(outcome.value);
            }
            Err(err) => {
                // A failure on the synchronous leg short-circuits further
                // waiting; async futures already dispatched continue but
                // their results are discarded. `execute_internal` only
                // returns `Err` when `throw_on_error` is true, so this is
                // never a suppressed failure.
                let shared_err = Arc::new(err);
                self.event_sink.publish(&ExecutionEvent::Overall {
                    sql_type,
                    unit_count: receivers.len() + 1,
                    phase: ExecutionPhase::Failure,
                    error: Some(Arc::clone(&shared_err)),
                });
                return Err(unwrap_shared_error(shared_err));
            }
        }

        // Step 6: await each remaining future in order; append results.
        for rx in receivers {
            match rx.recv() {
                Ok(Ok(outcome)) => {
                    if first_error.is_none() {
                        first_error = outcome.error.clone();
                    }
                    results.push(outcome.value);
                }
                Ok(Err(err)) => {
                    let shared_err = Arc::new(err);
                    if first_error.is_none() {
                        first_error = Some(Arc::clone(&shared_err));
                    }
                    if propagate_error.is_none() {
                        propagate_error = Some(shared_err);
                    }
                    results.push(None);
                }
                Err(_) => {
                    // worker panicked or the pool dropped the job without
                    // running it; treat as a swallowed failure.
                    results.push(None);
                }
            }
        }

        if let Some(err) = first_error {
            self.event_sink.publish(&ExecutionEvent::Overall {
                sql_type,
                unit_count: results.len(),
                phase: ExecutionPhase::Failure,
                error: Some(Arc::clone(&err)),
            });
            if let Some(hard_err) = propagate_error {
                return Err(unwrap_shared_error(hard_err));
            }
            return Ok(results);
        }

        // Step 7.
        self.event_sink.publish(&ExecutionEvent::Overall {
            sql_type,
            unit_count: results.len(),
            phase: ExecutionPhase::Success,
            error: None,
        });

        Ok(results)
    }

    fn connection_lock(&self, key: &ConnectionKey) -> Arc<Mutex<()>> {
        Arc::clone(
            self.connection_locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Idempotent shutdown (§4.5 **[ADDED]**, §5): the caller's thread
    /// blocks at most `shutdown_drain` while the pool drains; if that
    /// budget is exceeded the pool logs and gives up waiting (Rust has no
    /// forced-thread-kill, documented in DESIGN.md as the `shutdownNow`
    /// analogue).
    pub fn close(self) {
        let budget = self.config.shutdown_drain;
        self.pool.close(budget);
    }
}

/// Outcome of a single unit's callback invocation, carried back to
/// `execute_with_context` across both the sync leg and the worker-pool
/// channel.
///
/// `error` is populated whenever the callback failed, *even if* the
/// failure was suppressed into `value: None` by `context.throw_on_error
/// == false` — the engine still needs it to report the Overall FAILURE
/// event required by §7 and §8(f), even though it won't propagate as an
/// `Err` from `execute`.
struct UnitOutcome<T> {
    value: Option<T>,
    error: Option<Arc<Error>>,
}

/// Recovers an owned `Error` from a shared one for the `Result::Err` path.
/// The Arc has exactly one owner by construction (the event subscriber only
/// ever sees a clone), so `try_unwrap` always succeeds; the `from_debug`
/// fallback only guards against an unreachable extra reference.
fn unwrap_shared_error(shared: Arc<Error>) -> Error {
    match Arc::try_unwrap(shared) {
        Ok(err) => err,
        Err(arc) => Error::from_debug(&arc),
    }
}

/// Per-unit execution, shared by the sync and async paths (§4.5
/// `executeInternal`).
///
/// Returns `Ok(UnitOutcome { value: Some(_), error: None })` on success,
/// `Ok(UnitOutcome { value: None, error: Some(_) })` when the callback
/// failed and `context.throw_on_error` is false (swallowed per §7, but the
/// error still surfaces for the Overall event), `Err(_)` when it failed
/// and the flag is true.
fn execute_internal<H, P, T>(
    unit: &StatementUnit<H, P>,
    sql_type: SqlType,
    callback: &(impl ExecuteCallback<H, P, T> + ?Sized),
    context: &ExecutionContext,
    lock: &Mutex<()>,
    event_sink: &dyn EventSink,
) -> Result<UnitOutcome<T>> {
    // Exclusive access to the unit's underlying physical connection for
    // the entire callback invocation (§5, §8 property 5).
    let _guard = lock.lock().map_err(|_| Error::Execution("connection lock poisoned".into()))?;

    publish_unit_events(unit, sql_type, ExecutionPhase::Before, None, event_sink);

    match callback(unit) {
        Ok(value) => {
            publish_unit_events(unit, sql_type, ExecutionPhase::Success, None, event_sink);
            Ok(UnitOutcome {
                value: Some(value),
                error: None,
            })
        }
        Err(err) => {
            // Share the real error (not a stringified stand-in) so a
            // subscriber can tell a SqlError from an internal bug (§7).
            let shared_err = Arc::new(err);
            publish_unit_events(unit, sql_type, ExecutionPhase::Failure, Some(Arc::clone(&shared_err)), event_sink);

            if context.throw_on_error {
                Err(unwrap_shared_error(shared_err))
            } else {
                Ok(UnitOutcome {
                    value: None,
                    error: Some(shared_err),
                })
            }
        }
    }
}

fn publish_unit_events<H, P>(
    unit: &StatementUnit<H, P>,
    sql_type: SqlType,
    phase: ExecutionPhase,
    error: Option<Arc<Error>>,
    event_sink: &dyn EventSink,
) {
    let count = unit.parameter_sets.len().max(1);
    for _ in 0..count {
        let event = match sql_type {
            SqlType::Dql => ExecutionEvent::DqlUnit {
                data_source_id: unit.data_source_id.clone(),
                sql: Arc::clone(&unit.sql),
                phase,
                error: error.clone(),
            },
            _ => ExecutionEvent::DmlUnit {
                data_source_id: unit.data_source_id.clone(),
                sql: Arc::clone(&unit.sql),
                phase,
                error: error.clone(),
            },
        };
        event_sink.publish(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn unit(ds: &str, conn: &str) -> StatementUnit<(), ()> {
        StatementUnit {
            data_source_id: DataSourceId::from(ds),
            connection_key: ConnectionKey::from(conn),
            handle: (),
            sql: Arc::from("select 1"),
            parameter_sets: vec![()],
        }
    }

    #[test]
    fn fan_out_preserves_input_order() {
        // §8 scenario (d).
        let engine = ExecutionEngine::new(EngineConfig {
            executor_size: 4,
            ..EngineConfig::default()
        });

        let units = vec![unit("ds0", "c0"), unit("ds1", "c1"), unit("ds2", "c2"), unit("ds3", "c3")];

        let results = engine
            .execute(SqlType::Dql, units, |u: &StatementUnit<(), ()>| Ok(u.data_source_id.clone()))
            .unwrap();

        let ids: Vec<String> = results.into_iter().map(|r| r.unwrap().to_string()).collect();
        assert_eq!(ids, vec!["ds0", "ds1", "ds2", "ds3"]);

        engine.close();
    }

    #[test]
    fn single_connection_serializes_callback_invocations() {
        // §8 scenario (e).
        let engine = ExecutionEngine::new(EngineConfig {
            executor_size: 4,
            ..EngineConfig::default()
        });

        let units = vec![unit("ds0", "shared"), unit("ds1", "shared")];
        let start = Instant::now();

        let results = engine
            .execute(SqlType::Dql, units, |_u: &StatementUnit<(), ()>| {
                std::thread::sleep(Duration::from_millis(100));
                Ok(())
            })
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(start.elapsed() >= Duration::from_millis(200));

        engine.close();
    }

    /// Captures every published event so tests can assert on the terminal
    /// Overall phase without racing a real subscriber.
    #[derive(Default)]
    struct RecordingEventSink {
        events: Mutex<Vec<ExecutionEvent>>,
    }

    impl EventSink for RecordingEventSink {
        fn publish(&self, event: &ExecutionEvent) {
            self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(event.clone());
        }
    }

    impl RecordingEventSink {
        fn overall_events(&self) -> Vec<ExecutionEvent> {
            self.events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .iter()
                .filter(|e| matches!(e, ExecutionEvent::Overall { .. }))
                .cloned()
                .collect()
        }
    }

    #[test]
    fn failure_suppression_returns_sentinel_and_keeps_other_results() {
        // §8 scenario (f).
        let sink = Arc::new(RecordingEventSink::default());
        let engine = ExecutionEngine::with_event_sink(
            EngineConfig {
                executor_size: 4,
                throw_on_error: false,
                ..EngineConfig::default()
            },
            Arc::clone(&sink) as Arc<dyn EventSink>,
        );

        let units = vec![unit("ds0", "c0"), unit("ds1", "c1"), unit("ds2", "c2"), unit("ds3", "c3")];

        let results = engine
            .execute(SqlType::Dml, units, |u: &StatementUnit<(), ()>| {
                if u.data_source_id == DataSourceId::from("ds1") {
                    Err(Error::Execution("simulated failure".into()))
                } else {
                    Ok(u.data_source_id.clone())
                }
            })
            .unwrap();

        assert!(results[0].is_some());
        assert!(results[1].is_none());
        assert!(results[2].is_some());
        assert!(results[3].is_some());

        // §8(f): "no exception escapes" is about `execute`'s return value,
        // not the event bus — the Overall terminal event must still report
        // FAILURE and carry the suppressed error (§7).
        let overall = sink.overall_events();
        let terminal = overall
            .iter()
            .find(|e| e.phase() != ExecutionPhase::Before)
            .expect("a terminal Overall event must be published");
        assert_eq!(terminal.phase(), ExecutionPhase::Failure);
        match terminal {
            ExecutionEvent::Overall { error, .. } => {
                assert!(error.is_some(), "Overall FAILURE must carry the first error observed");
            }
            _ => unreachable!(),
        }

        engine.close();
    }

    #[test]
    fn synchronous_leg_failure_short_circuits_with_throw_on_error() {
        let engine = ExecutionEngine::new(EngineConfig {
            executor_size: 2,
            throw_on_error: true,
            ..EngineConfig::default()
        });

        let units = vec![unit("ds0", "c0"), unit("ds1", "c1")];
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_callback = Arc::clone(&calls);

        let result = engine.execute(SqlType::Dml, units, move |_u: &StatementUnit<(), ()>| {
            calls_in_callback.fetch_add(1, Ordering::SeqCst);
            Err::<(), Error>(Error::Execution("sync leg failed".into()))
        });

        assert!(result.is_err());
        engine.close();
    }

    #[test]
    fn empty_units_returns_empty_results() {
        let engine = ExecutionEngine::new(EngineConfig::default());
        let results = engine
            .execute(SqlType::Dql, Vec::<StatementUnit<(), ()>>::new(), |_u: &StatementUnit<(), ()>| Ok(()))
            .unwrap();
        assert!(results.is_empty());
        engine.close();
    }
}
