//! Tuple-coordination contract.
//!
//! An external ordered store addresses tuples as `/state/position`, where
//! positions run from 1 to `/state/max` without holes: deleting a tuple moves
//! the last one into its slot. A separate `/taken/position` keyspace holds the
//! [`ExecState`] of tuples handed to workers, which drives re-dispatch of
//! work whose worker went silent.
//!
//! [`TupleStore`] is the contract; [`InMemoryTupleStore`] implements it for
//! tests and embedding. [`Coordinator`] puts a deadline on every call and runs
//! the claim state machine:
//!
//! ```text
//!            claim                 deadline passed, retry < max
//!  (none) ──────────► Dispatched ──────────────────────────────► Redispatched
//!                         │                                           │
//!                         └── before deadline: InFlight               └── retry == max: Exhausted
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CoordinationError, CoordinationResult};
use crate::sync::RwLock;

/// Position of a tuple inside a state, starting at 1.
pub type Position = u64;

/// Key of the tuple at `position` in `state`.
pub fn tuple_key(state: &str, position: Position) -> String {
    format!("/{}/{}", state, position)
}

/// Key of the maximum position of `state`.
pub fn max_key(state: &str) -> String {
    format!("/{}/max", state)
}

/// Key of the execution state of the tuple at `position`.
pub fn taken_key(position: Position) -> String {
    format!("/taken/{}", position)
}

/// Dispatch record of a tuple handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecState {
    /// Re-dispatches so far
    pub retry: u32,
    /// Last dispatch
    pub timestamp: DateTime<Utc>,
}

/// Primitives of the ordered tuple store.
///
/// Every mutating primitive is atomic: it either applies completely or not
/// at all.
#[async_trait]
pub trait TupleStore: Send + Sync {
    /// Append a tuple at `max + 1`. Returns its position.
    async fn append(&self, state: &str, value: String) -> CoordinationResult<Position>;

    /// Replace the tuple at a position.
    async fn update(&self, state: &str, position: Position, value: String)
    -> CoordinationResult<()>;

    /// Delete the tuple at a position; the last tuple takes its place.
    async fn delete(&self, state: &str, position: Position) -> CoordinationResult<()>;

    /// A uniformly chosen tuple, `None` when the state is empty.
    async fn peek_random(&self, state: &str) -> CoordinationResult<Option<(Position, String)>>;

    /// Delete from one state and append to another. Returns the new position.
    async fn move_tuple(&self, from: &str, position: Position, to: &str)
    -> CoordinationResult<Position>;

    /// Exchange the values at two positions.
    async fn swap(
        &self,
        state_a: &str,
        pos_a: Position,
        state_b: &str,
        pos_b: Position,
    ) -> CoordinationResult<()>;

    /// Write `value` only if the current value equals `expected` (`None`:
    /// the slot is empty). Returns whether the write happened.
    async fn conditional_put(
        &self,
        state: &str,
        position: Position,
        expected: Option<&str>,
        value: String,
    ) -> CoordinationResult<bool>;

    /// Value at a position.
    async fn get(&self, state: &str, position: Position) -> CoordinationResult<Option<String>>;

    /// Current maximum position, 0 when empty.
    async fn max_position(&self, state: &str) -> CoordinationResult<Position>;

    /// Execution state of a taken tuple.
    async fn exec_state(&self, position: Position) -> CoordinationResult<Option<ExecState>>;

    /// Replace the execution state if it still equals `expected`.
    async fn compare_and_set_exec_state(
        &self,
        position: Position,
        expected: Option<ExecState>,
        new: ExecState,
    ) -> CoordinationResult<bool>;

    /// Forget the execution state. Returns whether there was one.
    async fn clear_exec_state(&self, position: Position) -> CoordinationResult<bool>;
}

/// Tuple store held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryTupleStore {
    states: RwLock<HashMap<String, Vec<String>>>,
    taken: RwLock<HashMap<Position, ExecState>>,
}

impl InMemoryTupleStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn index(state: &str, position: Position, len: usize) -> CoordinationResult<usize> {
    let in_range = position >= 1 && usize::try_from(position).is_ok_and(|p| p <= len);
    if !in_range {
        return Err(CoordinationError::NotFound {
            state: state.to_string(),
            position,
        });
    }
    Ok((position - 1) as usize)
}

fn remove_swapping(
    tuples: &mut Vec<String>,
    state: &str,
    position: Position,
) -> CoordinationResult<String> {
    let i = index(state, position, tuples.len())?;
    Ok(tuples.swap_remove(i))
}

#[async_trait]
impl TupleStore for InMemoryTupleStore {
    async fn append(&self, state: &str, value: String) -> CoordinationResult<Position> {
        let mut states = self.states.write();
        let tuples = states.entry(state.to_string()).or_default();
        tuples.push(value);
        Ok(tuples.len() as Position)
    }

    async fn update(
        &self,
        state: &str,
        position: Position,
        value: String,
    ) -> CoordinationResult<()> {
        let mut states = self.states.write();
        let tuples = states.entry(state.to_string()).or_default();
        let i = index(state, position, tuples.len())?;
        tuples[i] = value;
        Ok(())
    }

    async fn delete(&self, state: &str, position: Position) -> CoordinationResult<()> {
        let mut states = self.states.write();
        let tuples = states.entry(state.to_string()).or_default();
        remove_swapping(tuples, state, position).map(|_| ())
    }

    async fn peek_random(&self, state: &str) -> CoordinationResult<Option<(Position, String)>> {
        let states = self.states.read();
        let Some(tuples) = states.get(state).filter(|t| !t.is_empty()) else {
            return Ok(None);
        };
        let i = rand::thread_rng().gen_range(0..tuples.len());
        Ok(Some(((i + 1) as Position, tuples[i].clone())))
    }

    async fn move_tuple(
        &self,
        from: &str,
        position: Position,
        to: &str,
    ) -> CoordinationResult<Position> {
        let mut states = self.states.write();
        let source = states.entry(from.to_string()).or_default();
        let value = remove_swapping(source, from, position)?;
        let target = states.entry(to.to_string()).or_default();
        target.push(value);
        Ok(target.len() as Position)
    }

    async fn swap(
        &self,
        state_a: &str,
        pos_a: Position,
        state_b: &str,
        pos_b: Position,
    ) -> CoordinationResult<()> {
        let mut states = self.states.write();
        let len_a = states.get(state_a).map_or(0, Vec::len);
        let len_b = states.get(state_b).map_or(0, Vec::len);
        let a = index(state_a, pos_a, len_a)?;
        let b = index(state_b, pos_b, len_b)?;
        if state_a == state_b {
            if let Some(tuples) = states.get_mut(state_a) {
                tuples.swap(a, b);
            }
            return Ok(());
        }
        let value_a = states.get(state_a).map(|t| t[a].clone()).unwrap_or_default();
        let value_b = states.get(state_b).map(|t| t[b].clone()).unwrap_or_default();
        if let Some(tuples) = states.get_mut(state_a) {
            tuples[a] = value_b;
        }
        if let Some(tuples) = states.get_mut(state_b) {
            tuples[b] = value_a;
        }
        Ok(())
    }

    async fn conditional_put(
        &self,
        state: &str,
        position: Position,
        expected: Option<&str>,
        value: String,
    ) -> CoordinationResult<bool> {
        let mut states = self.states.write();
        let tuples = states.entry(state.to_string()).or_default();
        let slot = position
            .checked_sub(1)
            .and_then(|p| usize::try_from(p).ok())
            .filter(|i| *i <= tuples.len())
            .ok_or_else(|| CoordinationError::NotFound {
                state: state.to_string(),
                position,
            })?;
        let current = tuples.get(slot).map(String::as_str);
        if current != expected {
            return Ok(false);
        }
        if slot == tuples.len() {
            tuples.push(value);
        } else {
            tuples[slot] = value;
        }
        Ok(true)
    }

    async fn get(&self, state: &str, position: Position) -> CoordinationResult<Option<String>> {
        let states = self.states.read();
        let value = states
            .get(state)
            .zip(position.checked_sub(1))
            .and_then(|(t, i)| usize::try_from(i).ok().and_then(|i| t.get(i)))
            .cloned();
        Ok(value)
    }

    async fn max_position(&self, state: &str) -> CoordinationResult<Position> {
        Ok(self.states.read().get(state).map_or(0, Vec::len) as Position)
    }

    async fn exec_state(&self, position: Position) -> CoordinationResult<Option<ExecState>> {
        Ok(self.taken.read().get(&position).copied())
    }

    async fn compare_and_set_exec_state(
        &self,
        position: Position,
        expected: Option<ExecState>,
        new: ExecState,
    ) -> CoordinationResult<bool> {
        let mut taken = self.taken.write();
        if taken.get(&position).copied() != expected {
            return Ok(false);
        }
        taken.insert(position, new);
        Ok(true)
    }

    async fn clear_exec_state(&self, position: Position) -> CoordinationResult<bool> {
        Ok(self.taken.write().remove(&position).is_some())
    }
}

/// Deadlines and retry budget of a [`Coordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Deadline of a single store call
    pub call_timeout: Duration,
    /// Re-dispatches allowed per tuple
    pub max_retry: u32,
    /// Silence after which a dispatched tuple may be handed out again
    pub redispatch_after: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            max_retry: 3,
            redispatch_after: Duration::from_secs(30),
        }
    }
}

/// Result of [`Coordinator::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimOutcome {
    /// First dispatch of the tuple
    Dispatched,
    /// The previous worker timed out; dispatched again
    Redispatched {
        /// Re-dispatches including this one
        retry: u32,
    },
    /// Another worker holds it and is still within its deadline
    InFlight,
    /// The retry budget is spent
    Exhausted {
        /// Re-dispatches performed
        retries: u32,
    },
}

/// Deadline-bounded access to a tuple store.
#[derive(Debug)]
pub struct Coordinator<S: TupleStore> {
    store: Arc<S>,
    config: CoordinatorConfig,
}

impl<S: TupleStore> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config,
        }
    }
}

impl<S: TupleStore> Coordinator<S> {
    /// Coordinator over `store`.
    pub fn new(store: Arc<S>, config: CoordinatorConfig) -> Self {
        Self { store, config }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Deadlines in use.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run a store call under the configured deadline.
    ///
    /// On expiry the call is dropped and a retryable
    /// [`CoordinationError::Timeout`] returned; atomic primitives leave no
    /// partial state behind.
    pub async fn with_deadline<T, F>(&self, operation: &str, call: F) -> CoordinationResult<T>
    where
        F: Future<Output = CoordinationResult<T>>,
    {
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                let millis =
                    u64::try_from(self.config.call_timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!("Coordination call {} timed out after {} ms", operation, millis);
                Err(CoordinationError::Timeout {
                    operation: operation.to_string(),
                    millis,
                })
            }
        }
    }

    /// See [`TupleStore::append`].
    pub async fn append(
        &self,
        state: &str,
        value: impl Into<String>,
    ) -> CoordinationResult<Position> {
        self.with_deadline("append", self.store.append(state, value.into())).await
    }

    /// See [`TupleStore::update`].
    pub async fn update(
        &self,
        state: &str,
        position: Position,
        value: impl Into<String>,
    ) -> CoordinationResult<()> {
        self.with_deadline("update", self.store.update(state, position, value.into()))
            .await
    }

    /// See [`TupleStore::delete`].
    pub async fn delete(&self, state: &str, position: Position) -> CoordinationResult<()> {
        self.with_deadline("delete", self.store.delete(state, position)).await
    }

    /// See [`TupleStore::peek_random`].
    pub async fn peek_random(&self, state: &str) -> CoordinationResult<Option<(Position, String)>> {
        self.with_deadline("peek_random", self.store.peek_random(state)).await
    }

    /// See [`TupleStore::move_tuple`].
    pub async fn move_tuple(
        &self,
        from: &str,
        position: Position,
        to: &str,
    ) -> CoordinationResult<Position> {
        self.with_deadline("move", self.store.move_tuple(from, position, to)).await
    }

    /// See [`TupleStore::swap`].
    pub async fn swap(
        &self,
        state_a: &str,
        pos_a: Position,
        state_b: &str,
        pos_b: Position,
    ) -> CoordinationResult<()> {
        self.with_deadline("swap", self.store.swap(state_a, pos_a, state_b, pos_b))
            .await
    }

    /// See [`TupleStore::conditional_put`].
    pub async fn conditional_put(
        &self,
        state: &str,
        position: Position,
        expected: Option<&str>,
        value: impl Into<String>,
    ) -> CoordinationResult<bool> {
        self.with_deadline(
            "conditional_put",
            self.store.conditional_put(state, position, expected, value.into()),
        )
        .await
    }

    /// See [`TupleStore::get`].
    pub async fn get(&self, state: &str, position: Position) -> CoordinationResult<Option<String>> {
        self.with_deadline("get", self.store.get(state, position)).await
    }

    /// Claim the tuple at `position` for a worker at time `now`.
    ///
    /// A lost compare-and-set is reported as a retryable
    /// [`CoordinationError::Conflict`].
    pub async fn claim(
        &self,
        position: Position,
        now: DateTime<Utc>,
    ) -> CoordinationResult<ClaimOutcome> {
        let current = self
            .with_deadline("exec_state", self.store.exec_state(position))
            .await?;
        let (next, outcome) = match current {
            None => (ExecState { retry: 0, timestamp: now }, ClaimOutcome::Dispatched),
            Some(state) => {
                let silent = (now - state.timestamp)
                    .to_std()
                    .is_ok_and(|elapsed| elapsed >= self.config.redispatch_after);
                if !silent {
                    return Ok(ClaimOutcome::InFlight);
                }
                if state.retry >= self.config.max_retry {
                    tracing::debug!("Tuple {} exhausted {} retries", position, state.retry);
                    return Ok(ClaimOutcome::Exhausted { retries: state.retry });
                }
                let retry = state.retry + 1;
                (ExecState { retry, timestamp: now }, ClaimOutcome::Redispatched { retry })
            }
        };
        let won = self
            .with_deadline(
                "compare_and_set_exec_state",
                self.store.compare_and_set_exec_state(position, current, next),
            )
            .await?;
        if !won {
            return Err(CoordinationError::Conflict(taken_key(position)));
        }
        tracing::debug!("Claimed tuple {}: {:?}", position, outcome);
        Ok(outcome)
    }

    /// Release a finished tuple. Returns whether it was claimed.
    pub async fn complete(&self, position: Position) -> CoordinationResult<bool> {
        self.with_deadline("clear_exec_state", self.store.clear_exec_state(position))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_coordinator() -> Coordinator<InMemoryTupleStore> {
        Coordinator::new(
            Arc::new(InMemoryTupleStore::new()),
            CoordinatorConfig {
                call_timeout: Duration::from_millis(200),
                max_retry: 2,
                redispatch_after: Duration::from_secs(30),
            },
        )
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(tuple_key("todo", 3), "/todo/3");
        assert_eq!(max_key("todo"), "/todo/max");
        assert_eq!(taken_key(7), "/taken/7");
    }

    #[tokio::test]
    async fn test_append_and_delete_fill_holes() {
        let c = create_test_coordinator();
        for v in ["a", "b", "c"] {
            c.append("todo", v).await.unwrap();
        }
        c.delete("todo", 1).await.unwrap();
        assert_eq!(c.store().max_position("todo").await.unwrap(), 2);
        assert_eq!(c.get("todo", 1).await.unwrap().as_deref(), Some("c"));
        assert_eq!(c.get("todo", 2).await.unwrap().as_deref(), Some("b"));
        assert!(matches!(
            c.delete("todo", 5).await,
            Err(CoordinationError::NotFound { position: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_move_and_swap() {
        let c = create_test_coordinator();
        c.append("todo", "a").await.unwrap();
        c.append("todo", "b").await.unwrap();
        c.append("done", "z").await.unwrap();

        let pos = c.move_tuple("todo", 1, "done").await.unwrap();
        assert_eq!(pos, 2);
        assert_eq!(c.get("todo", 1).await.unwrap().as_deref(), Some("b"));
        assert_eq!(c.get("done", 2).await.unwrap().as_deref(), Some("a"));

        c.swap("todo", 1, "done", 1).await.unwrap();
        assert_eq!(c.get("todo", 1).await.unwrap().as_deref(), Some("z"));
        assert_eq!(c.get("done", 1).await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let c = create_test_coordinator();
        assert!(c.conditional_put("s", 1, None, "v1").await.unwrap());
        assert!(!c.conditional_put("s", 1, None, "v2").await.unwrap());
        assert!(c.conditional_put("s", 1, Some("v1"), "v2").await.unwrap());
        assert_eq!(c.get("s", 1).await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_peek_random() {
        let c = create_test_coordinator();
        assert_eq!(c.peek_random("empty").await.unwrap(), None);
        c.append("s", "only").await.unwrap();
        assert_eq!(c.peek_random("s").await.unwrap(), Some((1, "only".to_string())));
    }

    #[tokio::test]
    async fn test_claim_state_machine() {
        let c = create_test_coordinator();
        let t0 = Utc::now();
        assert_eq!(c.claim(1, t0).await.unwrap(), ClaimOutcome::Dispatched);
        assert_eq!(
            c.claim(1, t0 + chrono::Duration::seconds(5)).await.unwrap(),
            ClaimOutcome::InFlight
        );
        let t1 = t0 + chrono::Duration::seconds(31);
        assert_eq!(c.claim(1, t1).await.unwrap(), ClaimOutcome::Redispatched { retry: 1 });
        let t2 = t1 + chrono::Duration::seconds(31);
        assert_eq!(c.claim(1, t2).await.unwrap(), ClaimOutcome::Redispatched { retry: 2 });
        let t3 = t2 + chrono::Duration::seconds(31);
        assert_eq!(c.claim(1, t3).await.unwrap(), ClaimOutcome::Exhausted { retries: 2 });

        assert!(c.complete(1).await.unwrap());
        assert!(!c.complete(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_deadline_is_retryable() {
        let c = create_test_coordinator();
        let result: CoordinationResult<()> = c
            .with_deadline("slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, CoordinationError::Timeout { .. }));
        assert!(err.is_retryable());
    }
}
