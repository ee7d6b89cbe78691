//! Per-conversation session cache and the steer-then-fallback policy.
//!
//! Each key moves through `no session -> thread without turn -> thread with
//! turn`. Continuing a cached turn is tried first; each rejection falls back
//! to a more expensive path, ending with a brand-new thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};

use crate::app_server::TurnClient;
use crate::types::{ConversationKey, TurnInput, TurnResult};

/// Source of "now" for `updated_at` stamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Cached identifiers for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub thread_id: String,
    /// Last turn seen in the thread. Empty until a turn id is known.
    pub turn_id: String,
    pub updated_at: DateTime<Utc>,
}

enum Plan {
    Fresh,
    NewTurn { thread_id: String },
    Steer { thread_id: String, turn_id: String },
}

pub struct SessionCoordinator<C> {
    client: C,
    clock: Arc<dyn Clock>,
    sessions: Mutex<HashMap<ConversationKey, SessionState>>,
}

impl<C: TurnClient> SessionCoordinator<C> {
    pub fn new(client: C) -> Self {
        Self::with_clock(client, Arc::new(SystemClock))
    }

    pub fn with_clock(client: C, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            clock,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Copy of the cached state for `key`.
    pub fn session(&self, key: &ConversationKey) -> Option<SessionState> {
        self.lock().get(key).cloned()
    }

    /// Forgets `key`. Returns whether a session existed.
    pub fn reset(&self, key: &ConversationKey) -> bool {
        let existed = self.lock().remove(key).is_some();
        tracing::info!(%key, existed, "session reset");
        existed
    }

    /// Runs one turn for `key`, continuing its cached session when possible.
    ///
    /// # Errors
    /// Returns an error only when every applicable path failed; the message
    /// joins the cause from each attempted path.
    pub async fn run_turn(&self, key: &ConversationKey, input: &TurnInput) -> Result<TurnResult> {
        let result = match self.plan(key) {
            Plan::Fresh => self.fresh(key, input).await?,
            Plan::NewTurn { thread_id } => {
                match self.client.start_turn(&thread_id, &input.prompt).await {
                    Ok(result) => backfill(result, &thread_id),
                    Err(turn_err) => {
                        tracing::warn!(
                            %key,
                            %thread_id,
                            error = %format!("{turn_err:#}"),
                            "start turn failed; starting a new thread"
                        );
                        self.fresh(key, input).await.map_err(|fresh_err| {
                            anyhow!(
                                "start turn failed: {turn_err:#}; new thread failed: {fresh_err:#}"
                            )
                        })?
                    }
                }
            }
            Plan::Steer { thread_id, turn_id } => {
                self.steer_with_fallback(key, input, &thread_id, &turn_id)
                    .await?
            }
        };

        self.remember(key, &result);
        Ok(result)
    }

    async fn steer_with_fallback(
        &self,
        key: &ConversationKey,
        input: &TurnInput,
        thread_id: &str,
        turn_id: &str,
    ) -> Result<TurnResult> {
        let steer_err = match self
            .client
            .steer_turn(thread_id, turn_id, &input.prompt)
            .await
        {
            Ok(result) => return Ok(backfill(result, thread_id)),
            Err(err) => err,
        };
        tracing::info!(
            %key,
            %thread_id,
            %turn_id,
            error = %format!("{steer_err:#}"),
            "steer rejected; starting turn in same thread"
        );

        let turn_err = match self.client.start_turn(thread_id, &input.prompt).await {
            Ok(result) => return Ok(backfill(result, thread_id)),
            Err(err) => err,
        };
        tracing::warn!(
            %key,
            %thread_id,
            error = %format!("{turn_err:#}"),
            "start turn failed; starting a new thread"
        );

        self.fresh(key, input).await.map_err(|fresh_err| {
            anyhow!(
                "steer failed: {steer_err:#}; start turn failed: {turn_err:#}; \
                 new thread failed: {fresh_err:#}"
            )
        })
    }

    async fn fresh(&self, key: &ConversationKey, input: &TurnInput) -> Result<TurnResult> {
        let thread_id = self.client.start_thread(input).await?;
        tracing::info!(%key, %thread_id, "new thread");
        let result = self.client.start_turn(&thread_id, &input.prompt).await?;
        Ok(backfill(result, &thread_id))
    }

    fn plan(&self, key: &ConversationKey) -> Plan {
        match self.session(key) {
            None => Plan::Fresh,
            Some(state) if state.thread_id.is_empty() => Plan::Fresh,
            Some(state) if state.turn_id.is_empty() => Plan::NewTurn {
                thread_id: state.thread_id,
            },
            Some(state) => Plan::Steer {
                thread_id: state.thread_id,
                turn_id: state.turn_id,
            },
        }
    }

    /// Merges the result's identifiers into the cache. Known identifiers
    /// never regress to empty. A cached turn id is kept only while the
    /// thread stays the same.
    fn remember(&self, key: &ConversationKey, result: &TurnResult) {
        let now = self.clock.now();
        let mut sessions = self.lock();
        let previous = sessions.get(key);
        let thread_id = match (result.thread_id.trim().is_empty(), previous) {
            (false, _) => result.thread_id.clone(),
            (true, Some(state)) => state.thread_id.clone(),
            (true, None) => String::new(),
        };
        let turn_id = if result.turn_id.trim().is_empty() {
            previous
                .filter(|state| state.thread_id == thread_id)
                .map(|state| state.turn_id.clone())
                .unwrap_or_default()
        } else {
            result.turn_id.clone()
        };
        tracing::debug!(%key, %thread_id, %turn_id, "session updated");
        sessions.insert(
            key.clone(),
            SessionState {
                thread_id,
                turn_id,
                updated_at: now,
            },
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConversationKey, SessionState>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fills a missing thread id with the one the call was made against.
fn backfill(mut result: TurnResult, thread_id: &str) -> TurnResult {
    if result.thread_id.trim().is_empty() {
        result.thread_id = thread_id.to_string();
    }
    result
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use anyhow::bail;
    use chrono::TimeZone;

    use super::*;
    use crate::app_server::TurnFuture;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        StartThread,
        StartTurn(String, String),
        Steer(String, String, String),
    }

    /// Replays canned outcomes and records every call.
    #[derive(Default)]
    struct StubClient {
        calls: StdMutex<Vec<Call>>,
        threads: StdMutex<VecDeque<Result<String>>>,
        turns: StdMutex<VecDeque<Result<TurnResult>>>,
        steers: StdMutex<VecDeque<Result<TurnResult>>>,
    }

    impl StubClient {
        fn thread(self, outcome: Result<&str>) -> Self {
            self.threads
                .lock()
                .unwrap()
                .push_back(outcome.map(str::to_string));
            self
        }

        fn turn(self, outcome: Result<TurnResult>) -> Self {
            self.turns.lock().unwrap().push_back(outcome);
            self
        }

        fn steer(self, outcome: Result<TurnResult>) -> Self {
            self.steers.lock().unwrap().push_back(outcome);
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn next<T>(queue: &StdMutex<VecDeque<Result<T>>>, what: &str) -> Result<T> {
            match queue.lock().unwrap().pop_front() {
                Some(outcome) => outcome,
                None => bail!("no scripted {what}"),
            }
        }
    }

    impl TurnClient for StubClient {
        fn start_thread<'a>(&'a self, _input: &'a TurnInput) -> TurnFuture<'a, String> {
            self.calls.lock().unwrap().push(Call::StartThread);
            Box::pin(async move { Self::next(&self.threads, "thread") })
        }

        fn start_turn<'a>(
            &'a self,
            thread_id: &'a str,
            prompt: &'a str,
        ) -> TurnFuture<'a, TurnResult> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::StartTurn(thread_id.to_string(), prompt.to_string()));
            Box::pin(async move { Self::next(&self.turns, "turn") })
        }

        fn steer_turn<'a>(
            &'a self,
            thread_id: &'a str,
            expected_turn_id: &'a str,
            prompt: &'a str,
        ) -> TurnFuture<'a, TurnResult> {
            self.calls.lock().unwrap().push(Call::Steer(
                thread_id.to_string(),
                expected_turn_id.to_string(),
                prompt.to_string(),
            ));
            Box::pin(async move { Self::next(&self.steers, "steer") })
        }
    }

    struct ManualClock(StdMutex<DateTime<Utc>>);

    impl ManualClock {
        fn at(seconds: i64) -> Arc<Self> {
            Arc::new(Self(StdMutex::new(
                Utc.timestamp_opt(seconds, 0).single().unwrap(),
            )))
        }

        fn advance(&self, seconds: i64) {
            *self.0.lock().unwrap() += chrono::Duration::seconds(seconds);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn result(thread_id: &str, turn_id: &str, text: &str) -> TurnResult {
        TurnResult {
            thread_id: thread_id.to_string(),
            turn_id: turn_id.to_string(),
            status: "completed".to_string(),
            text: text.to_string(),
            ..TurnResult::default()
        }
    }

    fn key() -> ConversationKey {
        ConversationKey::new("g1", "c1")
    }

    fn input(prompt: &str) -> TurnInput {
        TurnInput::new("base", "dev", prompt)
    }

    fn coordinator(stub: StubClient) -> (SessionCoordinator<Arc<StubClient>>, Arc<StubClient>) {
        let stub = Arc::new(stub);
        (SessionCoordinator::new(Arc::clone(&stub)), stub)
    }

    #[tokio::test]
    async fn first_turn_starts_thread_then_turn() {
        let (coordinator, stub) = coordinator(
            StubClient::default()
                .thread(Ok("thread-1"))
                .turn(Ok(result("", "turn-1", "A"))),
        );

        let result = coordinator.run_turn(&key(), &input("A")).await.unwrap();

        assert_eq!(result.thread_id, "thread-1");
        assert_eq!(
            stub.calls(),
            vec![
                Call::StartThread,
                Call::StartTurn("thread-1".into(), "A".into()),
            ]
        );
        let state = coordinator.session(&key()).unwrap();
        assert_eq!(state.thread_id, "thread-1");
        assert_eq!(state.turn_id, "turn-1");
    }

    #[tokio::test]
    async fn second_turn_steers_cached_turn() {
        let (coordinator, stub) = coordinator(
            StubClient::default()
                .thread(Ok("thread-1"))
                .turn(Ok(result("thread-1", "turn-1", "A")))
                .steer(Ok(result("thread-1", "turn-2", "B"))),
        );

        coordinator.run_turn(&key(), &input("A")).await.unwrap();
        let second = coordinator.run_turn(&key(), &input("B")).await.unwrap();

        assert_eq!(second.text, "B");
        let calls = stub.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(
            calls[2],
            Call::Steer("thread-1".into(), "turn-1".into(), "B".into())
        );
        assert_eq!(coordinator.session(&key()).unwrap().turn_id, "turn-2");
    }

    #[tokio::test]
    async fn rejected_steer_falls_back_to_same_thread() {
        let (coordinator, stub) = coordinator(
            StubClient::default()
                .thread(Ok("thread-1"))
                .turn(Ok(result("thread-1", "turn-1", "A")))
                .steer(Err(anyhow!("expected turn mismatch")))
                .turn(Ok(result("thread-1", "turn-2", "B"))),
        );

        coordinator.run_turn(&key(), &input("A")).await.unwrap();
        let second = coordinator.run_turn(&key(), &input("B")).await.unwrap();

        assert_eq!(second.turn_id, "turn-2");
        assert_eq!(
            stub.calls()[2..],
            [
                Call::Steer("thread-1".into(), "turn-1".into(), "B".into()),
                Call::StartTurn("thread-1".into(), "B".into()),
            ]
        );
        let thread_starts = stub
            .calls()
            .iter()
            .filter(|call| **call == Call::StartThread)
            .count();
        assert_eq!(thread_starts, 1);
    }

    #[tokio::test]
    async fn same_thread_failure_starts_new_thread() {
        let (coordinator, stub) = coordinator(
            StubClient::default()
                .thread(Ok("thread-1"))
                .turn(Ok(result("thread-1", "turn-1", "A")))
                .steer(Err(anyhow!("stale")))
                .turn(Err(anyhow!("thread gone")))
                .thread(Ok("thread-2"))
                .turn(Ok(result("", "turn-9", "B"))),
        );

        coordinator.run_turn(&key(), &input("A")).await.unwrap();
        let second = coordinator.run_turn(&key(), &input("B")).await.unwrap();

        assert_eq!(second.thread_id, "thread-2");
        assert_eq!(
            stub.calls()[2..],
            [
                Call::Steer("thread-1".into(), "turn-1".into(), "B".into()),
                Call::StartTurn("thread-1".into(), "B".into()),
                Call::StartThread,
                Call::StartTurn("thread-2".into(), "B".into()),
            ]
        );
        let state = coordinator.session(&key()).unwrap();
        assert_eq!(state.thread_id, "thread-2");
        assert_eq!(state.turn_id, "turn-9");
    }

    #[tokio::test]
    async fn exhausted_chain_joins_all_causes() {
        let (coordinator, _stub) = coordinator(
            StubClient::default()
                .thread(Ok("thread-1"))
                .turn(Ok(result("thread-1", "turn-1", "A")))
                .steer(Err(anyhow!("stale turn")))
                .turn(Err(anyhow!("busy thread")))
                .thread(Err(anyhow!("spawn failed"))),
        );

        coordinator.run_turn(&key(), &input("A")).await.unwrap();
        let err = coordinator.run_turn(&key(), &input("B")).await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("stale turn"), "{message}");
        assert!(message.contains("busy thread"), "{message}");
        assert!(message.contains("spawn failed"), "{message}");
        // failure leaves the cached session untouched
        assert_eq!(coordinator.session(&key()).unwrap().turn_id, "turn-1");
    }

    #[tokio::test]
    async fn fresh_path_failure_is_returned_as_is() {
        let (coordinator, stub) =
            coordinator(StubClient::default().thread(Err(anyhow!("spawn failed"))));

        let err = coordinator.run_turn(&key(), &input("A")).await.unwrap_err();

        assert_eq!(err.to_string(), "spawn failed");
        assert_eq!(stub.calls(), vec![Call::StartThread]);
        assert!(coordinator.session(&key()).is_none());
    }

    #[tokio::test]
    async fn thread_without_turn_starts_turn_then_falls_back() {
        let (coordinator, stub) = coordinator(
            StubClient::default()
                .thread(Ok("thread-1"))
                .turn(Ok(result("thread-1", "", "A")))
                .turn(Err(anyhow!("gone")))
                .thread(Ok("thread-2"))
                .turn(Ok(result("thread-2", "turn-1", "B"))),
        );

        coordinator.run_turn(&key(), &input("A")).await.unwrap();
        assert_eq!(coordinator.session(&key()).unwrap().turn_id, "");
        coordinator.run_turn(&key(), &input("B")).await.unwrap();

        assert_eq!(
            stub.calls()[2..],
            [
                Call::StartTurn("thread-1".into(), "B".into()),
                Call::StartThread,
                Call::StartTurn("thread-2".into(), "B".into()),
            ]
        );
    }

    #[tokio::test]
    async fn empty_identifiers_never_regress() {
        let (coordinator, _stub) = coordinator(
            StubClient::default()
                .thread(Ok("thread-1"))
                .turn(Ok(result("thread-1", "turn-1", "A")))
                .steer(Ok(result("", "", "B"))),
        );

        coordinator.run_turn(&key(), &input("A")).await.unwrap();
        let second = coordinator.run_turn(&key(), &input("B")).await.unwrap();

        assert_eq!(second.thread_id, "thread-1");
        let state = coordinator.session(&key()).unwrap();
        assert_eq!(state.thread_id, "thread-1");
        assert_eq!(state.turn_id, "turn-1");
    }

    #[tokio::test]
    async fn new_thread_without_turn_id_drops_cached_turn() {
        let (coordinator, stub) = coordinator(
            StubClient::default()
                .thread(Ok("thread-1"))
                .turn(Ok(result("thread-1", "turn-1", "A")))
                .steer(Err(anyhow!("stale")))
                .turn(Err(anyhow!("thread gone")))
                .thread(Ok("thread-2"))
                .turn(Ok(result("thread-2", "", "B")))
                .turn(Ok(result("thread-2", "turn-5", "C"))),
        );

        coordinator.run_turn(&key(), &input("A")).await.unwrap();
        coordinator.run_turn(&key(), &input("B")).await.unwrap();

        let state = coordinator.session(&key()).unwrap();
        assert_eq!(state.thread_id, "thread-2");
        assert_eq!(state.turn_id, "");

        coordinator.run_turn(&key(), &input("C")).await.unwrap();
        assert_eq!(
            stub.calls().last(),
            Some(&Call::StartTurn("thread-2".into(), "C".into()))
        );
        assert_eq!(stub.calls().len(), 7);
        assert_eq!(coordinator.session(&key()).unwrap().turn_id, "turn-5");
    }

    #[tokio::test]
    async fn reset_forces_new_thread() {
        let (coordinator, stub) = coordinator(
            StubClient::default()
                .thread(Ok("thread-1"))
                .turn(Ok(result("thread-1", "turn-1", "A")))
                .thread(Ok("thread-2"))
                .turn(Ok(result("thread-2", "turn-1", "B"))),
        );

        coordinator.run_turn(&key(), &input("A")).await.unwrap();
        assert!(coordinator.reset(&key()));
        assert!(!coordinator.reset(&key()));
        coordinator.run_turn(&key(), &input("B")).await.unwrap();

        assert_eq!(stub.calls()[2], Call::StartThread);
        assert_eq!(coordinator.session(&key()).unwrap().thread_id, "thread-2");
    }

    #[tokio::test]
    async fn keys_keep_separate_sessions() {
        let (coordinator, stub) = coordinator(
            StubClient::default()
                .thread(Ok("thread-1"))
                .turn(Ok(result("thread-1", "turn-1", "A")))
                .thread(Ok("thread-2"))
                .turn(Ok(result("thread-2", "turn-1", "B"))),
        );
        let other = ConversationKey::new("g1", "c2");

        coordinator.run_turn(&key(), &input("A")).await.unwrap();
        coordinator.run_turn(&other, &input("B")).await.unwrap();

        assert_eq!(stub.calls()[2], Call::StartThread);
        assert_eq!(coordinator.session(&other).unwrap().thread_id, "thread-2");
        assert_eq!(coordinator.session(&key()).unwrap().thread_id, "thread-1");
    }

    #[tokio::test]
    async fn updated_at_comes_from_the_clock() {
        let clock = ManualClock::at(1_700_000_000);
        let stub = Arc::new(
            StubClient::default()
                .thread(Ok("thread-1"))
                .turn(Ok(result("thread-1", "turn-1", "A")))
                .steer(Ok(result("thread-1", "turn-2", "B"))),
        );
        let coordinator = SessionCoordinator::with_clock(Arc::clone(&stub), clock.clone());

        coordinator.run_turn(&key(), &input("A")).await.unwrap();
        let first = coordinator.session(&key()).unwrap().updated_at;
        clock.advance(30);
        coordinator.run_turn(&key(), &input("B")).await.unwrap();
        let second = coordinator.session(&key()).unwrap().updated_at;

        assert_eq!(first.timestamp(), 1_700_000_000);
        assert_eq!((second - first).num_seconds(), 30);
    }
}
