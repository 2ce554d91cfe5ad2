use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Lifecycle of one outstanding remote call.
///
/// `INVALID_TRANSITION` is not a wire status: it is entered when a reply
/// arrives that the transition table rejects (duplicate or out-of-order
/// delivery), and it sticks - the offending message is recorded next to the
/// previous result instead of overwriting it, so protocol violations surface
/// to the caller rather than being masked. Whether sticking (as opposed to
/// escalating) is the right long-term behaviour is an open product question;
/// the runtime deliberately preserves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Inited,
    Started,
    Success,
    FailConn,
    FailPublish,
    RemoteError,
    InvalidTransition,
}

impl ReplyStatus {
    /// Parse a wire status string. `FAILURE` is the Celery-compatible
    /// spelling of `REMOTE_ERROR`; both are accepted.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INITED" => Some(Self::Inited),
            "STARTED" => Some(Self::Started),
            "SUCCESS" => Some(Self::Success),
            "FAIL_CONN" => Some(Self::FailConn),
            "FAIL_PUBLISH" => Some(Self::FailPublish),
            "FAILURE" | "REMOTE_ERROR" => Some(Self::RemoteError),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inited => "INITED",
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::FailConn => "FAIL_CONN",
            Self::FailPublish => "FAIL_PUBLISH",
            Self::RemoteError => "REMOTE_ERROR",
            Self::InvalidTransition => "INVALID_TRANSITION",
        }
    }

    /// Terminal statuses: no further reply is expected.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::FailConn | Self::FailPublish | Self::RemoteError
        )
    }
}

/// The transition table of the reply state machine.
fn is_valid_transition(old: ReplyStatus, new: ReplyStatus) -> bool {
    use ReplyStatus::*;
    matches!(
        (old, new),
        // remote worker acknowledged receipt
        (Inited, Started)
            // publish failed: broker unreachable
            | (Inited, FailConn)
            // publish failed: unroutable / NO_ROUTE
            | (Inited, FailPublish)
            // remote worker finished, result attached
            | (Started, Success)
            // remote worker reported an exception
            | (Started, RemoteError)
    )
}

/// One reply message, as found on the wire:
/// `{"status": ..., "result": ..., "error": ...}`.
///
/// `result` is opaque to the runtime and never inspected.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ReplyPayload {
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A point-in-time view of a reply event, safe to hand across call
/// boundaries. Note that `timed_out` is orthogonal to `status`: a timed-out
/// call is not finished, it just has a caller that should stop polling.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplySnapshot {
    pub correlation_id: String,
    pub status: ReplyStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub timed_out: bool,
}

/// The mutable core of a reply event. Shared between the caller-owned
/// [`ReplyEvent`] handle (strong) and the listener's pending registry
/// (weak), behind a mutex.
pub(crate) struct ReplyState {
    correlation_id: String,
    status: ReplyStatus,
    result: Option<Value>,
    error: Option<String>,
    timed_out: bool,
    deadline: Instant,
    ttl: Duration,
}

impl ReplyState {
    pub(crate) fn new(correlation_id: String, ttl: Duration) -> Self {
        Self {
            correlation_id,
            status: ReplyStatus::Inited,
            result: None,
            error: None,
            timed_out: false,
            deadline: Instant::now() + ttl,
            ttl,
        }
    }

    /// Apply one incoming reply against the transition table.
    ///
    /// A rejected transition (including unrecognized status strings) moves
    /// the state to `INVALID_TRANSITION` and replaces the result with
    /// `{"old_result": ..., "new_message": ...}`.
    pub(crate) fn apply(&mut self, payload: ReplyPayload) {
        match ReplyStatus::parse(&payload.status) {
            Some(new) if is_valid_transition(self.status, new) => {
                self.status = new;
                self.result = payload.result.clone();
            }
            _ => {
                let old_result = self.result.take();
                let new_message = serde_json::to_value(&payload).unwrap_or(Value::Null);
                self.status = ReplyStatus::InvalidTransition;
                self.result = Some(serde_json::json!({
                    "old_result": old_result,
                    "new_message": new_message,
                }));
            }
        }
        if let Some(error) = payload.error {
            self.error = Some(error);
        }
    }

    pub(crate) fn finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pure function of wall-clock time vs. the deadline, independent of
    /// message arrival.
    pub(crate) fn is_past_deadline(&self, now: Instant) -> bool {
        self.deadline < now
    }

    /// Extend the deadline by the original call timeout and clear the
    /// timeout flag.
    pub(crate) fn reset_deadline(&mut self, now: Instant) {
        self.deadline = now + self.ttl;
        self.timed_out = false;
    }

    pub(crate) fn set_timed_out(&mut self, value: bool) {
        self.timed_out = value;
    }

    pub(crate) fn snapshot(&self) -> ReplySnapshot {
        ReplySnapshot {
            correlation_id: self.correlation_id.clone(),
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            timed_out: self.timed_out,
        }
    }
}

/// Where a reply event goes to make progress: in production, the shared
/// reply listener draining its queue. The seam keeps the event logic
/// exercisable without a broker.
#[async_trait::async_trait]
pub trait ReplySource: Send + Sync + 'static {
    /// Drain at most `limit` messages within `poll_timeout`.
    async fn pump(
        &self,
        limit: Option<usize>,
        poll_timeout: Duration,
    ) -> Result<(), crate::rpc::ListenError>;
}

/// Knobs for one [`ReplyEvent::refresh`] invocation.
#[derive(Debug, Clone, Copy)]
pub struct RefreshOptions {
    /// When the deadline has already passed, reset it (extending by the
    /// original call timeout) instead of giving up.
    pub retry: bool,
    /// Maximum number of reply messages to drain. `None` means unbounded
    /// within the poll window.
    pub limit: Option<usize>,
    /// Upper bound on the time spent waiting on the reply queue.
    pub poll_timeout: Duration,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            retry: false,
            limit: None,
            poll_timeout: Duration::from_millis(500),
        }
    }
}

/// The caller-owned handle for one outstanding RPC call.
///
/// Progress is cooperative: nothing advances unless some caller invokes
/// [`refresh`](ReplyEvent::refresh), which pumps the shared listener for at
/// most one bounded wait. Dropping the handle abandons the call; a late
/// reply for it is acknowledged and discarded by the listener.
pub struct ReplyEvent {
    state: Arc<Mutex<ReplyState>>,
    source: Arc<dyn ReplySource>,
    correlation_id: String,
}

impl ReplyEvent {
    pub(crate) fn new(
        state: Arc<Mutex<ReplyState>>,
        source: Arc<dyn ReplySource>,
        correlation_id: String,
    ) -> Self {
        Self {
            state,
            source,
            correlation_id,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Poll for progress.
    ///
    /// If the deadline has passed and `retry` is set, the deadline is reset
    /// and polling resumes. Otherwise, if the call is neither finished nor
    /// timed out, the shared listener is pumped for at most one
    /// `poll_timeout` window and the timeout flag is recomputed. This is the
    /// only operation that touches the broker; [`snapshot`], [`finished`]
    /// and [`timed_out`] are pure reads.
    ///
    /// [`snapshot`]: ReplyEvent::snapshot
    /// [`finished`]: ReplyEvent::finished
    /// [`timed_out`]: ReplyEvent::timed_out
    pub async fn refresh(&self, options: RefreshOptions) -> Result<(), crate::rpc::ListenError> {
        let should_pump = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let mut past_deadline = state.is_past_deadline(now);
            if options.retry && past_deadline {
                state.reset_deadline(now);
                past_deadline = false;
            }
            state.set_timed_out(past_deadline);
            !past_deadline && !state.finished()
        };
        if should_pump {
            self.source.pump(options.limit, options.poll_timeout).await?;
            let mut state = self.state.lock().await;
            let past_deadline = state.is_past_deadline(Instant::now());
            state.set_timed_out(past_deadline);
        }
        Ok(())
    }

    /// A copy of the current state of the call.
    pub async fn snapshot(&self) -> ReplySnapshot {
        self.state.lock().await.snapshot()
    }

    /// `true` once the status is terminal
    /// (`SUCCESS`, `FAIL_CONN`, `FAIL_PUBLISH`, `REMOTE_ERROR`).
    pub async fn finished(&self) -> bool {
        self.state.lock().await.finished()
    }

    /// Whether the deadline has passed, computed live.
    pub async fn timed_out(&self) -> bool {
        self.state.lock().await.is_past_deadline(Instant::now())
    }

    /// Feed a reply body into the state machine. Used by the RPC client to
    /// drive publish-time failures into the event without a broker round
    /// trip.
    pub(crate) async fn send(&self, payload: ReplyPayload) {
        self.state.lock().await.apply(payload);
    }
}
