//! Pending operation bookkeeping
//!
//! The table below is driven entirely by the pump loop. It never touches the
//! transport: every call returns the messages to send and the results that
//! were produced, so the matching rules can be tested without a link.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::{ErrorKind, OperationKind, OperationResult, ParamType, ParamValue};
use crate::protocol::message::INDEX_UNLISTED;
use crate::protocol::{Endpoint, Outbound};

/// What an operation asks of the vehicle
#[derive(Debug, Clone, PartialEq)]
pub enum OpRequest {
    Get {
        name: String,
    },
    Set {
        name: String,
        value: ParamValue,
        param_type: ParamType,
        verify: bool,
        /// Float tolerance for verification
        increment: Option<f32>,
    },
    RefreshAll,
}

impl OpRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            OpRequest::Get { .. } => OperationKind::Get,
            OpRequest::Set { .. } => OperationKind::Set,
            OpRequest::RefreshAll => OperationKind::RefreshAll,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            OpRequest::Get { name } | OpRequest::Set { name, .. } => Some(name),
            OpRequest::RefreshAll => None,
        }
    }

    fn key(&self) -> OpKey {
        match self.name() {
            Some(name) => OpKey::Param(name.to_string()),
            None => OpKey::RefreshAll,
        }
    }

    fn message(&self, target: Endpoint) -> Outbound {
        match self {
            OpRequest::Get { name } => Outbound::ParamRequestRead { target, name: name.clone() },
            OpRequest::Set { name, value, param_type, .. } => Outbound::ParamSet {
                target,
                name: name.clone(),
                value: *value,
                param_type: *param_type,
            },
            OpRequest::RefreshAll => Outbound::ParamRequestList { target },
        }
    }
}

/// Operations are serialised per parameter name; a refresh has its own lane
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum OpKey {
    Param(String),
    RefreshAll,
}

/// One request waiting for the vehicle
#[derive(Debug)]
pub struct PendingOperation {
    request: OpRequest,
    /// Per attempt for get/set, overall for a refresh
    timeout: Duration,
    attempts_left: u32,
    retry_delay: Duration,
    started: Instant,
    /// Reply deadline of the attempt on the wire
    deadline: Option<Instant>,
    /// When the next attempt goes out, while waiting out the retry delay
    resend_at: Option<Instant>,
    /// Last non-matching value a refresh delivered while a set waited for its echo
    listed: Option<ParamValue>,
    reply: Option<oneshot::Sender<OperationResult>>,
}

impl PendingOperation {
    /// Creates an operation and the receiver its result arrives on.
    ///
    /// `attempts` is the total number of wire attempts and is clamped to 1.
    pub fn new(
        request: OpRequest,
        timeout: Duration,
        attempts: u32,
        retry_delay: Duration,
    ) -> (Self, oneshot::Receiver<OperationResult>) {
        let (tx, rx) = oneshot::channel();
        let op = PendingOperation {
            request,
            timeout,
            attempts_left: attempts.max(1),
            retry_delay,
            started: Instant::now(),
            deadline: None,
            resend_at: None,
            listed: None,
            reply: Some(tx),
        };
        (op, rx)
    }

    pub fn request(&self) -> &OpRequest {
        &self.request
    }

    /// Fails an operation that never reached the table
    pub fn abandon(mut self, error: ErrorKind, message: &str, now: Instant) -> Option<OperationResult> {
        let mut step = Step::default();
        self.fail(error, message, now, &mut step);
        step.completed.pop()
    }

    fn in_flight(&self) -> bool {
        self.deadline.is_some() || self.resend_at.is_some()
    }

    /// Puts one attempt on the wire
    fn start_attempt(&mut self, now: Instant, target: Endpoint, step: &mut Step) {
        self.attempts_left = self.attempts_left.saturating_sub(1);
        self.deadline = Some(now + self.timeout);
        self.resend_at = None;
        step.sends.push(self.request.message(target));
    }

    /// Delivers the result; later calls are no-ops
    fn resolve(&mut self, result: OperationResult, step: &mut Step) {
        if let Some(reply) = self.reply.take() {
            // The caller may have stopped waiting
            let _ = reply.send(result.clone());
            step.completed.push(result);
        }
    }

    fn succeed(&mut self, value: Option<ParamValue>, now: Instant, step: &mut Step) {
        let result = OperationResult::succeeded(
            self.request.kind(),
            self.request.name().map(str::to_string),
            value,
            now.duration_since(self.started),
        );
        self.resolve(result, step);
    }

    /// Resolves a set whose stored value differs from the requested one
    fn fail_verification(&mut self, stored: ParamValue, now: Instant, step: &mut Step) {
        let (name, requested) = match &self.request {
            OpRequest::Set { name, value, .. } => (name.clone(), *value),
            _ => return,
        };
        warn!(param = %name, %requested, echoed = %stored, "Parameter set verification failed");
        let result = OperationResult::failed(
            OperationKind::Set,
            Some(name),
            ErrorKind::VerificationFailed,
            format!("vehicle stored {} instead of {}", stored, requested),
            now.duration_since(self.started),
        )
        .with_value(stored);
        self.resolve(result, step);
    }

    /// Settles a set at its deadline from the list value it saw instead of an
    /// echo. Returns false when there is none.
    fn settle_listed(&mut self, now: Instant, step: &mut Step) -> bool {
        let Some(stored) = self.listed.take() else {
            return false;
        };
        match self.request {
            OpRequest::Set { verify: true, .. } => self.fail_verification(stored, now, step),
            _ => self.succeed(Some(stored), now, step),
        }
        true
    }

    fn fail(&mut self, error: ErrorKind, message: impl Into<String>, now: Instant, step: &mut Step) {
        let result = OperationResult::failed(
            self.request.kind(),
            self.request.name().map(str::to_string),
            error,
            message,
            now.duration_since(self.started),
        );
        self.resolve(result, step);
    }
}

/// Side effects produced by the operation table
#[derive(Debug, Default)]
pub struct Step {
    /// Messages to write, in order
    pub sends: Vec<Outbound>,
    /// Results to broadcast to operation observers
    pub completed: Vec<OperationResult>,
}

/// Refresh progress reported by the parameter store
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshProgress {
    pub received: usize,
    pub total: Option<u16>,
    pub complete: bool,
}

/// Every operation the pump is tracking, queued per key
#[derive(Debug, Default)]
pub struct OperationTable {
    lanes: HashMap<OpKey, VecDeque<PendingOperation>>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations queued or in flight
    pub fn len(&self) -> usize {
        self.lanes.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Queues an operation; it goes on the wire once its lane is free
    pub fn submit(&mut self, op: PendingOperation, now: Instant, target: Endpoint) -> Step {
        let mut step = Step::default();
        let lane = self.lanes.entry(op.request.key()).or_default();
        lane.push_back(op);
        if lane.len() == 1 {
            start_head(lane, now, target, &mut step);
        } else {
            debug!(queued = lane.len(), "Operation queued behind an in-flight request");
        }
        step
    }

    /// Offers a value from the vehicle to the operation waiting on that name.
    ///
    /// While a refresh is running, a value carrying a list index may be the
    /// list reply rather than the echo of a pending set. Such a value only
    /// resolves the set if it matches; otherwise the set keeps waiting and
    /// settles on it at the attempt deadline.
    pub fn on_param_value(
        &mut self,
        name: &str,
        value: ParamValue,
        index: u16,
        now: Instant,
        target: Endpoint,
    ) -> Step {
        let mut step = Step::default();
        let listing = index != INDEX_UNLISTED && self.refresh_in_flight();
        let key = OpKey::Param(name.to_string());
        let Some(lane) = self.lanes.get_mut(&key) else {
            return step;
        };
        let Some(head) = lane.front_mut() else {
            return step;
        };
        if !head.in_flight() {
            return step;
        }

        match head.request.clone() {
            OpRequest::Get { .. } => head.succeed(Some(value), now, &mut step),
            OpRequest::Set { value: requested, verify, increment, .. } => {
                if requested.matches(&value, increment) || (!verify && !listing) {
                    head.succeed(Some(value), now, &mut step);
                } else if listing {
                    debug!(param = %name, %value, index, "List value while a set is pending, waiting for the echo");
                    head.listed = Some(value);
                    return step;
                } else {
                    head.fail_verification(value, now, &mut step);
                }
            }
            OpRequest::RefreshAll => {}
        }

        advance_lane(&mut self.lanes, key, now, target, &mut step);
        step
    }

    fn refresh_in_flight(&self) -> bool {
        self.lanes
            .get(&OpKey::RefreshAll)
            .and_then(VecDeque::front)
            .map_or(false, PendingOperation::in_flight)
    }

    /// Resolves the running refresh once the store holds the full table
    pub fn on_refresh_progress(&mut self, progress: RefreshProgress, now: Instant, target: Endpoint) -> Step {
        let mut step = Step::default();
        if !progress.complete {
            return step;
        }
        if let Some(head) = self.lanes.get_mut(&OpKey::RefreshAll).and_then(VecDeque::front_mut) {
            if head.in_flight() {
                head.succeed(None, now, &mut step);
                advance_lane(&mut self.lanes, OpKey::RefreshAll, now, target, &mut step);
            }
        }
        step
    }

    /// Handles expired deadlines and due resends
    pub fn poll(&mut self, now: Instant, target: Endpoint, progress: RefreshProgress) -> Step {
        let mut step = Step::default();
        let keys: Vec<OpKey> = self.lanes.keys().cloned().collect();

        for key in keys {
            let Some(head) = self.lanes.get_mut(&key).and_then(VecDeque::front_mut) else {
                continue;
            };

            if let Some(at) = head.resend_at {
                if now >= at {
                    debug!(kind = %head.request.kind(), param = ?head.request.name(), "Resending request");
                    head.start_attempt(now, target, &mut step);
                }
                continue;
            }

            let expired = matches!(head.deadline, Some(deadline) if now >= deadline);
            if !expired {
                continue;
            }

            if head.settle_listed(now, &mut step) {
                advance_lane(&mut self.lanes, key, now, target, &mut step);
                continue;
            }

            if head.attempts_left > 0 {
                warn!(
                    kind = %head.request.kind(),
                    param = ?head.request.name(),
                    attempts_left = head.attempts_left,
                    "No reply, retrying"
                );
                head.deadline = None;
                head.resend_at = Some(now + head.retry_delay);
                if head.retry_delay.is_zero() {
                    head.start_attempt(now, target, &mut step);
                }
                continue;
            }

            let message = match key {
                OpKey::RefreshAll => match progress.total {
                    Some(total) => format!("received {} of {} parameters", progress.received, total),
                    None => "no parameters received".to_string(),
                },
                OpKey::Param(ref name) => format!("no reply for {}", name),
            };
            warn!(kind = %head.request.kind(), %message, "Operation timed out");
            head.fail(ErrorKind::OperationTimeout, message, now, &mut step);
            advance_lane(&mut self.lanes, key, now, target, &mut step);
        }
        step
    }

    /// Fails every queued and in-flight operation, leaving the table empty
    pub fn fail_all(&mut self, error: ErrorKind, message: &str, now: Instant) -> Step {
        let mut step = Step::default();
        for (_, lane) in self.lanes.drain() {
            for mut op in lane {
                op.fail(error, message, now, &mut step);
            }
        }
        step
    }
}

fn start_head(lane: &mut VecDeque<PendingOperation>, now: Instant, target: Endpoint, step: &mut Step) {
    if let Some(head) = lane.front_mut() {
        head.start_attempt(now, target, step);
    }
}

/// Drops the resolved head of a lane and starts the next operation
fn advance_lane(
    lanes: &mut HashMap<OpKey, VecDeque<PendingOperation>>,
    key: OpKey,
    now: Instant,
    target: Endpoint,
    step: &mut Step,
) {
    if let Some(lane) = lanes.get_mut(&key) {
        lane.pop_front();
        if lane.is_empty() {
            lanes.remove(&key);
        } else {
            start_head(lane, now, target, step);
        }
    }
}
