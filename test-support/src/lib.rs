//! Deterministic fake agents for exercising the router without a backend.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use switchyard_protocol::AgentExecutor;
use switchyard_protocol::ErrorClass;
use switchyard_protocol::Message;
use switchyard_protocol::ProbeOutcome;
use switchyard_protocol::QuotaSnapshot;
use switchyard_protocol::Response;
use tokio::sync::Mutex;

type Responder = Arc<dyn Fn(&Message) -> Response + Send + Sync>;

/// What a scripted agent does with one message.
#[derive(Clone)]
pub enum Behavior {
    Succeed(String),
    /// Succeeds and reports `units` consumed.
    SucceedWithUnits(String, u64),
    Fail { message: String, retryable: bool },
    /// Never answers in time; the caller's deadline fires first.
    Hang,
    /// Waits, then answers with the inner behavior.
    Delay(Duration, Box<Behavior>),
    /// Fails with a free-text error such as "quota exceeded, resets at 5pm".
    FailWithText(String),
    /// Succeeds but reports an exhausted structured quota.
    QuotaExhausted(QuotaSnapshot),
    Custom(Responder),
}

impl Behavior {
    pub fn succeed(result: impl Into<String>) -> Self {
        Behavior::Succeed(result.into())
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Behavior::Fail {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fail_permanently(message: impl Into<String>) -> Self {
        Behavior::Fail {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn custom(responder: impl Fn(&Message) -> Response + Send + Sync + 'static) -> Self {
        Behavior::Custom(Arc::new(responder))
    }
}

/// An [`AgentExecutor`] that follows a script, then repeats a fallback
/// behavior forever. Every call, cancellation and probe is recorded.
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    probe: Mutex<ProbeOutcome>,
    calls: Mutex<Vec<Message>>,
    cancellations: Mutex<Vec<(String, u32)>>,
}

impl ScriptedExecutor {
    pub fn always(behavior: Behavior) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: behavior,
            probe: Mutex::new(ProbeOutcome::Unsupported),
            calls: Mutex::new(Vec::new()),
            cancellations: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding(result: impl Into<String>) -> Self {
        Self::always(Behavior::succeed(result))
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::always(Behavior::fail(message))
    }

    pub fn hanging() -> Self {
        Self::always(Behavior::Hang)
    }

    /// Plays `script` in order before falling back to `then`.
    pub fn scripted(script: Vec<Behavior>, then: Behavior) -> Self {
        let executor = Self::always(then);
        Self {
            script: Mutex::new(script.into()),
            ..executor
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub async fn set_probe(&self, outcome: ProbeOutcome) {
        *self.probe.lock().await = outcome;
    }

    pub async fn calls(&self) -> Vec<Message> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    pub async fn cancellations(&self) -> Vec<(String, u32)> {
        self.cancellations.lock().await.clone()
    }

    async fn next_behavior(&self) -> Behavior {
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn invoke(&self, message: Message, _timeout: Duration) -> Response {
        self.calls.lock().await.push(message.clone());
        let mut behavior = self.next_behavior().await;
        loop {
            match behavior {
                Behavior::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    behavior = *inner;
                }
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    return Response::success(&message, "late reply");
                }
                Behavior::Succeed(result) => return Response::success(&message, result),
                Behavior::SucceedWithUnits(result, units) => {
                    return Response::success(&message, result).with_units(units);
                }
                Behavior::Fail { message: text, retryable } => {
                    let response = Response::failure(&message, ErrorClass::RemoteError, text);
                    return if retryable {
                        response
                    } else {
                        response.non_retryable()
                    };
                }
                Behavior::FailWithText(text) => {
                    return Response::failure(&message, ErrorClass::RemoteError, text);
                }
                Behavior::QuotaExhausted(quota) => {
                    return Response::success(&message, "partial work before quota").with_quota(quota);
                }
                Behavior::Custom(responder) => return responder(&message),
            }
        }
    }

    async fn probe(&self) -> ProbeOutcome {
        self.probe.lock().await.clone()
    }

    async fn cancel(&self, correlation_id: &str, retry_count: u32) {
        self.cancellations
            .lock()
            .await
            .push((correlation_id.to_string(), retry_count));
    }
}
