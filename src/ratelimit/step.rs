//! Fleet-wide quota enforcement as a pipeline step.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::pipeline::{
    Metadata, Next, PipelineRequest, PipelineResponse, PipelineStep, ResponseFinalizer,
    StreamCompletion, STATUS_SERVICE_UNAVAILABLE, STATUS_TOO_MANY_REQUESTS, TRAILER_HEADER,
};

use super::clock::{Clock, SystemClock};
use super::decision::{decide, Decision};
use super::key::QuotaKey;
use super::node::NodeIdentity;
use super::recorder::{RecordedUsage, UsageRecorder};
use super::settings::{LimiterSettings, MetricKind, StoreFailurePolicy};
use super::store::{bounded, StoreError, UsageStore};
use super::window::{http_date, Window};

/// Usage observed before the downstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSnapshot {
    /// Sum of every node's contribution
    pub aggregate: u64,
    /// This node's own contribution
    pub node: u64,
}

/// State carried from the admission phase to the recording phase of one
/// request. Never shared between requests.
#[derive(Debug, Clone)]
struct Admission {
    window: Window,
    key: QuotaKey,
    /// `None` when the store was unreachable and the policy failed open
    snapshot: Option<UsageSnapshot>,
}

/// Outcome of the admission phase.
enum Gate {
    Proceed(Admission),
    ShortCircuit(PipelineResponse),
}

/// A limiter step enforcing one quota across the fleet.
///
/// Each request computes its window and key, sums every node's contribution,
/// and is either rejected with the window end as retry-after or passed
/// downstream. Successful, measurable responses add to this node's field.
#[derive(Clone)]
pub struct QuotaStep {
    settings: LimiterSettings,
    store: Arc<dyn UsageStore>,
    recorder: UsageRecorder,
    clock: Arc<dyn Clock>,
}

impl QuotaStep {
    /// Create a step using the system clock.
    pub fn new(settings: LimiterSettings, store: Arc<dyn UsageStore>, node: NodeIdentity) -> Self {
        Self::with_clock(settings, store, node, Arc::new(SystemClock))
    }

    /// Create a step with an explicit time source.
    pub fn with_clock(
        settings: LimiterSettings,
        store: Arc<dyn UsageStore>,
        node: NodeIdentity,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let recorder =
            UsageRecorder::new(store.clone(), node).with_timeout(settings.store_timeout());
        Self {
            settings,
            store,
            recorder,
            clock,
        }
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    pub fn node(&self) -> &NodeIdentity {
        self.recorder.node()
    }

    /// Read the aggregate and this node's contribution for `key`.
    pub async fn usage(&self, key: &QuotaKey) -> std::result::Result<UsageSnapshot, StoreError> {
        let store_key = key.to_store_key();
        let timeout = self.settings.store_timeout();

        let (node, aggregate) = futures::try_join!(
            bounded(timeout, self.store.get_field(&store_key, self.node().as_str())),
            bounded(timeout, self.store.get_all_and_sum(&store_key)),
        )?;
        let node = node.unwrap_or(0);

        trace!(key = %store_key, aggregate = aggregate, node = node, "Read fleet usage");
        Ok(UsageSnapshot { aggregate, node })
    }

    /// Compute the window and key for a request and decide whether it may proceed.
    async fn admit(&self, request: &PipelineRequest) -> Result<Gate> {
        let window = Window::containing(self.clock.now(), self.settings.window());
        let key = QuotaKey::new(
            &request.pipeline,
            &self.settings,
            request.principal.as_deref(),
            &window,
        );

        let snapshot = match self.usage(&key).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => match self.settings.on_store_error() {
                StoreFailurePolicy::Propagate => return Err(e.into()),
                StoreFailurePolicy::FailOpen => {
                    warn!(
                        step = %self.settings.step_name(),
                        key = %key,
                        error = %e,
                        "Usage store unavailable, admitting request"
                    );
                    None
                }
                StoreFailurePolicy::FailClosed => {
                    warn!(
                        step = %self.settings.step_name(),
                        key = %key,
                        error = %e,
                        "Usage store unavailable, rejecting request"
                    );
                    return Ok(Gate::ShortCircuit(PipelineResponse::rejected(
                        STATUS_SERVICE_UNAVAILABLE,
                        http_date(window.end()),
                    )));
                }
            },
        };

        if let Some(snapshot) = snapshot {
            let decision = decide(
                snapshot.aggregate,
                self.settings.metric().pending_cost(),
                self.settings.limit(),
                &window,
            );

            if let Decision::Rejected { retry_after } = decision {
                debug!(
                    step = %self.settings.step_name(),
                    key = %key,
                    aggregate = snapshot.aggregate,
                    limit = self.settings.limit(),
                    "Fleet quota exceeded"
                );
                return Ok(Gate::ShortCircuit(PipelineResponse::rejected(
                    STATUS_TOO_MANY_REQUESTS,
                    http_date(retry_after),
                )));
            }
        }

        Ok(Gate::Proceed(Admission {
            window,
            key,
            snapshot,
        }))
    }

    /// Record usage for a completed call and build the remaining-quota metadata.
    async fn settle(
        &self,
        admission: &Admission,
        success: bool,
        total_tokens: Option<u64>,
    ) -> Result<Metadata> {
        let mut metadata = Metadata::new();
        if !success {
            debug!(key = %admission.key, "Downstream failed, nothing recorded");
            return Ok(metadata);
        }

        let delta = match self.settings.metric().measure(total_tokens) {
            Some(delta) => delta,
            None => {
                debug!(key = %admission.key, "No token count reported, nothing recorded");
                return Ok(metadata);
            }
        };

        let recorded = match self
            .recorder
            .record(&admission.key, delta, &admission.window)
            .await
        {
            Ok(recorded) => recorded,
            Err(e) if self.settings.on_store_error() == StoreFailurePolicy::Propagate => {
                return Err(e.into())
            }
            Err(e) => {
                warn!(key = %admission.key, error = %e, "Failed to record usage");
                return Ok(metadata);
            }
        };

        if let Some(snapshot) = admission.snapshot {
            metadata.insert(
                self.settings.metric().remaining_header().to_string(),
                remaining(self.settings.limit(), &snapshot, &recorded).to_string(),
            );
        }
        Ok(metadata)
    }
}

/// Quota left after this node's write.
fn remaining(limit: u64, before: &UsageSnapshot, recorded: &RecordedUsage) -> u64 {
    let aggregate = before
        .aggregate
        .saturating_sub(before.node)
        .saturating_add(recorded.total);
    limit.saturating_sub(aggregate)
}

#[async_trait]
impl PipelineStep for QuotaStep {
    async fn handle(&self, request: &PipelineRequest, next: Next<'_>) -> Result<PipelineResponse> {
        let admission = match self.admit(request).await? {
            Gate::Proceed(admission) => admission,
            Gate::ShortCircuit(rejection) => return Ok(rejection),
        };

        let mut response = next.run(request).await?;

        if response.streamed && self.settings.metric() == MetricKind::Tokens && response.success {
            // Token usage is only known once the body is complete.
            response.headers.insert(
                TRAILER_HEADER.to_string(),
                self.settings.metric().remaining_header().to_string(),
            );
            response.push_finalizer(Box::new(DeferredUsage {
                step: self.clone(),
                admission,
            }));
            return Ok(response);
        }

        let metadata = self
            .settle(&admission, response.success, response.total_tokens)
            .await?;
        response.headers.extend(metadata);
        Ok(response)
    }
}

/// Usage recording postponed until a streamed body has been produced.
struct DeferredUsage {
    step: QuotaStep,
    admission: Admission,
}

#[async_trait]
impl ResponseFinalizer for DeferredUsage {
    async fn finalize(self: Box<Self>, completion: &StreamCompletion) -> Result<Metadata> {
        self.step
            .settle(&self.admission, completion.success, completion.total_tokens)
            .await
    }
}
