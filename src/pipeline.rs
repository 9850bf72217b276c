//! Request pipeline contract consumed by limiter steps.
//!
//! A pipeline is an ordered list of steps in front of a terminal downstream
//! call. Each step receives the request and a `Next` continuation for the rest
//! of the pipeline. Streamed responses finish in a second phase: steps that
//! can only report once the body is complete register a `ResponseFinalizer`,
//! and the transport calls `PipelineResponse::finish` when the body is done.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// Response metadata, keyed by lowercase field name.
pub type Metadata = BTreeMap<String, String>;

/// HTTP-equivalent status for a request rejected by quota.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;
/// HTTP-equivalent status for a request rejected because quota state is unreachable.
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

/// Header announcing fields that will arrive as trailing metadata.
pub const TRAILER_HEADER: &str = "trailer";
/// Header telling a rejected client when to come back.
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// A request travelling through the pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    /// Name of the pipeline handling the request
    pub pipeline: String,
    /// Caller identity, already resolved by the transport
    pub principal: Option<String>,
    /// Opaque call details for downstream steps
    pub metadata: Metadata,
}

impl PipelineRequest {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            ..Default::default()
        }
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }
}

/// Usage information available once a streamed body has been fully produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCompletion {
    /// Whether the stream completed successfully
    pub success: bool,
    /// Tokens consumed by the whole stream, if the downstream reported them
    pub total_tokens: Option<u64>,
}

/// Deferred work run once a streamed response is complete.
///
/// Returns metadata to append as trailers.
#[async_trait]
pub trait ResponseFinalizer: Send {
    async fn finalize(self: Box<Self>, completion: &StreamCompletion) -> Result<Metadata>;
}

/// A response travelling back up the pipeline.
pub struct PipelineResponse {
    /// HTTP-equivalent status code
    pub status: u16,
    /// Whether the downstream call succeeded
    pub success: bool,
    /// Tokens consumed, when known up front
    pub total_tokens: Option<u64>,
    /// Whether the body is still being produced
    pub streamed: bool,
    /// Leading metadata
    pub headers: Metadata,
    /// Trailing metadata
    pub trailers: Metadata,
    finalizers: Vec<Box<dyn ResponseFinalizer>>,
}

impl PipelineResponse {
    /// A successful, fully buffered response.
    pub fn ok(total_tokens: Option<u64>) -> Self {
        Self {
            status: 200,
            success: true,
            total_tokens,
            streamed: false,
            headers: Metadata::new(),
            trailers: Metadata::new(),
            finalizers: Vec::new(),
        }
    }

    /// A successful response whose body is still streaming.
    pub fn streaming() -> Self {
        Self {
            streamed: true,
            ..Self::ok(None)
        }
    }

    /// A failed downstream response.
    pub fn failed(status: u16) -> Self {
        Self {
            status,
            success: false,
            ..Self::ok(None)
        }
    }

    /// A response short-circuited by a step before reaching downstream.
    pub fn rejected(status: u16, retry_after: String) -> Self {
        let mut response = Self::failed(status);
        response
            .headers
            .insert(RETRY_AFTER_HEADER.to_string(), retry_after);
        response
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn trailer(&self, name: &str) -> Option<&str> {
        self.trailers.get(name).map(String::as_str)
    }

    /// Register work to run once the streamed body is complete.
    pub fn push_finalizer(&mut self, finalizer: Box<dyn ResponseFinalizer>) {
        self.finalizers.push(finalizer);
    }

    /// Number of finalizers still pending.
    pub fn pending_finalizers(&self) -> usize {
        self.finalizers.len()
    }

    /// Run every registered finalizer and collect the trailers.
    ///
    /// Called by the transport after the last body chunk. Finalizers run in
    /// registration order and every one of them runs even if an earlier one
    /// failed; the first error is returned once all have finished.
    pub async fn finish(&mut self, completion: StreamCompletion) -> Result<&Metadata> {
        let mut first_error = None;
        for finalizer in std::mem::take(&mut self.finalizers) {
            match finalizer.finalize(&completion).await {
                Ok(trailers) => self.trailers.extend(trailers),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(&self.trailers),
        }
    }
}

impl fmt::Debug for PipelineResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineResponse")
            .field("status", &self.status)
            .field("success", &self.success)
            .field("total_tokens", &self.total_tokens)
            .field("streamed", &self.streamed)
            .field("headers", &self.headers)
            .field("trailers", &self.trailers)
            .field("finalizers", &self.finalizers.len())
            .finish()
    }
}

/// The terminal call at the end of a pipeline.
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn call(&self, request: &PipelineRequest) -> Result<PipelineResponse>;
}

/// A step wrapping the remainder of the pipeline.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    async fn handle(&self, request: &PipelineRequest, next: Next<'_>) -> Result<PipelineResponse>;
}

/// Continuation running the rest of the pipeline.
pub struct Next<'a> {
    steps: &'a [Arc<dyn PipelineStep>],
    terminal: &'a dyn Downstream,
}

impl<'a> Next<'a> {
    pub fn new(steps: &'a [Arc<dyn PipelineStep>], terminal: &'a dyn Downstream) -> Self {
        Self { steps, terminal }
    }

    /// Invoke the next step, or the downstream once all steps ran.
    pub async fn run(self, request: &PipelineRequest) -> Result<PipelineResponse> {
        match self.steps.split_first() {
            Some((step, rest)) => step.handle(request, Next::new(rest, self.terminal)).await,
            None => self.terminal.call(request).await,
        }
    }
}

/// Ordered steps in front of a downstream.
pub struct Pipeline {
    steps: Vec<Arc<dyn PipelineStep>>,
    terminal: Arc<dyn Downstream>,
}

impl Pipeline {
    pub fn new(terminal: Arc<dyn Downstream>) -> Self {
        Self {
            steps: Vec::new(),
            terminal,
        }
    }

    /// Append a step; steps run in the order they were added.
    pub fn with_step(mut self, step: Arc<dyn PipelineStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub async fn execute(&self, request: &PipelineRequest) -> Result<PipelineResponse> {
        Next::new(&self.steps, self.terminal.as_ref()).run(request).await
    }
}
