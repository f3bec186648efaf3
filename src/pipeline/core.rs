use std::sync::Arc;

use tracing::{debug, error};

use crate::error::ProcessError;
use crate::http::context::{RequestContext, ResponseContext};
use crate::http::exception::ExceptionProcessor;

/// Outcome of a processor stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Proceed to the next configured stage.
    Continue,
    /// Stop the pipeline without an error (the response is complete).
    Halt,
}

/// A reusable, independently configured pipeline stage.
///
/// Processors are crafted once per server build and shared across all
/// concurrent requests; request-scoped data belongs on the context pair, not
/// on the processor. The only sanctioned processor-held mutable state is a
/// name-keyed, process-lifetime store (e.g. the CSRF token store).
pub trait Processor: Send + Sync {
    /// Stage name, used in logs.
    fn name(&self) -> &str;

    /// Process one request. Mutates the shared context pair and either
    /// continues, halts, or fails into the exception stage.
    fn process(
        &self,
        req: &mut RequestContext,
        res: &mut ResponseContext,
    ) -> Result<Flow, ProcessError>;
}

/// An ordered chain of processors with a terminal exception stage.
///
/// Stages execute strictly in configured order; one stage's completion
/// precedes the next stage's start. An error from any stage is routed to the
/// exception stage and ends the run.
pub struct Pipeline {
    stages: Vec<Arc<dyn Processor>>,
    exception: Arc<ExceptionProcessor>,
}

impl Pipeline {
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Run every configured stage against the context pair.
    pub fn run(&self, req: &mut RequestContext, res: &mut ResponseContext) {
        for stage in &self.stages {
            match stage.process(req, res) {
                Ok(Flow::Continue) => {
                    debug!(stage = stage.name(), "stage complete");
                }
                Ok(Flow::Halt) => {
                    debug!(stage = stage.name(), "stage halted pipeline");
                    return;
                }
                Err(e) => {
                    error!(stage = stage.name(), error = %e, "stage failed");
                    self.exception.handle(&e, req, res);
                    return;
                }
            }
        }
    }

    /// Route an error raised outside the stage sequence (e.g. an interceptor
    /// veto) through the exception stage.
    pub fn fail(&self, err: &ProcessError, req: &mut RequestContext, res: &mut ResponseContext) {
        self.exception.handle(err, req, res);
    }

    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

/// Builder assembling the stage order for a [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Processor>>,
    exception: Option<Arc<ExceptionProcessor>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage; stages run in the order they are added.
    pub fn stage(mut self, processor: Arc<dyn Processor>) -> Self {
        self.stages.push(processor);
        self
    }

    /// Install the terminal exception stage (a default one is used otherwise).
    pub fn exception(mut self, processor: Arc<ExceptionProcessor>) -> Self {
        self.exception = Some(processor);
        self
    }

    #[must_use]
    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
            exception: self
                .exception
                .unwrap_or_else(|| Arc::new(ExceptionProcessor::builder().build())),
        }
    }
}
