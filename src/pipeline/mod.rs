//! Processor chain primitives.
//!
//! Every inbound HTTP request passes through an ordered [`Pipeline`] of
//! [`Processor`] stages (parsing, cookies, CSRF, routing, output shaping),
//! terminated by the exception stage. Stages share a per-request context pair
//! and may short-circuit via [`Flow::Halt`].

mod core;

pub use core::{Flow, Pipeline, PipelineBuilder, Processor};
