#![allow(dead_code)]

//! `conduit` — a streaming pipeline execution engine: a DAG of typed
//! nodes connected by back-pressured pipes, driven by pluggable execution
//! strategies, with a resilience layer (retry/backoff/jitter/circuit
//! breaker/dead-letter) available to any node that wants it.
//!
//! Build a graph with [`GraphBuilder`], compile it, and hand the result to
//! [`runner::run`]:
//!
//! ```ignore
//! let mut builder = GraphBuilder::new();
//! builder
//!     .add_source("numbers", MySource)
//!     .add_transform("double", Transform::Item(Box::new(Double)))
//!     .add_sink("print", MySink)
//!     .connect("numbers", "double")
//!     .connect("double", "print");
//!
//! let compiled = builder.build()?;
//! let outcome = conduit::runner::run(compiled, Context::new(Parameters::new())).await;
//! assert!(outcome.is_success());
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod params;
pub mod resilience;
pub mod runner;
pub mod strategy;

pub use core::builder::{CompiledGraph, GraphBuilder};
pub use core::context::{Context, ErrorSink, Parameters, SharedState};
pub use core::graph::{Edge, Graph, GraphError, NodeDecl, NodeId, NodeKind, PortId};
pub use core::node::{ItemTransform, Sink, Source, StreamTransform, Transform};
pub use core::pipe::{
    BackpressurePolicy, FanoutMode, Pipe, PipeConfig, PipeConsumer, PipeProducer, PipeSignal,
    Terminal,
};
pub use error::{ConduitError, ConduitResult};
pub use runner::{NodeOutcome, RunOutcome};
pub use strategy::{ExecutionStrategy, Strategy};
