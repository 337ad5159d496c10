//! Assembles a validated [`Graph`] plus its runnable node instances.
//!
//! `GraphBuilder` is the only place the engine's various generic node
//! traits (`Source<Out>`, `ItemTransform<In,Out>`, `StreamTransform<In,Out>`,
//! `Sink<In>`) get erased into a single non-generic [`ErasedNode`] the
//! runner can drive without itself being generic over every node's types —
//! the concrete types are captured once, in the closure built at
//! `add_source`/`add_transform`/`add_sink` time, and resolved against
//! strategy/parameter/dead-letter overrides only at `build()`.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;

use crate::core::context::{Context, Parameters};
use crate::core::graph::{Edge, Graph, GraphError, NodeDecl, NodeId, NodeKind, PortId};
use crate::core::merge;
use crate::core::node::{ItemTransform, Sink, Source, StreamTransform, Transform};
use crate::core::pipe::{self, BackpressurePolicy, FanoutMode, PipeConfig, PipeConsumer};
use crate::core::wiring::PipeRegistry;
use crate::error::{ConduitError, ConduitResult};
use crate::resilience::DeadLetterSink;
use crate::strategy::{ExecutionStrategy, ParallelStrategy, ResilientStrategy, SequentialStrategy, Strategy};

/// A non-generic handle to a compiled node's driver. Not part of the public
/// API surface — callers reach nodes only through [`CompiledGraph`] and the
/// runner.
#[async_trait]
pub(crate) trait ErasedNode: Send {
    async fn run(self: Box<Self>, registry: &Arc<PipeRegistry>, ctx: &Context) -> ConduitResult<()>;
}

struct NodeBuildInputs {
    strategy: ExecutionStrategy,
    node_parameters: Option<Parameters>,
    dead_letter: Option<Box<dyn Any + Send>>,
    upstream: Vec<NodeId>,
    out_degree: usize,
    capacity: usize,
    fanout_mode: FanoutMode,
}

type NodeFactory = Box<dyn FnOnce(NodeBuildInputs) -> Box<dyn ErasedNode> + Send>;

/// The result of [`GraphBuilder::build`]: a validated topology plus the
/// boxed node drivers the runner executes, keyed by the same ids.
pub struct CompiledGraph {
    pub graph: Graph,
    pub(crate) nodes: HashMap<NodeId, Box<dyn ErasedNode>>,
}

/// Incrementally assembles a pipeline graph. `add_source`/`add_transform`/
/// `add_sink` each capture their node's concrete types immediately;
/// `with_strategy`/`with_node_parameters`/`with_pipe_capacity`/
/// `with_dead_letter_sink` may be called in any order relative to those,
/// before or after — they only take effect at [`GraphBuilder::build`].
#[derive(Default)]
pub struct GraphBuilder {
    decls: HashMap<NodeId, NodeDecl>,
    duplicate_ids: Vec<NodeId>,
    edges: Vec<Edge>,
    factories: HashMap<NodeId, NodeFactory>,
    strategies: HashMap<NodeId, ExecutionStrategy>,
    node_parameters: HashMap<NodeId, Parameters>,
    dead_letters: HashMap<NodeId, Box<dyn Any + Send>>,
    fanout_modes: HashMap<NodeId, FanoutMode>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_decl(&mut self, decl: NodeDecl) {
        if self.decls.contains_key(&decl.id) {
            self.duplicate_ids.push(decl.id.clone());
            return;
        }
        self.decls.insert(decl.id.clone(), decl);
    }

    pub fn add_source<Out>(&mut self, id: impl Into<NodeId>, source: impl Source<Out> + 'static) -> &mut Self
    where
        Out: Clone + Send + Sync + 'static,
    {
        let id: NodeId = id.into();
        self.insert_decl(NodeDecl {
            id: id.clone(),
            kind: NodeKind::Source,
            input_type: None,
            output_type: Some(TypeId::of::<Out>()),
            merge_ports: HashSet::new(),
        });

        let node_id = id.clone();
        let cell = StdMutex::new(Some(source));
        let factory: NodeFactory = Box::new(move |_inputs: NodeBuildInputs| {
            let source = cell.lock().expect("lock poisoned").take().expect("factory invoked once");
            Box::new(SourceNode::<Out, _> {
                id: node_id,
                source,
                _marker: PhantomData,
            }) as Box<dyn ErasedNode>
        });
        self.factories.insert(id, factory);
        self
    }

    pub fn add_transform<In, Out>(&mut self, id: impl Into<NodeId>, transform: Transform<In, Out>) -> &mut Self
    where
        In: Clone + Send + Sync + 'static,
        Out: Clone + Send + Sync + 'static,
    {
        let id: NodeId = id.into();
        self.insert_decl(NodeDecl {
            id: id.clone(),
            kind: NodeKind::Transform,
            input_type: Some(TypeId::of::<In>()),
            output_type: Some(TypeId::of::<Out>()),
            merge_ports: HashSet::new(),
        });

        let node_id = id.clone();
        let cell = StdMutex::new(Some(transform));
        let factory: NodeFactory = Box::new(move |inputs: NodeBuildInputs| {
            let transform = cell.lock().expect("lock poisoned").take().expect("factory invoked once");
            let dead_letter = inputs
                .dead_letter
                .and_then(|boxed| boxed.downcast::<Arc<dyn DeadLetterSink<In>>>().ok())
                .map(|boxed| *boxed);
            Box::new(TransformNode::<In, Out> {
                id: node_id,
                upstream: inputs.upstream,
                transform,
                strategy: inputs.strategy,
                node_parameters: inputs.node_parameters,
                dead_letter,
                capacity: inputs.capacity,
                fanout_mode: inputs.fanout_mode,
                out_degree: inputs.out_degree,
            }) as Box<dyn ErasedNode>
        });
        self.factories.insert(id, factory);
        self
    }

    pub fn add_sink<In>(&mut self, id: impl Into<NodeId>, sink: impl Sink<In> + 'static) -> &mut Self
    where
        In: Clone + Send + Sync + 'static,
    {
        let id: NodeId = id.into();
        self.insert_decl(NodeDecl {
            id: id.clone(),
            kind: NodeKind::Sink,
            input_type: Some(TypeId::of::<In>()),
            output_type: None,
            merge_ports: HashSet::new(),
        });

        let node_id = id.clone();
        let cell = StdMutex::new(Some(Box::new(sink) as Box<dyn Sink<In>>));
        let factory: NodeFactory = Box::new(move |inputs: NodeBuildInputs| {
            let sink = cell.lock().expect("lock poisoned").take().expect("factory invoked once");
            Box::new(SinkNode::<In> {
                id: node_id,
                upstream: inputs.upstream,
                sink,
                node_parameters: inputs.node_parameters,
            }) as Box<dyn ErasedNode>
        });
        self.factories.insert(id, factory);
        self
    }

    /// Marks the node's default input port as accepting more than one
    /// producer — without this, a second incoming edge is a `MultiProducer`
    /// build error.
    pub fn declare_merge_port(&mut self, node_id: impl Into<NodeId>) -> &mut Self {
        let node_id = node_id.into();
        if let Some(decl) = self.decls.get_mut(&node_id) {
            decl.merge_ports.insert(PortId::default());
        }
        self
    }

    pub fn connect(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> &mut Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            to_port: PortId::default(),
            pipe_capacity_override: None,
        });
        self
    }

    pub fn with_strategy(&mut self, node_id: impl Into<NodeId>, strategy: ExecutionStrategy) -> &mut Self {
        self.strategies.insert(node_id.into(), strategy);
        self
    }

    pub fn with_node_parameters(&mut self, node_id: impl Into<NodeId>, parameters: Parameters) -> &mut Self {
        self.node_parameters.insert(node_id.into(), parameters);
        self
    }

    pub fn with_fanout_mode(&mut self, node_id: impl Into<NodeId>, mode: FanoutMode) -> &mut Self {
        self.fanout_modes.insert(node_id.into(), mode);
        self
    }

    /// Overrides the buffer capacity of the pipe carried by the edge
    /// `from -> to`. A no-op if no such edge was `connect`ed.
    pub fn with_pipe_capacity(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>, capacity: usize) -> &mut Self {
        let from = from.into();
        let to = to.into();
        for edge in self.edges.iter_mut() {
            if edge.from == from && edge.to == to {
                edge.pipe_capacity_override = Some(capacity);
            }
        }
        self
    }

    /// Registers a dead-letter sink for a [`ExecutionStrategy::Resilient`]
    /// transform. May be called before or after `add_transform` for the
    /// same id.
    pub fn with_dead_letter_sink<In: Send + Sync + 'static>(
        &mut self,
        node_id: impl Into<NodeId>,
        sink: Arc<dyn DeadLetterSink<In>>,
    ) -> &mut Self {
        self.dead_letters.insert(node_id.into(), Box::new(sink));
        self
    }

    /// Validates the accumulated declarations and edges, then resolves
    /// every node's overrides into a runnable [`CompiledGraph`]. Returns
    /// the first violation class encountered, per the checks' order below.
    pub fn build(mut self) -> Result<CompiledGraph, GraphError> {
        if let Some(dup) = self.duplicate_ids.first() {
            return Err(GraphError::DuplicateId(dup.to_string()));
        }
        for edge in &self.edges {
            if !self.decls.contains_key(&edge.from) {
                return Err(GraphError::UnknownId(edge.from.to_string()));
            }
            if !self.decls.contains_key(&edge.to) {
                return Err(GraphError::UnknownId(edge.to.to_string()));
            }
        }

        let mut producer_counts: HashMap<(NodeId, PortId), usize> = HashMap::new();
        for edge in &self.edges {
            *producer_counts.entry((edge.to.clone(), edge.to_port.clone())).or_insert(0) += 1;
        }
        for ((to, port), count) in &producer_counts {
            if *count > 1 {
                let decl = self.decls.get(to).expect("validated above");
                if !decl.merge_ports.contains(port) {
                    return Err(GraphError::MultiProducer {
                        to: to.to_string(),
                        port: port.to_string(),
                    });
                }
            }
        }

        for edge in &self.edges {
            let from_decl = self.decls.get(&edge.from).expect("validated above");
            let to_decl = self.decls.get(&edge.to).expect("validated above");
            if from_decl.output_type != to_decl.input_type {
                return Err(GraphError::TypeMismatch {
                    from: edge.from.to_string(),
                    to: edge.to.to_string(),
                    port: edge.to_port.to_string(),
                });
            }
        }

        for decl in self.decls.values() {
            let has_incoming = self.edges.iter().any(|e| e.to == decl.id);
            let has_outgoing = self.edges.iter().any(|e| e.from == decl.id);
            match decl.kind {
                NodeKind::Source if !has_outgoing => {
                    return Err(GraphError::OrphanSource(decl.id.to_string()));
                }
                NodeKind::Sink if !has_incoming => {
                    return Err(GraphError::OrphanSink(decl.id.to_string()));
                }
                NodeKind::Transform if !has_incoming => {
                    return Err(GraphError::OrphanTransform(decl.id.to_string(), "an incoming edge"));
                }
                NodeKind::Transform if !has_outgoing => {
                    return Err(GraphError::OrphanTransform(decl.id.to_string(), "an outgoing edge"));
                }
                _ => {}
            }
        }

        let graph = Graph {
            nodes: self.decls.clone(),
            edges: self.edges.clone(),
        };

        let order = graph.reverse_topological_order();
        if order.len() != graph.nodes.len() {
            let mut missing: Vec<String> = graph
                .nodes
                .keys()
                .filter(|id| !order.contains(id))
                .map(|id| id.to_string())
                .collect();
            missing.sort();
            return Err(GraphError::Cycle(missing));
        }

        let mut upstream_of: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut out_degree: HashMap<NodeId, usize> = HashMap::new();
        for edge in &self.edges {
            upstream_of.entry(edge.to.clone()).or_default().push(edge.from.clone());
            *out_degree.entry(edge.from.clone()).or_insert(0) += 1;
        }

        let mut nodes: HashMap<NodeId, Box<dyn ErasedNode>> = HashMap::new();
        for (id, factory) in self.factories.drain() {
            let capacity = self
                .edges
                .iter()
                .filter(|e| e.from == id)
                .filter_map(|e| e.pipe_capacity_override)
                .max()
                .unwrap_or(PipeConfig::default().capacity);

            let inputs = NodeBuildInputs {
                strategy: self
                    .strategies
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(ExecutionStrategy::default_for_item_transform),
                node_parameters: self.node_parameters.get(&id).cloned(),
                dead_letter: self.dead_letters.remove(&id),
                upstream: upstream_of.get(&id).cloned().unwrap_or_default(),
                out_degree: *out_degree.get(&id).unwrap_or(&0),
                capacity,
                fanout_mode: self.fanout_modes.get(&id).copied().unwrap_or_default(),
            };
            nodes.insert(id, factory(inputs));
        }

        Ok(CompiledGraph { graph, nodes })
    }
}

async fn resolve_input<In: Clone + Send + Sync + 'static>(
    upstream: &[NodeId],
    registry: &Arc<PipeRegistry>,
    ctx: &Context,
) -> ConduitResult<PipeConsumer<In>> {
    match upstream {
        [] => Err(ConduitError::DataflowFault("node has no upstream producer".into())),
        [only] => registry.subscribe::<In>(only).await,
        many => {
            let consumers =
                futures::future::try_join_all(many.iter().map(|id| registry.subscribe::<In>(id))).await?;
            let merged = merge::merge(consumers, merge::MergeMode::OrderedByArrival, ctx);
            merged.subscribe()
        }
    }
}

fn build_strategy<In, Out>(
    tag: &ExecutionStrategy,
    parameters: &Parameters,
    dead_letter: Option<Arc<dyn DeadLetterSink<In>>>,
) -> Arc<dyn Strategy<In, Out>>
where
    In: Clone + Send + 'static,
    Out: Clone + Send + 'static,
{
    match tag {
        ExecutionStrategy::Sequential => Arc::new(SequentialStrategy),
        ExecutionStrategy::Parallel => Arc::new(ParallelStrategy::from_parameters(parameters)),
        ExecutionStrategy::Resilient(_) => {
            let mut resilient = ResilientStrategy::from_parameters(parameters);
            if let Some(dlq) = dead_letter {
                resilient = resilient.with_dead_letter_sink(dlq);
            }
            Arc::new(resilient)
        }
        ExecutionStrategy::Batching | ExecutionStrategy::Unbatching => {
            tracing::warn!(
                "batching/unbatching strategy tags apply to stream-transform nodes, not item bodies; \
                 falling back to sequential for this item-transform"
            );
            Arc::new(SequentialStrategy)
        }
    }
}

struct SourceNode<Out, S> {
    id: NodeId,
    source: S,
    _marker: PhantomData<fn() -> Out>,
}

#[async_trait]
impl<Out, S> ErasedNode for SourceNode<Out, S>
where
    Out: Clone + Send + Sync + 'static,
    S: Source<Out> + 'static,
{
    async fn run(mut self: Box<Self>, registry: &Arc<PipeRegistry>, ctx: &Context) -> ConduitResult<()> {
        let node_ctx = ctx.for_node(self.id.as_str(), None);
        match self.source.initialize(&node_ctx).await {
            Ok(pipe) => {
                registry.publish(&self.id, pipe);
                self.source.dispose().await;
                Ok(())
            }
            Err(e) => {
                node_ctx.error_sink().report(self.id.as_str(), &e);
                registry.publish_failure(&self.id, e.clone());
                Err(e)
            }
        }
    }
}

struct TransformNode<In, Out> {
    id: NodeId,
    upstream: Vec<NodeId>,
    transform: Transform<In, Out>,
    strategy: ExecutionStrategy,
    node_parameters: Option<Parameters>,
    dead_letter: Option<Arc<dyn DeadLetterSink<In>>>,
    capacity: usize,
    fanout_mode: FanoutMode,
    out_degree: usize,
}

#[async_trait]
impl<In, Out> ErasedNode for TransformNode<In, Out>
where
    In: Clone + Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    async fn run(mut self: Box<Self>, registry: &Arc<PipeRegistry>, ctx: &Context) -> ConduitResult<()> {
        let node_ctx = ctx.for_node(self.id.as_str(), self.node_parameters.as_ref());
        let consumer = match resolve_input::<In>(&self.upstream, registry, &node_ctx).await {
            Ok(c) => c,
            Err(e) => {
                registry.publish_failure(&self.id, e.clone());
                node_ctx.error_sink().report(self.id.as_str(), &e);
                return Err(e);
            }
        };

        let config = PipeConfig {
            capacity: self.capacity,
            backpressure: BackpressurePolicy::Wait,
            fanout_mode: self.fanout_mode,
            max_consumers: if self.out_degree <= 1 { Some(1) } else { None },
        };

        match self.transform {
            Transform::Item(body) => {
                let (out_tx, out_pipe) = pipe::channel::<Out>(config);
                let body: Arc<dyn ItemTransform<In, Out>> = Arc::from(body);
                let strategy = build_strategy::<In, Out>(&self.strategy, node_ctx.parameters(), self.dead_letter.clone());
                registry.publish(&self.id, out_pipe);
                let result = strategy.drive(consumer, out_tx, Arc::clone(&body), node_ctx.clone()).await;
                body.dispose(&node_ctx).await;
                if let Err(e) = &result {
                    node_ctx.error_sink().report(self.id.as_str(), e);
                }
                result
            }
            Transform::Stream(mut body) => match body.drive(consumer, &node_ctx, node_ctx.cancellation()).await {
                Ok(out_pipe) => {
                    registry.publish(&self.id, out_pipe);
                    body.dispose().await;
                    Ok(())
                }
                Err(e) => {
                    registry.publish_failure(&self.id, e.clone());
                    node_ctx.error_sink().report(self.id.as_str(), &e);
                    Err(e)
                }
            },
        }
    }
}

struct SinkNode<In> {
    id: NodeId,
    upstream: Vec<NodeId>,
    sink: Box<dyn Sink<In>>,
    node_parameters: Option<Parameters>,
}

#[async_trait]
impl<In> ErasedNode for SinkNode<In>
where
    In: Clone + Send + Sync + 'static,
{
    async fn run(mut self: Box<Self>, registry: &Arc<PipeRegistry>, ctx: &Context) -> ConduitResult<()> {
        let node_ctx = ctx.for_node(self.id.as_str(), self.node_parameters.as_ref());
        let consumer = match resolve_input::<In>(&self.upstream, registry, &node_ctx).await {
            Ok(c) => c,
            Err(e) => {
                node_ctx.error_sink().report(self.id.as_str(), &e);
                return Err(e);
            }
        };

        let result = self.sink.execute(consumer, &node_ctx).await;
        match &result {
            Ok(()) => self.sink.dispose().await,
            Err(e) => node_ctx.error_sink().report(self.id.as_str(), e),
        }
        result
    }
}
