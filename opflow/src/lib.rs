//! Compose heterogeneous computations into directed dataflow graphs and
//! execute them concurrently over many independent input contexts.
//!
//! A [`DataFlow`] names operation instances, routes values between their
//! typed ports, and seeds each context's input network. The [`Orchestrator`]
//! repeatedly matches operations against available inputs, schedules them
//! concurrently within a stage, expands fan-out outputs, and routes results
//! back into the network until every context reaches quiescence through the
//! processing, cleanup, and output stages.
//!
//! Operation bodies live behind [`OperationImplementation`] /
//! [`OperationContext`], discovered by name through a pluggable
//! [`ImplementationResolver`]; the engine hard-codes none.

pub mod error;
pub mod exec;
pub mod graph;
pub mod input;
pub mod op;
pub mod value;

pub use error::Error;
pub use exec::network::{InputNetwork, Lease, LockSet};
pub use exec::orchestrator::{ContextResult, Orchestrator, OutputMap, RunHandle};
pub use graph::dataflow::{DataFlow, DataFlowBuilder, InputFlow, Source, auto_wire};
pub use graph::definition::{Definition, RecordSpec};
pub use graph::descriptor::DataFlowDoc;
pub use graph::operation::{Operation, Stage, definitions_of};
pub use input::{Input, Parameter, ParameterSet, ParameterSetId};
pub use op::{
    ImplementationFactory, ImplementationRegistry, ImplementationResolver, OperationContext,
    OperationImplementation,
};
pub use value::Value;
