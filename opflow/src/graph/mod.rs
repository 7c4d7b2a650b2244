//! Static layer: typed ports, operation descriptors, dataflow graphs, and
//! their wire form.

pub mod dataflow;
pub mod definition;
pub mod descriptor;
pub mod operation;

pub use dataflow::{DataFlow, DataFlowBuilder, InputFlow, Source, auto_wire};
pub use definition::{Definition, RecordSpec};
pub use descriptor::DataFlowDoc;
pub use operation::{Operation, Stage, definitions_of};
