//! Error surface of the engine.
//!
//! Validation and startup problems are typed; failures inside operation
//! implementations stay [`anyhow::Error`]s, are logged, and never cascade to
//! other operations or contexts.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The dataflow is malformed. Raised at submission; the dataflow is
    /// rejected.
    #[error("invalid dataflow: {0}")]
    FlowValidation(String),

    /// A referenced operation has no implementation.
    #[error("no implementation for operation `{0}`")]
    ImplementationNotFound(String),

    /// A linked descriptor references a definition not present in its
    /// definitions table.
    #[error("`{instance}` references missing definition `{definition}`")]
    DefinitionMissing { instance: String, definition: String },

    /// An implementation declared it needs a config and none was supplied.
    #[error("operation instance `{0}` requires a config")]
    MissingConfig(String),

    /// An implementation failed to open. Aborts the entire run before any
    /// context is admitted.
    #[error("startup failed for operation instance `{instance}`")]
    Startup {
        instance: String,
        #[source]
        source: anyhow::Error,
    },

    /// The caller cancelled; surfaced per affected context handle.
    #[error("context `{0}` cancelled")]
    ContextCancelled(String),

    /// A value or dataflow could not be exported to descriptor form.
    #[error("export failed: {0}")]
    Export(String),

    /// A descriptor document could not be interpreted.
    #[error("malformed descriptor: {0}")]
    Descriptor(String),

    /// An input network invariant was violated.
    #[error("input network: {0}")]
    Network(String),
}
