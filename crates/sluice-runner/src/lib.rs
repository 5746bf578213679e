//! Execution layer for containerized data connectors.
//!
//! A [`Runner`] spawns one connector command (`spec`, `check`, `discover`
//! or `read`) through an [`ImageRuntime`], feeds the connector its
//! configuration as mounted files, and parses the line-oriented protocol it
//! prints on stdout. Single-result commands go through
//! [`SynchronousParser`]; `read` streams through [`AsynchronousParser`]
//! into a [`DataConsumer`].

pub mod container;
pub mod error;
pub mod materialize;
pub mod parser;
pub mod representation;
pub mod runner;
pub mod settings;
pub mod task;

pub use container::{ContainerError, ContainerRuntime, ImageRuntime, RuntimeType};
pub use error::{RunnerError, RunnerResult};
pub use materialize::{ConfigArtifact, MaterializeError, materialize};
pub use parser::{AsynchronousParser, ReadSummary, SynchronousParser};
pub use representation::{StreamRepresentation, StreamRepresentations, TransformError};
pub use runner::{CloseReason, Runner, RunnerBuilder, Timeouts};
pub use settings::Settings;
pub use task::{DataConsumer, LogTaskLogger, TaskCloser, TaskLogger};

pub use sluice_protocol as protocol;
