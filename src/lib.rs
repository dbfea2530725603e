//! fleetgraph: fleet topology ingestion into a property graph.
//!
//! Agents across a fleet periodically send topology reports (hosts,
//! processes, containers, images, pods, clusters, and the network
//! endpoints they talk over). This crate folds those reports into a
//! transactional property graph, maintaining an eventually-consistent
//! map of what runs where and what talks to what.
//!
//! The entry point is [`pipeline::Pipeline`]: hand it deserialized
//! [`report::Report`]s and it takes care of per-host deduplication,
//! endpoint resolution, batch accumulation, and transactional commits.
//! Storage is pluggable at two seams: [`resolvers::KeyValueStore`] for
//! the shared endpoint-resolution cache and [`graph::GraphStore`] for
//! the graph database; in-memory implementations of both ship with the
//! crate.
//!
//! Guiding principle throughout: liveness over completeness. Every
//! internal hand-off is a bounded queue that drops and logs under
//! pressure rather than blocking, because the next report interval
//! supersedes whatever was lost.

pub mod batch;
pub mod config;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod pipeline;
pub mod prepare;
pub mod report;
pub mod resolvers;

pub use config::PipelineConfig;
pub use error::{IngestError, Result};
pub use pipeline::Pipeline;
pub use report::Report;
