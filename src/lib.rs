#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;

pub mod job;
pub use job::{Job, JobBuilder, PipelineReport};

pub mod registry;
pub use registry::{ToolDescriptor, ToolKind, ToolRegistry};

pub mod analyzer;
pub use analyzer::{AnalysisResult, DependencyGraph};

pub mod scheduler;

pub mod obfuscate;

pub mod pipeline;
pub use pipeline::Pipeline;

pub use error::{BuildError, Result};
