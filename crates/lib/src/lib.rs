//! shelver-lib: image build orchestration.
//!
//! This crate turns a registry of machine-image definitions into ordered
//! invocations of an external image builder:
//! - `registry`: definitions, defaults and YAML loading
//! - `resolve`: merging a definition with its defaults and `base` chain
//! - `graph`: dependency ordering over `base` references
//! - `template`: rendering a builder template into a build request
//! - `archive`: deterministic source archives for provisioning
//! - `builder`: running the external builder and extracting the artifact id
//! - `execute`: the orchestrator driving all of the above per node

pub mod archive;
pub mod artifacts;
pub mod builder;
pub mod consts;
pub mod execute;
pub mod graph;
pub mod registry;
pub mod resolve;
pub mod template;
pub mod util;
pub mod workspace;
