// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # colonel
//!
//! The agent command-execution core: lets a language model propose actions
//! against live infrastructure, gates every proposal through a capability
//! policy, executes what is allowed, and records every attempt.
//!
//! ## Architecture
//!
//! - **Skill registry** (`skills`): declarative skill definitions resolved at
//!   load time into typed action descriptors bound to capabilities
//! - **Capability policy** (`policy`): absolute blocklist → write gate →
//!   confirmation gate → allow; pure and deterministic
//! - **Executor** (`executor`): schema validation, global concurrency limit,
//!   per-action deadline, at-most-once invocation
//! - **Audit** (`audit`): one immutable entry per attempt, bounded-retry sink
//! - **Sessions** (`session`): one actor per session driving model turns and
//!   the propose/confirm handshake
//!
//! ## Library usage
//!
//! ```no_run
//! use colonel::policy::PolicyEngine;
//! use colonel::skills::{BoundParams, Registry, capability::CapabilityBindings};
//! use colonel::skills::loader::SkillSource;
//!
//! let source = SkillSource::markdown("pg.skill.md", std::fs::read_to_string("pg.skill.md").unwrap());
//! let registry = Registry::load(&[source], &CapabilityBindings::new()).unwrap();
//! let action = registry.lookup("postgres", "query").unwrap();
//! let config = colonel::config::ColonelConfig::default();
//! let catalog = config.models.catalog().unwrap();
//! let verdict = PolicyEngine::new().evaluate(
//!     &action,
//!     catalog.default_profile(),
//!     &BoundParams::default().with("sql", "DROP TABLE users"),
//! );
//! assert!(verdict.is_deny());
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod executor;
pub mod model;
pub mod policy;
pub mod prompt;
pub mod session;
pub mod skills;
