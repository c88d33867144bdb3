//! Autonomous task-solving engine.
//!
//! This crate implements the per-task half of the system: a verification-gated
//! orchestration loop that drives an inference-backed actor against an isolated
//! workspace. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (decomposition, ledger summaries,
//!   action parsing, verdict types, scoring, parameter guardrails). No I/O,
//!   fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (child processes, the inference
//!   provider, the docker-backed verifier, workspace copies). Isolated to
//!   enable scripting in tests.
//!
//! Orchestration modules ([`orchestrator`], [`sampler`], [`prompt`]) coordinate
//! core logic with I/O to implement a single task attempt. The slower
//! configuration-evolution loop lives in the `evolve` crate.

pub mod cancel;
pub mod core;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod prompt;
pub mod sampler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
