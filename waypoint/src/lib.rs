//! Plan-execute-replan engine for tool-using agent sessions.
//!
//! A mission is planned into a dependency-ordered task list, executed one
//! oracle-chosen action at a time, and structurally replanned when tasks
//! fail. Sessions are durable: every step persists under optimistic
//! concurrency, and suspensions (clarification questions, approval gates)
//! are plain state in the stored document. The architecture enforces a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (eligibility, dependency
//!   validation, budgets). No I/O, fully testable in isolation.
//! - **I/O and side effects** ([`store`], [`events`], [`process`],
//!   [`memory`], [`config`]): isolated behind small seams to enable test
//!   doubles.
//!
//! Orchestration modules ([`looping`], [`session`], [`planner`],
//! [`replan`]) coordinate core logic with the oracle and tools.

pub mod approval;
pub mod config;
pub mod core;
pub mod events;
pub mod exit_codes;
pub mod logging;
pub mod looping;
pub mod memory;
pub mod oracle;
pub mod planner;
pub mod process;
pub mod prompt;
pub mod replan;
pub mod session;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
