//! Sandbox execution.
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`nsjail`] | Policy file, engine argument vector, process launch |
//! | [`manager`] | Orchestrates build, render and launch for one invocation |

// Orchestration layer for jail execution
pub mod manager;

pub mod nsjail;
