//! Git-hook driven release pipeline.
//!
//! A push to the deployable branch is checked out into a private staging
//! tree, completed with submodules, persistent storage and cached
//! dependencies, then promoted to the live release by an atomic symlink swap.

pub mod config;
pub mod deps;
pub mod descriptor;
pub mod gate;
pub mod git;
pub mod lock;
pub mod paths;
pub mod pipeline;
pub mod process;
pub mod release;
pub mod report;
pub mod restart;
pub mod staging;
pub mod storage;
pub mod submodule;
pub mod swap;
pub mod types;

#[cfg(test)]
mod testutil;
