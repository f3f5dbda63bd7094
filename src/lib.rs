// src/lib.rs — Library root for imgrefine

pub mod cli;
pub mod core;
pub mod evaluator;
pub mod infra;
pub mod learner;
pub mod memory;
pub mod provider;
