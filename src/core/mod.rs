// src/core/mod.rs — Core iteration engine

pub mod batch;
pub mod orchestrator;
pub mod refiner;
pub mod selector;
pub mod types;
