// Copyright (c) Abstract Machines

//! Simulation Manager - worker agent for parameter-sweep experiments
//!
//! This library pulls simulation runs from an Experiment Manager, executes them
//! with the experiment's code-base scripts, monitors them while they run and
//! uploads their results to a Storage Manager.

pub mod code_base;
pub mod config;
pub mod error;
pub mod experiment_manager;
pub mod information_service;
pub mod monitoring;
pub mod pipeline;
pub mod runtime;
pub mod service;
pub mod storage_manager;
pub mod transport;
pub mod types;
pub mod workdir;

// Re-export commonly used types
pub use config::SimulationManagerConfig;
pub use error::{Error, Result};
pub use service::SimulationManager;
pub use workdir::WorkDir;
