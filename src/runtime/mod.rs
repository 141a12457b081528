//! Execution of the experiment's code-base scripts.

pub mod scripts;

pub use scripts::{Script, ScriptRunner};
