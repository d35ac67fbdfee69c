//! tickerd: run one external command on a fixed interval from a daemon
//! guarded by a PID lock file, logging to a size-rotated file.

pub mod app;
pub mod config;
pub mod daemon;
pub mod logging;
pub mod runner;
pub mod supervisor;
