//! Block device I/O performance monitor.
//!
//! A kernel-resident agent observes the lifecycle of block requests and a
//! user-space aggregator folds the delivered records into periodic
//! throughput, utilization, IOPS and queue-depth reports.

pub mod agent;
pub mod clock;
pub mod config;
pub mod export;
pub mod sink;
pub mod tracer;
