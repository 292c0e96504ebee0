//! Scheduling of (agent, task) work items onto devices.
//!
//! This module provides the device worker pool: a bounded set of workers,
//! one per device, pulling work items from a shared queue until it drains.

pub mod worker_pool;

pub use worker_pool::{DeviceWorkerPool, PoolReport, WorkError, WorkHandler, WorkItem};
