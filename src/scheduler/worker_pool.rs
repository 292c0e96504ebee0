//! Worker pool mapping (agent, task) items onto a device set.
//!
//! Each device gets one worker task that repeatedly pulls the next item
//! from a shared queue: fast devices naturally take more items, and at
//! most one item is ever in flight per device. An item failure is caught,
//! counted and logged; it never terminates the worker. `run_all` returns
//! only after the queue is drained and every worker has observed it
//! empty.
//!
//! With a single device the items run sequentially in input order, with
//! no queue or task-spawning overhead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{error, info};

use crate::dataset::Task;
use crate::device::Device;

/// Error type surfaced by work handlers; the pool only logs it.
pub type WorkError = Box<dyn std::error::Error + Send + Sync>;

/// One unit of scheduled work: run (and/or evaluate) one task for one
/// agent.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub agent: String,
    pub task: Task,
}

impl WorkItem {
    pub fn new(agent: impl Into<String>, task: Task) -> Self {
        Self {
            agent: agent.into(),
            task,
        }
    }
}

/// Processes one work item on one device.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn process(&self, item: &WorkItem, device: &Device) -> Result<(), WorkError>;
}

/// Counts of processed and failed items after a drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub processed: u64,
    pub failed: u64,
}

struct SharedStats {
    processed: AtomicU64,
    failed: AtomicU64,
}

impl SharedStats {
    fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    fn report(&self) -> PoolReport {
        PoolReport {
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// The device worker pool.
pub struct DeviceWorkerPool;

impl DeviceWorkerPool {
    /// Processes every item across the device set and blocks until the
    /// queue drains.
    pub async fn run_all(
        items: Vec<WorkItem>,
        devices: &[Device],
        handler: Arc<dyn WorkHandler>,
    ) -> PoolReport {
        let stats = Arc::new(SharedStats::new());

        if devices.is_empty() {
            return stats.report();
        }
        if devices.len() == 1 {
            // Sequential fast path: input order, no pool machinery.
            let device = &devices[0];
            for item in &items {
                Self::process_one(handler.as_ref(), item, device, &stats).await;
            }
            return stats.report();
        }

        let queue: Arc<Mutex<VecDeque<WorkItem>>> = Arc::new(Mutex::new(items.into()));
        let mut handles = Vec::with_capacity(devices.len());
        for device in devices {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let stats = Arc::clone(&stats);
            let device = device.clone();
            handles.push(tokio::spawn(async move {
                info!(device = %device.serial, "Device worker started");
                loop {
                    let next = {
                        let mut queue = queue.lock().expect("work queue poisoned");
                        queue.pop_front()
                    };
                    let Some(item) = next else {
                        break;
                    };
                    Self::process_one(handler.as_ref(), &item, &device, &stats).await;
                }
                info!(device = %device.serial, "Device worker drained");
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Device worker panicked");
            }
        }
        stats.report()
    }

    async fn process_one(
        handler: &dyn WorkHandler,
        item: &WorkItem,
        device: &Device,
        stats: &SharedStats,
    ) {
        match handler.process(item, device).await {
            Ok(()) => {
                stats.processed.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::SeqCst);
                error!(
                    agent = %item.agent,
                    task = %item.task.task_identifier,
                    device = %device.serial,
                    error = %e,
                    "Work item failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Language;
    use std::collections::HashMap;
    use std::time::Duration;

    fn task(id: &str) -> Task {
        Task {
            task_identifier: id.to_string(),
            task_app: "App".to_string(),
            task_app_chn: String::new(),
            adb_app: String::new(),
            adb_home_page: String::new(),
            task_language: Language::English,
            task_description: "do the thing".to_string(),
            task_difficulty: 1,
            golden_steps: 2,
            key_component_final: String::new(),
            is_cross_app: "N".to_string(),
        }
    }

    struct Recorder {
        /// item key → (attempt count, device serials observed)
        seen: Mutex<HashMap<String, (u32, Vec<String>)>>,
        order: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl Recorder {
        fn new(fail_on: Option<&str>) -> Self {
            Self {
                seen: Mutex::new(HashMap::new()),
                order: Mutex::new(Vec::new()),
                fail_on: fail_on.map(str::to_string),
            }
        }
    }

    #[async_trait]
    impl WorkHandler for Recorder {
        async fn process(&self, item: &WorkItem, device: &Device) -> Result<(), WorkError> {
            {
                let mut seen = self.seen.lock().unwrap();
                let entry = seen
                    .entry(item.task.task_identifier.clone())
                    .or_insert((0, Vec::new()));
                entry.0 += 1;
                entry.1.push(device.serial.clone());
                self.order.lock().unwrap().push(item.task.task_identifier.clone());
            }
            // Uneven device speeds so work-stealing actually interleaves.
            let delay = if device.serial.ends_with("5554") { 1 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if self.fail_on.as_deref() == Some(item.task.task_identifier.as_str()) {
                return Err("synthetic failure".into());
            }
            Ok(())
        }
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| WorkItem::new("AgentX", task(&format!("task_{}", i))))
            .collect()
    }

    #[tokio::test]
    async fn test_every_item_processed_exactly_once() {
        let devices = vec![
            Device::attached("emulator-5554"),
            Device::attached("emulator-5556"),
            Device::attached("emulator-5558"),
        ];
        let handler = Arc::new(Recorder::new(None));
        let report = DeviceWorkerPool::run_all(items(9), &devices, handler.clone()).await;

        assert_eq!(report.processed, 9);
        assert_eq!(report.failed, 0);
        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 9);
        for (id, (count, _)) in seen.iter() {
            assert_eq!(*count, 1, "item {} attempted {} times", id, count);
        }
    }

    #[tokio::test]
    async fn test_item_failure_does_not_kill_worker() {
        let devices = vec![
            Device::attached("emulator-5554"),
            Device::attached("emulator-5556"),
        ];
        let handler = Arc::new(Recorder::new(Some("task_1")));
        let report = DeviceWorkerPool::run_all(items(6), &devices, handler.clone()).await;

        assert_eq!(report.processed, 5);
        assert_eq!(report.failed, 1);
        assert_eq!(handler.seen.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_single_device_runs_in_input_order() {
        let devices = vec![Device::attached("emulator-5554")];
        let handler = Arc::new(Recorder::new(None));
        DeviceWorkerPool::run_all(items(5), &devices, handler.clone()).await;

        let order = handler.order.lock().unwrap();
        let expected: Vec<String> = (0..5).map(|i| format!("task_{}", i)).collect();
        assert_eq!(*order, expected);
        // Everything ran on the only device.
        let seen = handler.seen.lock().unwrap();
        for (_, (_, serials)) in seen.iter() {
            assert_eq!(serials, &vec!["emulator-5554".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_empty_device_set_is_a_noop() {
        let handler = Arc::new(Recorder::new(None));
        let report = DeviceWorkerPool::run_all(items(3), &[], handler.clone()).await;
        assert_eq!(report, PoolReport::default());
        assert!(handler.seen.lock().unwrap().is_empty());
    }
}
