//! Resource-typed worker pools.
//!
//! Each pool owns a fixed set of worker tasks that pull from one shared
//! channel. How many of them may run at once is governed by a semaphore whose
//! permit count tracks the pool's current size; the scheduler loop takes a
//! permit before it dispatches, so a saturated pool keeps the task queued.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ScanError};
use crate::orchestration::config::WorkerPoolConfig;
use crate::orchestration::resources::ResourceMonitor;
use crate::orchestration::task::{ResourceType, ScanTask};

use super::executor::{TaskExecutor, TaskOutcome};

/// A free slot in one pool, held from dispatch until the task finishes.
#[derive(Debug)]
pub struct PoolSlot {
    resource_type: ResourceType,
    permit: OwnedSemaphorePermit,
}

impl PoolSlot {
    /// Pool this slot belongs to.
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }
}

struct WorkItem {
    task: Arc<ScanTask>,
    slot: PoolSlot,
}

/// Current size of every pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSizes {
    /// CPU-bound pool.
    pub cpu: usize,
    /// I/O-bound pool.
    pub io: usize,
    /// Memory-bound pool.
    pub memory: usize,
    /// Network-bound pool.
    pub network: usize,
}

impl PoolSizes {
    /// Size of the pool for `resource_type`.
    pub fn get(&self, resource_type: ResourceType) -> usize {
        match resource_type {
            ResourceType::CpuIntensive => self.cpu,
            ResourceType::IoIntensive => self.io,
            ResourceType::MemoryIntensive => self.memory,
            ResourceType::NetworkIntensive => self.network,
        }
    }

    fn set(&mut self, resource_type: ResourceType, size: usize) {
        match resource_type {
            ResourceType::CpuIntensive => self.cpu = size,
            ResourceType::IoIntensive => self.io = size,
            ResourceType::MemoryIntensive => self.memory = size,
            ResourceType::NetworkIntensive => self.network = size,
        }
    }
}

struct PoolShared {
    semaphore: Arc<Semaphore>,
    size: AtomicUsize,
    /// Permits still to be retired after a shrink, taken as slots come back.
    shrink_debt: AtomicUsize,
    active: AtomicUsize,
}

impl PoolShared {
    fn release(&self, slot: PoolSlot) {
        let retire = self
            .shrink_debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| debt.checked_sub(1))
            .is_ok();
        if retire {
            slot.permit.forget();
        }
    }

    fn resize(&self, target: usize) -> usize {
        let current = self.size.swap(target, Ordering::AcqRel);
        if target > current {
            let mut grow = target - current;
            // Cancel outstanding shrink debt before minting new permits.
            while grow > 0
                && self
                    .shrink_debt
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
                    .is_ok()
            {
                grow -= 1;
            }
            self.semaphore.add_permits(grow);
        } else if target < current {
            let shrink = current - target;
            let forgotten = self.semaphore.forget_permits(shrink);
            self.shrink_debt
                .fetch_add(shrink - forgotten, Ordering::AcqRel);
        }
        current
    }
}

struct Pool {
    shared: Arc<PoolShared>,
    tx: mpsc::UnboundedSender<WorkItem>,
}

/// One pool per [`ResourceType`], each sized from the resource monitor.
pub struct WorkerPools {
    pools: HashMap<ResourceType, Pool>,
    max_workers: usize,
}

impl fmt::Debug for WorkerPools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPools")
            .field("sizes", &self.sizes())
            .field("active", &self.active())
            .field("max_workers", &self.max_workers)
            .finish()
    }
}

impl WorkerPools {
    /// Spawns `max_workers_per_pool` workers per pool. Initial concurrency
    /// comes from `monitor.optimal_worker_count`.
    pub fn spawn(
        executor: TaskExecutor,
        monitor: &ResourceMonitor,
        config: &WorkerPoolConfig,
        results: mpsc::UnboundedSender<TaskOutcome>,
        shutdown: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let max_workers = config.max_workers_per_pool.max(1);
        let mut pools = HashMap::new();
        let mut handles = Vec::new();

        for resource_type in ResourceType::ALL {
            let size = monitor
                .optimal_worker_count(resource_type)
                .clamp(1, max_workers);
            let shared = Arc::new(PoolShared {
                semaphore: Arc::new(Semaphore::new(size)),
                size: AtomicUsize::new(size),
                shrink_debt: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
            });
            let (tx, rx) = mpsc::unbounded_channel::<WorkItem>();
            let rx = Arc::new(Mutex::new(rx));

            for index in 0..max_workers {
                let worker_id = format!("{resource_type}-w{index}");
                handles.push(tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(&rx),
                    Arc::clone(&shared),
                    executor.clone(),
                    results.clone(),
                    shutdown.clone(),
                )));
            }
            tracing::debug!(pool = %resource_type, size, workers = max_workers, "worker pool started");
            pools.insert(resource_type, Pool { shared, tx });
        }

        (Self { pools, max_workers }, handles)
    }

    /// Takes a free slot in the task's pool without waiting.
    pub fn try_reserve(&self, resource_type: ResourceType) -> Option<PoolSlot> {
        let pool = self.pools.get(&resource_type)?;
        let permit = Arc::clone(&pool.shared.semaphore)
            .try_acquire_owned()
            .ok()?;
        Some(PoolSlot {
            resource_type,
            permit,
        })
    }

    /// Hands `task` to the pool that issued `slot`.
    pub fn submit(&self, task: Arc<ScanTask>, slot: PoolSlot) -> Result<()> {
        let pool = self
            .pools
            .get(&slot.resource_type)
            .ok_or_else(|| ScanError::Internal(format!("no pool for {}", slot.resource_type)))?;
        pool.tx
            .send(WorkItem { task, slot })
            .map_err(|_| ScanError::ShuttingDown)
    }

    /// Re-sizes every pool from a fresh snapshot, within `[1, max_workers]`.
    pub fn resize(&self, monitor: &ResourceMonitor) -> PoolSizes {
        let mut sizes = PoolSizes::default();
        for (resource_type, pool) in &self.pools {
            let target = monitor
                .optimal_worker_count(*resource_type)
                .clamp(1, self.max_workers);
            let previous = pool.shared.resize(target);
            if previous != target {
                tracing::debug!(pool = %resource_type, previous, size = target, "worker pool resized");
            }
            sizes.set(*resource_type, target);
        }
        sizes
    }

    /// Current size of every pool.
    pub fn sizes(&self) -> PoolSizes {
        let mut sizes = PoolSizes::default();
        for (resource_type, pool) in &self.pools {
            sizes.set(*resource_type, pool.shared.size.load(Ordering::Acquire));
        }
        sizes
    }

    /// Tasks currently executing in each pool.
    pub fn active(&self) -> PoolSizes {
        let mut active = PoolSizes::default();
        for (resource_type, pool) in &self.pools {
            active.set(*resource_type, pool.shared.active.load(Ordering::Acquire));
        }
        active
    }
}

async fn run_worker(
    worker_id: String,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
    shared: Arc<PoolShared>,
    executor: TaskExecutor,
    results: mpsc::UnboundedSender<TaskOutcome>,
    shutdown: CancellationToken,
) {
    loop {
        let item = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                item = rx.recv() => item,
            }
        };
        let Some(WorkItem { task, slot }) = item else {
            break;
        };

        tracing::trace!(worker = %worker_id, task = %task.id, scanner = %task.scanner, "task picked up");
        shared.active.fetch_add(1, Ordering::AcqRel);
        let outcome = executor.execute(task).await;
        shared.active.fetch_sub(1, Ordering::AcqRel);
        shared.release(slot);

        if results.send(outcome).is_err() {
            break;
        }
    }
    tracing::trace!(worker = %worker_id, "worker stopped");
}
