//! Ordered set of live vCPUs with a generation counter for cheap derived-value caching.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::cpu::{CpuIndex, Vcpu};

#[derive(Debug, Default)]
struct RosterInner {
    /// Insertion order. Indices are handed out monotonically, so this is also index order.
    cpus: Vec<Arc<Vcpu>>,
    next_index: CpuIndex,
}

/// The CPU list (`CPU_FOREACH`) plus its generation id.
///
/// Membership changes happen under the roster lock and bump the generation before the lock is
/// released. The generation can be read without the lock.
#[derive(Debug, Default)]
pub struct Roster {
    inner: Mutex<RosterInner>,
    generation: AtomicU64,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RosterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Append a new CPU in the stopped state and return it.
    pub fn add(&self, reset_pc: u64) -> Arc<Vcpu> {
        let mut inner = self.lock();
        let index = inner.next_index;
        inner.next_index += 1;
        let cpu = Arc::new(Vcpu::new(index, reset_pc));
        inner.cpus.push(cpu.clone());
        self.generation.fetch_add(1, Ordering::AcqRel);
        cpu
    }

    /// Remove a CPU from the roster. The returned context stays valid for holders of an `Arc`.
    pub fn remove(&self, index: CpuIndex) -> Option<Arc<Vcpu>> {
        let mut inner = self.lock();
        let pos = inner.cpus.iter().position(|cpu| cpu.index() == index)?;
        let cpu = inner.cpus.remove(pos);
        self.generation.fetch_add(1, Ordering::AcqRel);
        Some(cpu)
    }

    pub fn get(&self, index: CpuIndex) -> Option<Arc<Vcpu>> {
        self.lock()
            .cpus
            .iter()
            .find(|cpu| cpu.index() == index)
            .cloned()
    }

    pub fn first(&self) -> Option<Arc<Vcpu>> {
        self.lock().cpus.first().cloned()
    }

    /// The CPU following `index` in roster order (`CPU_NEXT`).
    ///
    /// Works even if `index` itself has been removed in the meantime: the successor is the first
    /// live CPU with a larger index.
    pub fn next_after(&self, index: CpuIndex) -> Option<Arc<Vcpu>> {
        self.lock()
            .cpus
            .iter()
            .find(|cpu| cpu.index() > index)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().cpus.is_empty()
    }

    /// Consistent copy of the membership in roster order.
    pub fn snapshot(&self) -> Vec<Arc<Vcpu>> {
        self.lock().cpus.clone()
    }

    /// Visit every CPU in roster order.
    ///
    /// Iterates over a snapshot so `f` may itself mutate the roster.
    pub fn for_each_cpu(&self, mut f: impl FnMut(&Arc<Vcpu>)) {
        for cpu in self.snapshot() {
            f(&cpu);
        }
    }

    /// Count members while holding the roster lock. Returns the generation the count belongs to.
    fn count_locked(&self) -> (u64, usize) {
        let inner = self.lock();
        (self.generation(), inner.cpus.len())
    }
}

/// Cached live-CPU count keyed by roster generation (`rr_cpu_count`).
#[derive(Debug, Clone)]
pub struct CpuCountCache {
    generation: u64,
    count: usize,
}

impl Default for CpuCountCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuCountCache {
    pub fn new() -> Self {
        Self {
            generation: u64::MAX,
            count: 0,
        }
    }

    pub fn count(&mut self, roster: &Roster) -> usize {
        if roster.generation() != self.generation {
            let (generation, count) = roster.count_locked();
            self.generation = generation;
            self.count = count;
        }
        self.count
    }
}
