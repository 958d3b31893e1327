//! Worker 并发调度
//!
//! 一个 Act 阶段内可能同时派发多个 Worker；用 Semaphore 限制同时在途的调用数。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 并发许可池；克隆后共享同一个 Semaphore
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent_workers: usize) -> Self {
        let capacity = max_concurrent_workers.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// 等待一个执行许可；Semaphore 已关闭时返回 None
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.slots.clone().acquire_owned().await.ok()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_are_bounded() {
        let scheduler = TaskScheduler::new(2);
        let a = scheduler.acquire().await.unwrap();
        let _b = scheduler.acquire().await.unwrap();
        assert_eq!(scheduler.available(), 0);
        drop(a);
        assert_eq!(scheduler.available(), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(TaskScheduler::new(0).capacity(), 1);
    }
}
