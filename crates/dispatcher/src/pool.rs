use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use yggdrasil_errors::{DispatchError, DispatchResult};

/// Per-host status snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPoolStatus {
    pub active: usize,
    pub available: usize,
    pub tasks: Vec<String>,
}

/// Per-host concurrency gates. One counting semaphore per host, sized
/// from configuration at startup; waiters are served FIFO. A slot is an
/// owned permit, so dropping it on any exit path releases the slot.
pub struct HostPool {
    semaphores: HashMap<String, Arc<Semaphore>>,
    limits: HashMap<String, usize>,
    active: Mutex<HashMap<String, Vec<String>>>,
}

impl HostPool {
    pub fn new(limits: impl IntoIterator<Item = (String, usize)>) -> Self {
        let limits: HashMap<String, usize> = limits.into_iter().collect();
        let semaphores = limits
            .iter()
            .map(|(host, limit)| (host.clone(), Arc::new(Semaphore::new(*limit))))
            .collect();
        let active = limits.keys().map(|host| (host.clone(), Vec::new())).collect();
        Self {
            semaphores,
            limits,
            active: Mutex::new(active),
        }
    }

    /// Wait for a slot on `host`. Cancel safe: dropping the future while
    /// queued gives up the place in line without consuming a permit.
    pub async fn acquire(&self, host: &str) -> DispatchResult<OwnedSemaphorePermit> {
        let semaphore = self.semaphore(host)?;
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::internal(format!("semaphore for {host} closed")))
    }

    /// Take a slot only if one is free right now. The poll loop uses this
    /// so a saturated host defers its tasks to the next poll instead of
    /// parking them out of ready-queue order.
    pub fn try_acquire(&self, host: &str) -> DispatchResult<Option<OwnedSemaphorePermit>> {
        let semaphore = self.semaphore(host)?;
        match semaphore.try_acquire_owned() {
            Ok(permit) => Ok(Some(permit)),
            Err(_) => Ok(None),
        }
    }

    fn semaphore(&self, host: &str) -> DispatchResult<Arc<Semaphore>> {
        self.semaphores
            .get(host)
            .cloned()
            .ok_or_else(|| DispatchError::internal(format!("unknown host {host}")))
    }

    pub async fn register_task(&self, host: &str, task_id: &str) {
        let mut active = self.active.lock().await;
        if let Some(tasks) = active.get_mut(host) {
            tasks.push(task_id.to_string());
        }
    }

    pub async fn unregister_task(&self, host: &str, task_id: &str) {
        let mut active = self.active.lock().await;
        if let Some(tasks) = active.get_mut(host) {
            tasks.retain(|t| t != task_id);
        }
    }

    pub async fn status(&self) -> HashMap<String, HostPoolStatus> {
        let active = self.active.lock().await;
        self.semaphores
            .iter()
            .map(|(host, semaphore)| {
                let tasks = active.get(host).cloned().unwrap_or_default();
                (
                    host.clone(),
                    HostPoolStatus {
                        active: tasks.len(),
                        available: semaphore.available_permits(),
                        tasks,
                    },
                )
            })
            .collect()
    }

    pub fn limit(&self, host: &str) -> Option<usize> {
        self.limits.get(host).copied()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let pool = Arc::new(HostPool::new([("fenrir-chat".to_string(), 2usize)]));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = Arc::clone(&pool);
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = pool.acquire("fenrir-chat").await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn permits_release_on_drop() {
        let pool = HostPool::new([("skadi-code".to_string(), 1usize)]);

        let permit = pool.try_acquire("skadi-code").unwrap();
        assert!(permit.is_some());
        assert!(pool.try_acquire("skadi-code").unwrap().is_none());

        drop(permit);
        assert!(pool.try_acquire("skadi-code").unwrap().is_some());
    }

    #[tokio::test]
    async fn waiters_are_served_fifo() {
        let pool = Arc::new(HostPool::new([("surtr-reasoning".to_string(), 1usize)]));
        let order = Arc::new(Mutex::new(Vec::new()));

        let gate = pool.acquire("surtr-reasoning").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..3 {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _permit = pool.acquire("surtr-reasoning").await.unwrap();
                order.lock().await.push(i);
            }));
            // Give each waiter time to join the queue before the next.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(gate);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn status_tracks_registered_tasks() {
        let pool = HostPool::new([("fenrir-chat".to_string(), 3usize)]);
        let _permit = pool.try_acquire("fenrir-chat").unwrap().unwrap();
        pool.register_task("fenrir-chat", "t1").await;

        let status = pool.status().await;
        let entry = &status["fenrir-chat"];
        assert_eq!(entry.active, 1);
        assert_eq!(entry.available, 2);
        assert_eq!(entry.tasks, vec!["t1".to_string()]);

        pool.unregister_task("fenrir-chat", "t1").await;
        assert_eq!(pool.status().await["fenrir-chat"].active, 0);
    }

    #[tokio::test]
    async fn unknown_host_is_an_error() {
        let pool = HostPool::new([("fenrir-chat".to_string(), 1usize)]);
        assert!(pool.acquire("loki").await.is_err());
        assert!(pool.try_acquire("loki").is_err());
    }
}
