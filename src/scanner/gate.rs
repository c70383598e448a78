//! Bounded-concurrency gates. Each gate is a named counting semaphore; the permit
//! is held only for the duration of the wrapped future and dropped on every exit path.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct Gate {
    name: &'static str,
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

impl Gate {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run `fut` while holding one permit
    pub async fn run<F: Future>(&self, fut: F) -> F::Output {
        if self.semaphore.available_permits() == 0 {
            trace!(gate = self.name, capacity = self.capacity, "Gate full, waiting for a permit");
        }
        // The semaphore is never closed, so acquire only fails if it were.
        let _permit = self.semaphore.acquire().await.ok();
        fut.await
    }
}

/// Every gate the engine uses
#[derive(Debug, Clone)]
pub struct Gates {
    pub host: Gate,
    pub port: Gate,
    pub http: Gate,
    pub soap: Gate,
    pub onvif_rtsp: Gate,
    pub rtsp: Gate,
    pub dns: Gate,
    pub warmup: Gate,
}

impl Gates {
    pub fn new() -> Self {
        Self {
            host: Gate::new("host", 64),
            port: Gate::new("port", 128),
            http: Gate::new("http", 8),
            soap: Gate::new("soap", 8),
            onvif_rtsp: Gate::new("onvif_rtsp", 4),
            rtsp: Gate::new("rtsp", 4),
            dns: Gate::new("dns", 16),
            warmup: Gate::new("arp_warmup", 64),
        }
    }
}

impl Default for Gates {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_gates_default_capacities() {
        let gates = Gates::default();
        assert_eq!(gates.host.capacity(), 64);
        assert_eq!(gates.port.capacity(), 128);
        assert_eq!(gates.http.capacity(), 8);
        assert_eq!(gates.soap.capacity(), 8);
        assert_eq!(gates.onvif_rtsp.capacity(), 4);
        assert_eq!(gates.rtsp.capacity(), 4);
        assert_eq!(gates.dns.capacity(), 16);
        assert_eq!(gates.warmup.capacity(), 64);
    }

    #[tokio::test]
    async fn test_gate_bounds_concurrency() {
        let gate = Gate::new("test", 2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let active = active.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    gate.run(async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test]
    async fn test_gate_releases_on_timeout() {
        let gate = Gate::new("test", 1);
        let slow = gate.run(tokio::time::sleep(Duration::from_secs(10)));
        let result = tokio::time::timeout(Duration::from_millis(10), slow).await;
        assert!(result.is_err());
        assert_eq!(gate.available(), 1);
    }
}
