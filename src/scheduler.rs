//! Deadline-ordered scheduler for all periodic background work
//!
//! Every periodic loop in the core (health collection, capacity checks, pool
//! scaling, lease sweeping, efficiency snapshots, retention) registers here
//! instead of owning its own timer. One driver task pops the next deadline
//! from a binary heap, runs the job, and reschedules it. Shutdown cancels the
//! driver and therefore every job in one place.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Boxed future returned by a periodic job
pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A periodic job: name, interval, jitter bound, and the work itself
pub struct PeriodicJob {
    /// Stable name for logs and deregistration
    pub name: String,
    /// Base interval between runs
    pub interval: Duration,
    /// Maximum jitter added to each deadline (derived deterministically from
    /// the job name so replays schedule identically)
    pub max_jitter: Duration,
    /// Factory producing one run of the job
    pub run: Arc<dyn Fn() -> JobFuture + Send + Sync>,
}

impl std::fmt::Debug for PeriodicJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicJob")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("max_jitter", &self.max_jitter)
            .finish_non_exhaustive()
    }
}

/// Entry in the deadline heap
struct Scheduled {
    deadline: tokio::time::Instant,
    job: Arc<PeriodicJob>,
    // Registration generation; a newer registration under the same name
    // orphans this entry.
    generation: u64,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

/// Single scheduler owning every periodic task in the core
pub struct Scheduler {
    heap: Mutex<BinaryHeap<Reverse<Scheduled>>>,
    generations: Mutex<HashMap<String, u64>>,
    wake: Notify,
    running: AtomicBool,
    shutdown: AtomicBool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates an empty scheduler
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            generations: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Registers a periodic job; the first run fires after one interval
    ///
    /// Re-registering a name replaces the previous job: the stale heap entry
    /// is orphaned and skipped at pop time.
    pub async fn register(self: &Arc<Self>, job: PeriodicJob) {
        let job = Arc::new(job);
        let deadline = tokio::time::Instant::now() + job.interval + jitter_for(&job.name, job.max_jitter);
        debug!(job = %job.name, interval_ms = job.interval.as_millis() as u64, "registering periodic job");
        let generation = {
            let mut generations = self.generations.lock().await;
            let generation = generations.get(&job.name).map_or(0, |g| g + 1);
            generations.insert(job.name.clone(), generation);
            generation
        };
        self.heap.lock().await.push(Reverse(Scheduled {
            deadline,
            job,
            generation,
        }));
        self.wake.notify_one();
    }

    /// Cancels a job by name; a queued run is skipped at pop time
    pub async fn cancel(&self, name: &str) {
        self.generations.lock().await.remove(name);
        self.wake.notify_one();
    }

    /// Starts the driver task; idempotent
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.drive().await;
        });
    }

    /// Stops the driver; queued jobs are dropped
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        info!("scheduler shutdown requested");
    }

    async fn drive(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("scheduler driver exiting");
                self.running.store(false, Ordering::SeqCst);
                return;
            }

            let next = { self.heap.lock().await.peek().map(|Reverse(s)| s.deadline) };
            match next {
                None => {
                    // Nothing scheduled; wait until a registration wakes us.
                    self.wake.notified().await;
                }
                Some(deadline) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(deadline) => {
                            self.fire_due().await;
                        }
                        () = self.wake.notified() => {
                            // Re-evaluate: new job, cancellation, or shutdown.
                        }
                    }
                }
            }
        }
    }

    async fn fire_due(self: &Arc<Self>) {
        let now = tokio::time::Instant::now();
        loop {
            let due = {
                let mut heap = self.heap.lock().await;
                match heap.peek() {
                    Some(Reverse(s)) if s.deadline <= now => heap.pop().map(|Reverse(s)| s),
                    _ => None,
                }
            };
            let Some(entry) = due else { break };

            let current = self.generations.lock().await.get(&entry.job.name).copied();
            if current != Some(entry.generation) {
                debug!(job = %entry.job.name, "skipping cancelled or replaced job");
                continue;
            }

            let job = Arc::clone(&entry.job);
            let fut = (job.run)();
            let name = job.name.clone();
            tokio::spawn(async move {
                fut.await;
                debug!(job = %name, "periodic job run complete");
            });

            // Reschedule relative to the intended deadline so drift does not
            // accumulate under load.
            let next_deadline = entry.deadline + entry.job.interval + jitter_for(&entry.job.name, entry.job.max_jitter);
            let next_deadline = next_deadline.max(now);
            self.heap.lock().await.push(Reverse(Scheduled {
                deadline: next_deadline,
                job: entry.job,
                generation: entry.generation,
            }));
        }
    }
}

/// Deterministic jitter in `[0, max)` derived from the job name
fn jitter_for(name: &str, max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut hasher);
    let millis = hasher.finish() % u64::try_from(max.as_millis().max(1)).unwrap_or(1);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_job(name: &str, interval: Duration, counter: Arc<AtomicUsize>) -> PeriodicJob {
        PeriodicJob {
            name: name.to_string(),
            interval,
            max_jitter: Duration::ZERO,
            run: Arc::new(move || {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }),
        }
    }

    #[tokio::test]
    async fn jobs_fire_repeatedly() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .register(counting_job("tick", Duration::from_millis(10), Arc::clone(&counter)))
            .await;
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown();
        assert!(counter.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn cancelled_jobs_stop_firing() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .register(counting_job("doomed", Duration::from_millis(10), Arc::clone(&counter)))
            .await;
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.cancel("doomed").await;
        let at_cancel = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // One queued run may still slip through before the cancel is observed.
        assert!(counter.load(Ordering::SeqCst) <= at_cancel + 1);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn jitter_is_deterministic() {
        let a = jitter_for("health", Duration::from_millis(500));
        let b = jitter_for("health", Duration::from_millis(500));
        assert_eq!(a, b);
    }
}
