use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

pub type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

enum Command {
    Schedule(Instant, Job),
    Halt,
}

struct Entry {
    when: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // reversed: BinaryHeap is a max-heap and we want the earliest deadline on top
    fn cmp(&self, other: &Self) -> Ordering {
        (other.when, other.seq).cmp(&(self.when, self.seq))
    }
}

/// Serialized runner for deferred jobs. Jobs run one at a time on a single
/// task, in deadline order, FIFO among equal deadlines.
#[derive(Clone)]
pub struct DeferredWorker {
    tx: UnboundedSender<Command>,
}

impl DeferredWorker {
    pub fn start() -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(rx));
        (DeferredWorker { tx }, handle)
    }

    pub fn now<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.at(Instant::now(), job);
    }

    pub fn at<F>(&self, when: Instant, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tx.send(Command::Schedule(when, Box::pin(job))).is_err() {
            log::debug!("deferred worker halted, dropping job");
        }
    }

    /// Stops the worker. Jobs not yet started are dropped.
    pub fn halt(&self) {
        let _ = self.tx.send(Command::Halt);
    }
}

async fn run(mut rx: UnboundedReceiver<Command>) {
    let mut queue = BinaryHeap::new();
    let mut seq = 0u64;
    loop {
        while queue
            .peek()
            .is_some_and(|e: &Entry| e.when <= Instant::now())
        {
            if let Some(entry) = queue.pop() {
                entry.job.await;
            }
        }

        let next = queue.peek().map(|e| e.when);
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Schedule(when, job)) => {
                    queue.push(Entry { when, seq, job });
                    seq += 1;
                }
                Some(Command::Halt) | None => break,
            },
            _ = sleep_until(next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))), if next.is_some() => {}
        }
    }
    log::debug!("deferred worker stopped with {} pending jobs", queue.len());
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::sync::oneshot;
    use tokio::time::{sleep, timeout};

    use super::*;

    #[tokio::test]
    async fn runs_by_deadline_then_fifo() {
        let (worker, _) = DeferredWorker::start();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();

        let start = Instant::now() + Duration::from_millis(50);
        let o = order.clone();
        worker.at(start + Duration::from_millis(40), async move {
            o.lock().unwrap().push("late");
            let _ = done_tx.send(());
        });
        for name in ["first", "second"] {
            let o = order.clone();
            worker.at(start, async move { o.lock().unwrap().push(name) });
        }
        let o = order.clone();
        worker.now(async move { o.lock().unwrap().push("now") });

        timeout(Duration::from_secs(5), done_rx).await.unwrap().unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["now", "first", "second", "late"]
        );
    }

    #[tokio::test]
    async fn halt_drops_pending_jobs() {
        let (worker, handle) = DeferredWorker::start();
        let ran = Arc::new(Mutex::new(false));
        let r = ran.clone();
        worker.at(Instant::now() + Duration::from_millis(200), async move {
            *r.lock().unwrap() = true;
        });
        worker.halt();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        sleep(Duration::from_millis(300)).await;
        assert!(!*ran.lock().unwrap());

        // scheduling after halt is a no-op
        worker.now(async {});
    }
}
