use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::{Error, Result};

/// Acquire a mutex, recovering from poisoned state.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// One-shot completion signal used by `flush()`.
#[derive(Default)]
pub struct WaitSignal {
    done: Mutex<bool>,
    cond: Condvar,
}

impl WaitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *lock(&self.done) = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut done = lock(&self.done);
        while !*done {
            done = self.cond.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.done)
    }
}

/// A unit of work travelling through the queue.
pub enum Job<T> {
    Work { payload: T, size: usize },
    Wait(Arc<WaitSignal>),
    Shutdown,
}

impl<T> Job<T> {
    fn size(&self) -> usize {
        match self {
            Job::Work { size, .. } => *size,
            _ => 0,
        }
    }
}

struct State<T> {
    queue: VecDeque<Job<T>>,
    queued_size: usize,
    paused: bool,
    disposed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Signalled when a job is added or the queue is resumed.
    job_added: Condvar,
    /// Signalled when the consumer drains jobs or the queue is disposed.
    space_freed: Condvar,
}

pub type ProcessJob<T> = Box<dyn FnMut(T) + Send>;
pub type ExceptionLogger = Arc<dyn Fn(String) + Send + Sync>;

/// Bounded producer / single-consumer queue processed on a dedicated thread.
///
/// Jobs are handed to the processing closure in submission order. A panic
/// inside the closure is reported through the exception logger and does not
/// stop the jobs queued after it.
pub struct JobQueue<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    display_name: String,
    max_queue_length: usize,
    max_queue_size: usize,
    enable_bounds: bool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> JobQueue<T> {
    pub fn new(
        process: ProcessJob<T>,
        display_name: &str,
        max_queue_length: usize,
        max_queue_size: usize,
        enable_bounds: bool,
        exception_logger: ExceptionLogger,
    ) -> Result<Self> {
        if display_name.trim().is_empty() {
            return Err(Error::InvalidArgument("display name must not be empty".to_string()));
        }
        if max_queue_length < 1 {
            return Err(Error::InvalidArgument(format!(
                "max queue length must be at least 1, got {}",
                max_queue_length
            )));
        }
        if max_queue_size < 1 {
            return Err(Error::InvalidArgument(format!(
                "max queue size must be at least 1, got {}",
                max_queue_size
            )));
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                queued_size: 0,
                paused: false,
                disposed: false,
            }),
            job_added: Condvar::new(),
            space_freed: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker_name = display_name.to_string();
        let worker = thread::Builder::new()
            .name(display_name.to_string())
            .spawn(move || {
                background_job_processor(worker_shared, process, exception_logger, worker_name);
            })?;

        Ok(Self {
            shared,
            display_name: display_name.to_string(),
            max_queue_length,
            max_queue_size,
            enable_bounds,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Queue a job. Blocks while bounds are enabled and the queue is over
    /// capacity, until the consumer drains enough jobs.
    pub fn queue_job(&self, payload: T, size: usize) -> Result<()> {
        self.enqueue(Job::Work { payload, size })
    }

    /// Best-effort flag; the consumer may already hold a drained batch.
    pub fn pause(&self) {
        lock(&self.shared.state).paused = true;
    }

    pub fn resume(&self) {
        lock(&self.shared.state).paused = false;
        self.shared.job_added.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.shared.state).paused
    }

    /// Block until every job queued before this call has been processed.
    pub fn flush(&self) -> Result<()> {
        let signal = Arc::new(WaitSignal::new());
        self.enqueue(Job::Wait(Arc::clone(&signal)))?;
        signal.wait();
        Ok(())
    }

    /// Stop the background thread after it has processed everything queued
    /// so far. Fails if the queue is paused.
    pub fn dispose(&self) -> Result<()> {
        {
            let mut state = lock(&self.shared.state);
            if state.disposed {
                return Ok(());
            }
            if state.paused {
                return Err(Error::QueuePaused(self.display_name.clone()));
            }
            state.disposed = true;
            state.queue.push_back(Job::Shutdown);
        }
        self.shared.job_added.notify_all();
        self.shared.space_freed.notify_all();

        let worker = lock(&self.worker).take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                tracing::error!("Job queue '{}' worker thread panicked", self.display_name);
            }
        }
        Ok(())
    }

    fn enqueue(&self, job: Job<T>) -> Result<()> {
        let size = job.size();
        let mut state = lock(&self.shared.state);
        if state.disposed {
            return Err(Error::QueueDisposed(self.display_name.clone()));
        }

        if self.enable_bounds {
            while !state.disposed && self.should_wait(&state, size) {
                state = self
                    .shared
                    .space_freed
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            }
            if state.disposed {
                return Err(Error::QueueDisposed(self.display_name.clone()));
            }
        }

        state.queued_size += size;
        state.queue.push_back(job);
        drop(state);
        self.shared.job_added.notify_one();
        Ok(())
    }

    fn should_wait(&self, state: &State<T>, size: usize) -> bool {
        // An empty queue always admits the job, otherwise a single job larger
        // than the size cap would block forever.
        if state.queue.is_empty() {
            return false;
        }
        state.queue.len() >= self.max_queue_length
            || state.queued_size + size > self.max_queue_size
    }
}

impl<T: Send + 'static> Drop for JobQueue<T> {
    fn drop(&mut self) {
        self.resume();
        if let Err(e) = self.dispose() {
            tracing::warn!("Failed to dispose job queue '{}': {}", self.display_name, e);
        }
    }
}

fn background_job_processor<T>(
    shared: Arc<Shared<T>>,
    mut process: ProcessJob<T>,
    exception_logger: ExceptionLogger,
    display_name: String,
) {
    loop {
        let mut batch = Vec::new();
        let mut shutdown = false;
        {
            let mut state = lock(&shared.state);
            while state.queue.is_empty() || (state.paused && !state.disposed) {
                state = shared.job_added.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            while let Some(job) = state.queue.pop_front() {
                if matches!(job, Job::Shutdown) {
                    shutdown = true;
                    break;
                }
                state.queued_size -= job.size();
                batch.push(job);
            }
        }
        shared.space_freed.notify_all();

        for job in batch {
            match job {
                Job::Work { payload, .. } => {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| process(payload)));
                    if let Err(panic) = outcome {
                        let message = format!(
                            "Job queue '{}': job failed: {}",
                            display_name,
                            panic_message(&panic)
                        );
                        exception_logger(message);
                    }
                }
                Job::Wait(signal) => signal.set(),
                Job::Shutdown => {}
            }
        }

        if shutdown {
            tracing::debug!("Job queue '{}' shut down", display_name);
            break;
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn recording_queue(
        max_len: usize,
        max_size: usize,
        bounds: bool,
    ) -> (JobQueue<u32>, Arc<Mutex<Vec<u32>>>, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let errors_clone = Arc::clone(&errors);
        let queue = JobQueue::new(
            Box::new(move |n: u32| {
                if n == 0 {
                    panic!("job zero is poison");
                }
                seen_clone.lock().unwrap().push(n);
            }),
            "test-queue",
            max_len,
            max_size,
            bounds,
            Arc::new(move |msg| errors_clone.lock().unwrap().push(msg)),
        )
        .unwrap();
        (queue, seen, errors)
    }

    #[test]
    fn test_constructor_validation() {
        let logger: ExceptionLogger = Arc::new(|_| {});
        assert!(JobQueue::<u32>::new(Box::new(|_| {}), "", 1, 1, true, logger.clone()).is_err());
        assert!(JobQueue::<u32>::new(Box::new(|_| {}), "q", 0, 1, true, logger.clone()).is_err());
        assert!(JobQueue::<u32>::new(Box::new(|_| {}), "q", 1, 0, true, logger.clone()).is_err());
        assert!(JobQueue::<u32>::new(Box::new(|_| {}), "q", 1, 1, true, logger).is_ok());
    }

    #[test]
    fn test_jobs_processed_in_fifo_order() {
        let (queue, seen, _) = recording_queue(100, 1000, true);
        for n in 1..=10 {
            queue.queue_job(n, 1).unwrap();
        }
        queue.flush().unwrap();
        assert_eq!(*seen.lock().unwrap(), (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_failing_job_does_not_stop_later_jobs() {
        let (queue, seen, errors) = recording_queue(100, 1000, true);
        queue.queue_job(1, 1).unwrap();
        queue.queue_job(0, 1).unwrap();
        queue.queue_job(3, 1).unwrap();
        queue.flush().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("job zero is poison"));
    }

    #[test]
    fn test_third_job_blocks_until_consumer_drains() {
        let (queue, seen, _) = recording_queue(2, 1000, true);
        let queue = Arc::new(queue);
        queue.pause();
        queue.queue_job(1, 1).unwrap();
        queue.queue_job(2, 1).unwrap();

        let returned = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = Arc::clone(&queue);
            let returned = Arc::clone(&returned);
            thread::spawn(move || {
                queue.queue_job(3, 1).unwrap();
                returned.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(150));
        assert!(!returned.load(Ordering::SeqCst), "producer should be blocked");

        queue.resume();
        producer.join().unwrap();
        assert!(returned.load(Ordering::SeqCst));

        queue.flush().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_size_bound_blocks_producer() {
        let (queue, seen, _) = recording_queue(100, 10, true);
        let queue = Arc::new(queue);
        queue.pause();
        queue.queue_job(1, 8).unwrap();

        let returned = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = Arc::clone(&queue);
            let returned = Arc::clone(&returned);
            thread::spawn(move || {
                queue.queue_job(2, 5).unwrap();
                returned.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(150));
        assert!(!returned.load(Ordering::SeqCst));
        queue.resume();
        producer.join().unwrap();
        queue.flush().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_oversized_job_admitted_into_empty_queue() {
        let (queue, seen, _) = recording_queue(10, 4, true);
        queue.queue_job(7, 100).unwrap();
        queue.flush().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn test_unbounded_queue_never_blocks() {
        let (queue, seen, _) = recording_queue(1, 1, false);
        queue.pause();
        for n in 1..=5 {
            queue.queue_job(n, 10).unwrap();
        }
        queue.resume();
        queue.flush().unwrap();
        assert_eq!(seen.lock().unwrap().len(), 5);
    }

    #[test]
    fn test_pause_holds_jobs_until_resume() {
        let (queue, seen, _) = recording_queue(100, 1000, true);
        queue.pause();
        assert!(queue.is_paused());
        queue.queue_job(1, 1).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(seen.lock().unwrap().is_empty());
        queue.resume();
        assert!(!queue.is_paused());
        queue.flush().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_dispose_while_paused_fails() {
        let (queue, _, _) = recording_queue(100, 1000, true);
        queue.pause();
        assert!(matches!(queue.dispose(), Err(Error::QueuePaused(_))));
        queue.resume();
        assert!(queue.dispose().is_ok());
    }

    #[test]
    fn test_queue_after_dispose_fails() {
        let (queue, seen, _) = recording_queue(100, 1000, true);
        queue.queue_job(1, 1).unwrap();
        queue.dispose().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert!(matches!(queue.queue_job(2, 1), Err(Error::QueueDisposed(_))));
        assert!(matches!(queue.flush(), Err(Error::QueueDisposed(_))));
    }

    #[test]
    fn test_flush_with_concurrent_producer_does_not_hang() {
        let (queue, seen, _) = recording_queue(4, 1000, true);
        let queue = Arc::new(queue);
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for n in 1..=200 {
                    queue.queue_job(n, 1).unwrap();
                }
            })
        };
        for _ in 0..10 {
            queue.flush().unwrap();
        }
        producer.join().unwrap();
        queue.flush().unwrap();
        assert_eq!(seen.lock().unwrap().len(), 200);
    }

    #[test]
    fn test_wait_signal() {
        let signal = Arc::new(WaitSignal::new());
        assert!(!signal.is_set());
        let s = Arc::clone(&signal);
        let waiter = thread::spawn(move || s.wait());
        signal.set();
        waiter.join().unwrap();
        assert!(signal.is_set());
    }
}
