//! The fixed worker set. Every client connection is pinned to exactly one
//! worker from registration until close: all reads, writes, timers and
//! state-machine transitions for it run on that worker's thread, so
//! connection state needs no locking. Cross-worker communication goes through
//! bounded message queues; long-running external work goes to a shared
//! auxiliary runtime and talks back through the owning worker's queue.

pub mod delayed_call;
pub mod message_queue;
pub mod worker_local;

use crate::worker::delayed_call::{DcAction, DcId, DelayedCalls};
use crate::worker::message_queue::{
    channel, MessageSender, QueueMessage, WorkerRequest, DEFAULT_QUEUE_DEPTH,
};

use common::metrics::ShardedCounter;
use common::ShutdownMessage;
use dashmap::DashMap;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::LocalSet;
use tracing::{debug, info, warn};

pub type Task = Box<dyn FnOnce(&Worker) + Send + 'static>;
pub type MessageHandler = Arc<dyn Fn(&Worker, QueueMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostMode {
    /// Run inline when the caller is already on the target worker, enqueue
    /// otherwise.
    Auto,
    /// Always enqueue, even from the target worker itself.
    Queue,
    /// Run inline when possible; falls back to enqueueing across threads.
    Immediate,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Worker>>> = const { RefCell::new(None) };
}

/// The id of the worker owning the current thread, if any.
pub fn current_worker_id() -> Option<usize> {
    CURRENT.with(|c| c.borrow().as_ref().map(|w| w.id()))
}

fn with_current<R>(f: impl FnOnce(&Worker) -> R) -> Option<R> {
    CURRENT.with(|c| c.borrow().as_ref().map(|w| f(w)))
}

/// Worker-side context handed to every task. Lives on the worker's thread
/// and is deliberately `!Send`.
pub struct Worker {
    id: usize,
    timers: Rc<RefCell<DelayedCalls>>,
    background: tokio::runtime::Handle,
    directory: Arc<DashMap<u64, usize>>,
    /// This worker's accumulator cell of the pool-wide task counter.
    tasks_run: Arc<std::sync::atomic::AtomicU64>,
}

impl Worker {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Spawns a task pinned to this worker's event loop. The future may hold
    /// `!Send` state; it never migrates threads.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        tokio::task::spawn_local(fut);
    }

    /// Registers a delayed call in this worker's loop. Ordering between calls
    /// of equal deadline is insertion order. The callback receives
    /// [`DcAction::Execute`] at the deadline (returning true re-arms it) or
    /// [`DcAction::Cancel`] on cancellation and worker shutdown.
    pub fn delayed_call(
        &self,
        delay: Duration,
        callback: impl FnMut(DcAction) -> bool + 'static,
    ) -> DcId {
        self.timers.borrow_mut().insert(delay, Box::new(callback))
    }

    pub fn cancel_delayed_call(&self, id: DcId) {
        self.timers.borrow_mut().cancel(id);
    }

    /// Handle to the shared auxiliary runtime for work that must not occupy
    /// the worker (object-storage fetches, external commands). Results come
    /// back via this worker's queue or a channel owned by a session task.
    pub fn background(&self) -> &tokio::runtime::Handle {
        &self.background
    }

    pub fn register_session(&self, session_id: u64) {
        self.directory.insert(session_id, self.id);
    }

    pub fn deregister_session(&self, session_id: u64) {
        self.directory.remove(&session_id);
    }
}

/// Cross-thread handle to one worker.
#[derive(Clone)]
pub struct WorkerHandle {
    id: usize,
    sender: MessageSender,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Enqueues a task for the worker. Returns false when the queue stayed
    /// full after bounded retries or the worker is gone; the caller decides
    /// whether to drop or retry.
    pub fn post(&self, task: Task) -> bool {
        self.sender.post(WorkerRequest::Task(task))
    }

    pub fn execute(&self, mode: PostMode, task: Task) -> bool {
        match mode {
            PostMode::Queue => self.post(task),
            PostMode::Auto | PostMode::Immediate => {
                if current_worker_id() == Some(self.id) {
                    with_current(|w| task(w));
                    true
                } else {
                    self.post(task)
                }
            }
        }
    }

    /// Posts a raw datagram delivered to the worker's message handler.
    pub fn send_message(&self, msg: QueueMessage) -> bool {
        self.sender.post(WorkerRequest::Message(msg))
    }
}

pub struct WorkerPoolOptions {
    pub workers: usize,
    pub queue_depth: usize,
    pub message_handler: Option<MessageHandler>,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            message_handler: None,
        }
    }
}

/// N single-threaded routing workers plus the caller's thread as the main
/// worker. Listeners run on the main worker; accepted connections are handed
/// to routing workers round-robin and stay there for their lifetime.
pub struct WorkerPool {
    handles: Vec<WorkerHandle>,
    threads: Vec<std::thread::JoinHandle<()>>,
    next_rr: AtomicUsize,
    background: tokio::runtime::Runtime,
    shutdown_tx: watch::Sender<ShutdownMessage>,
    directory: Arc<DashMap<u64, usize>>,
    /// Per-worker accumulators, summed on read. The sum is telemetry, not a
    /// consistent snapshot.
    tasks_run: Arc<ShardedCounter>,
}

impl WorkerPool {
    pub fn new(options: WorkerPoolOptions) -> std::io::Result<Self> {
        let (shutdown_tx, _) = watch::channel(ShutdownMessage::Init);
        let background = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("gate-aux")
            .enable_all()
            .build()?;
        let directory: Arc<DashMap<u64, usize>> = Arc::new(DashMap::new());
        let tasks_run = Arc::new(ShardedCounter::new());

        let mut handles = Vec::with_capacity(options.workers);
        let mut threads = Vec::with_capacity(options.workers);
        for id in 0..options.workers {
            let (sender, rx) = channel(options.queue_depth);
            handles.push(WorkerHandle {
                id,
                sender: sender.clone(),
            });
            let shutdown_rx = shutdown_tx.subscribe();
            let bg_handle = background.handle().clone();
            let dir = Arc::clone(&directory);
            let handler = options.message_handler.clone();
            let task_cell = tasks_run.register_cell();
            let thread = std::thread::Builder::new()
                .name(format!("gate-worker-{id}"))
                .spawn(move || worker_main(id, rx, shutdown_rx, bg_handle, dir, handler, task_cell))?;
            threads.push(thread);
        }
        info!("WorkerPool started {} routing workers", options.workers);
        Ok(Self {
            handles,
            threads,
            next_rr: AtomicUsize::new(0),
            background,
            shutdown_tx,
            directory,
            tasks_run,
        })
    }

    /// Tasks executed across all workers since startup.
    pub fn tasks_executed(&self) -> u64 {
        self.tasks_run.reduce()
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    pub fn handle(&self, id: usize) -> &WorkerHandle {
        &self.handles[id]
    }

    /// Round-robin worker election for accepted connections.
    pub fn elect(&self) -> &WorkerHandle {
        let next = self.next_rr.fetch_add(1, Ordering::Relaxed);
        &self.handles[next % self.handles.len()]
    }

    /// Posts the task to every worker, returning how many accepted it. When a
    /// semaphore is supplied, one permit is added per completed execution so
    /// the caller can join on `accepted` permits.
    pub fn broadcast(
        &self,
        task: Arc<dyn Fn(&Worker) + Send + Sync>,
        completion: Option<Arc<Semaphore>>,
    ) -> usize {
        let mut accepted = 0;
        for handle in &self.handles {
            let task = Arc::clone(&task);
            let completion = completion.clone();
            let posted = handle.post(Box::new(move |worker| {
                task(worker);
                if let Some(sem) = completion {
                    sem.add_permits(1);
                }
            }));
            if posted {
                accepted += 1;
            } else {
                warn!("broadcast: worker {} declined task", handle.id());
            }
        }
        accepted
    }

    pub fn background_handle(&self) -> tokio::runtime::Handle {
        self.background.handle().clone()
    }

    pub fn session_directory(&self) -> Arc<DashMap<u64, usize>> {
        Arc::clone(&self.directory)
    }

    /// Cooperative shutdown: workers finish the callback they are running,
    /// drain their queues, deliver `Cancel` to pending delayed calls, drop
    /// their connections and exit.
    pub fn shutdown(mut self, reason: &str) {
        let _ = self
            .shutdown_tx
            .send(ShutdownMessage::Cancel(reason.to_string()));
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn worker_main(
    id: usize,
    mut rx: mpsc::Receiver<WorkerRequest>,
    mut shutdown_rx: watch::Receiver<ShutdownMessage>,
    background: tokio::runtime::Handle,
    directory: Arc<DashMap<u64, usize>>,
    handler: Option<MessageHandler>,
    task_cell: Arc<std::sync::atomic::AtomicU64>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            warn!("worker {id} failed to build runtime: {e:?}");
            return;
        }
    };
    let local = LocalSet::new();
    local.block_on(&rt, async move {
        let worker = Rc::new(Worker {
            id,
            timers: Rc::new(RefCell::new(DelayedCalls::new())),
            background,
            directory,
            tasks_run: task_cell,
        });
        CURRENT.with(|c| *c.borrow_mut() = Some(Rc::clone(&worker)));

        loop {
            let deadline = worker.timers.borrow_mut().next_deadline();
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    match changed {
                        Ok(()) => {
                            if let ShutdownMessage::Cancel(msg) = &*shutdown_rx.borrow_and_update() {
                                debug!("worker {id} shutting down: {msg}");
                            }
                        }
                        Err(_) => debug!("worker {id} pool dropped, shutting down"),
                    }
                    break;
                }
                req = rx.recv() => match req {
                    Some(WorkerRequest::Task(task)) => {
                        task(&worker);
                        worker.tasks_run.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(WorkerRequest::Message(msg)) => {
                        if let Some(handler) = &handler {
                            handler(&worker, msg);
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                    if deadline.is_some() =>
                {
                    worker.timers.borrow_mut().fire_due(tokio::time::Instant::now());
                }
            }
        }

        // flush whatever was queued before the shutdown was observed
        while let Ok(req) = rx.try_recv() {
            match req {
                WorkerRequest::Task(task) => task(&worker),
                WorkerRequest::Message(msg) => {
                    if let Some(handler) = &handler {
                        handler(&worker, msg);
                    }
                }
            }
        }
        worker.timers.borrow_mut().cancel_all();
        CURRENT.with(|c| *c.borrow_mut() = None);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn small_pool(n: usize) -> WorkerPool {
        WorkerPool::new(WorkerPoolOptions {
            workers: n,
            queue_depth: 64,
            message_handler: None,
        })
        .unwrap()
    }

    #[test]
    fn test_post_runs_on_worker() {
        let pool = small_pool(2);
        let (tx, rx) = std::sync::mpsc::channel();
        assert!(pool.handle(1).post(Box::new(move |worker| {
            tx.send((worker.id(), current_worker_id())).unwrap();
        })));
        let (id, current) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(id, 1);
        assert_eq!(current, Some(1));
        pool.shutdown("test done");
    }

    #[test]
    fn test_round_robin_election() {
        let pool = small_pool(3);
        let ids: Vec<usize> = (0..6).map(|_| pool.elect().id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2]);
        pool.shutdown("test done");
    }

    #[test]
    fn test_broadcast_with_join_barrier() {
        let pool = small_pool(3);
        let counter = Arc::new(AtomicU64::new(0));
        let sem = Arc::new(Semaphore::new(0));
        let counter_in = Arc::clone(&counter);
        let accepted = pool.broadcast(
            Arc::new(move |_w| {
                counter_in.fetch_add(1, Ordering::SeqCst);
            }),
            Some(Arc::clone(&sem)),
        );
        assert_eq!(accepted, 3);
        // join: wait for one permit per accepted execution
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let _ = tokio::time::timeout(Duration::from_secs(5), sem.acquire_many(3))
                .await
                .unwrap()
                .unwrap();
        });
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        // per-worker accumulators reduce to the broadcast fan-out
        assert_eq!(pool.tasks_executed(), 3);
        pool.shutdown("test done");
    }

    #[test]
    fn test_delayed_call_fires_and_cancel_on_shutdown() {
        let pool = small_pool(1);
        let (tx, rx) = std::sync::mpsc::channel();
        let (cancel_tx, cancel_rx) = std::sync::mpsc::channel();
        pool.handle(0).post(Box::new(move |worker| {
            let tx = tx.clone();
            worker.delayed_call(Duration::from_millis(10), move |action| {
                tx.send(action).unwrap();
                false
            });
            let cancel_tx = cancel_tx.clone();
            worker.delayed_call(Duration::from_secs(3600), move |action| {
                cancel_tx.send(action).unwrap();
                false
            });
        }));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            DcAction::Execute
        );
        pool.shutdown("test done");
        // the far-future call must have seen Cancel during shutdown
        assert_eq!(cancel_rx.try_recv().unwrap(), DcAction::Cancel);
    }

    #[test]
    fn test_message_handler_receives_datagram() {
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let pool = WorkerPool::new(WorkerPoolOptions {
            workers: 1,
            queue_depth: 16,
            message_handler: Some(Arc::new(move |worker, msg| {
                tx.lock().unwrap().send((worker.id(), msg)).unwrap();
            })),
        })
        .unwrap();
        pool.handle(0).send_message(QueueMessage {
            id: 42,
            arg1: 7,
            arg2: 9,
        });
        let (wid, msg) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(wid, 0);
        assert_eq!(msg.id, 42);
        pool.shutdown("test done");
    }
}
