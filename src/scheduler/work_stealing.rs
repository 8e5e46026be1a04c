use crate::env_var::config;
use crate::scheduler::{panic_message, SchedulerQueue, SchedulerStatus};

use async_task::{Builder, Runnable};
use crossbeam::deque::{Injector, Stealer, Worker};
use crossbeam::utils::Backoff;
use futures::Future;
use rand::prelude::*;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{trace_span, Instrument};

static TASK_ID: AtomicUsize = AtomicUsize::new(0);

// a panicking task must not take its worker thread down with it
fn run_task(runnable: Runnable<usize>) {
    let task_id = *runnable.metadata();
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| runnable.run())) {
        tracing::error!("task {} panicked: {}", task_id, panic_message(&*payload));
    }
}

#[derive(Debug)]
struct WorkStealingThread {
    node: usize,
    work_inj: Arc<Injector<Runnable<usize>>>,
    work_stealers: Vec<Stealer<Runnable<usize>>>,
    work_q: Worker<Runnable<usize>>,
    work_flag: Arc<AtomicU8>,
    status: Arc<AtomicU8>,
}

impl WorkStealingThread {
    fn next_task(&self, rng: &mut ThreadRng) -> Option<Runnable<usize>> {
        self.work_q.pop().or_else(|| {
            if self
                .work_flag
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::Relaxed)
                == Ok(0)
            {
                let ret = self.work_inj.steal_batch_and_pop(&self.work_q).success();
                self.work_flag.store(0, Ordering::SeqCst);
                ret
            } else {
                self.work_stealers
                    .choose(rng)
                    .and_then(|stealer| stealer.steal().success())
            }
        })
    }

    fn has_work(&self) -> bool {
        !(self.work_q.is_empty() && self.work_inj.is_empty())
    }

    #[tracing::instrument(skip_all, level = "debug")]
    fn run(
        worker: WorkStealingThread,
        index: usize,
        active_cnt: Arc<AtomicUsize>,
    ) -> std::io::Result<thread::JoinHandle<()>> {
        let builder = thread::Builder::new().name(format!("node{}_worker{}", worker.node, index));
        active_cnt.fetch_add(1, Ordering::SeqCst);
        let thread_cnt = active_cnt.clone();
        let spawned = builder.spawn(move || {
            let _span = trace_span!("WorkStealingThread::run", node = worker.node, index).entered();
            let mut rng = rand::thread_rng();
            let backoff = Backoff::new();
            let mut timer = Instant::now();
            while worker.status.load(Ordering::SeqCst) == SchedulerStatus::Active as u8
                || worker.has_work()
            {
                match worker.next_task(&mut rng) {
                    Some(runnable) => {
                        backoff.reset();
                        run_task(runnable);
                    }
                    None if backoff.is_completed() => {
                        thread::park_timeout(Duration::from_micros(200))
                    }
                    None => backoff.snooze(),
                }
                if worker.status.load(Ordering::SeqCst) == SchedulerStatus::Finished as u8
                    && timer.elapsed().as_secs_f64() > config().deadlock_timeout
                {
                    tracing::warn!(
                        "node {} worker {} still draining: work_q {} work_inj {}",
                        worker.node,
                        index,
                        worker.work_q.len(),
                        worker.work_inj.len()
                    );
                    timer = Instant::now();
                }
            }
            thread_cnt.fetch_sub(1, Ordering::SeqCst);
        });
        if spawned.is_err() {
            active_cnt.fetch_sub(1, Ordering::SeqCst);
        }
        spawned
    }
}

/// A per-node pool of worker threads sharing a global injector and stealing from each other
#[derive(Debug)]
pub(crate) struct WorkStealing {
    node: usize,
    num_threads: usize,
    threads: Vec<thread::JoinHandle<()>>,
    work_inj: Arc<Injector<Runnable<usize>>>,
    work_stealers: Vec<Stealer<Runnable<usize>>>,
    work_flag: Arc<AtomicU8>,
    status: Arc<AtomicU8>,
    active_cnt: Arc<AtomicUsize>,
}

impl SchedulerQueue for WorkStealing {
    fn submit_task<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task_id = TASK_ID.fetch_add(1, Ordering::Relaxed);
        let work_inj = self.work_inj.clone();
        let schedule = move |runnable| work_inj.push(runnable);
        let (runnable, task) = Builder::new().metadata(task_id).spawn(
            move |_task_id| {
                async move { future.await }
                    .instrument(trace_span!("Submitted Task", task_id = task_id))
            },
            schedule,
        );
        runnable.schedule();
        task.detach();
    }

    fn spawn_task<F>(&self, future: F) -> async_task::Task<F::Output, usize>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let task_id = TASK_ID.fetch_add(1, Ordering::Relaxed);
        let work_inj = self.work_inj.clone();
        let schedule = move |runnable| work_inj.push(runnable);
        let (runnable, task) = Builder::new().metadata(task_id).spawn(
            move |_task_id| {
                async move { future.await }
                    .instrument(trace_span!("Spawned Task", task_id = task_id))
            },
            schedule,
        );
        runnable.schedule();
        task
    }

    fn exec_task(&self) -> bool {
        let ret = if self
            .work_flag
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::Relaxed)
            == Ok(0)
        {
            let ret = self.work_inj.steal().success();
            self.work_flag.store(0, Ordering::SeqCst);
            ret
        } else {
            None
        };
        let ret = ret.or_else(|| {
            self.work_stealers
                .choose(&mut rand::thread_rng())
                .and_then(|stealer| stealer.steal().success())
        });
        match ret {
            Some(runnable) => {
                run_task(runnable);
                true
            }
            None => false,
        }
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        let task_id = TASK_ID.fetch_add(1, Ordering::Relaxed);
        // only the calling thread ever runs this task, so `fut` need not be Send or 'static
        let caller_inj = Arc::new(Injector::new());
        let schedule = {
            let caller_inj = caller_inj.clone();
            move |runnable| caller_inj.push(runnable)
        };
        let (runnable, mut task) = unsafe {
            Builder::new().metadata(task_id).spawn_unchecked(
                move |_task_id| {
                    async move { fut.await }
                        .instrument(trace_span!("Block On Task", task_id = task_id))
                },
                schedule,
            )
        };
        let waker = runnable.waker();
        runnable.run(); //try to run immediately
        let backoff = Backoff::new();
        let mut timer = Instant::now();
        while !task.is_finished() {
            if let Some(runnable) = caller_inj.steal().success() {
                runnable.run();
                backoff.reset();
            } else if self.exec_task() {
                //executed another task while this one is not ready
                backoff.reset();
            } else {
                backoff.snooze();
            }
            if timer.elapsed().as_secs_f64() > config().deadlock_timeout {
                tracing::warn!(
                    "node {} block_on task {} pending for more than {} seconds, possible deadlock",
                    self.node,
                    task_id,
                    config().deadlock_timeout
                );
                timer = Instant::now();
            }
        }
        let cx = &mut Context::from_waker(&waker);
        match Pin::new(&mut task).poll(cx) {
            Poll::Ready(output) => output,
            Poll::Pending => unreachable!("finished block_on task {} not ready", task_id),
        }
    }

    #[tracing::instrument(skip_all, level = "debug")]
    fn shutdown(&self) {
        self.status
            .store(SchedulerStatus::Finished as u8, Ordering::SeqCst);
        let my_id = thread::current().id();
        if self.threads.iter().any(|t| t.thread().id() == my_id) {
            tracing::warn!("node {} scheduler shut down from one of its own workers", self.node);
            return;
        }
        while self.active_cnt.load(Ordering::SeqCst) > 0 {
            if !self.exec_task() {
                for t in &self.threads {
                    t.thread().unpark();
                }
                thread::yield_now();
            }
        }
    }
}

impl WorkStealing {
    pub(crate) fn new(node: usize, num_workers: usize, status: Arc<AtomicU8>) -> WorkStealing {
        let mut ws = WorkStealing {
            node,
            num_threads: std::cmp::max(1, num_workers),
            threads: Vec::new(),
            work_inj: Arc::new(Injector::new()),
            work_stealers: Vec::new(),
            work_flag: Arc::new(AtomicU8::new(0)),
            status,
            active_cnt: Arc::new(AtomicUsize::new(0)),
        };
        ws.init();
        ws
    }

    fn init(&mut self) {
        let work_workers: Vec<Worker<Runnable<usize>>> =
            (0..self.num_threads).map(|_| Worker::new_fifo()).collect();
        self.work_stealers = work_workers.iter().map(|w| w.stealer()).collect();
        for (i, work_q) in work_workers.into_iter().enumerate() {
            let worker = WorkStealingThread {
                node: self.node,
                work_inj: self.work_inj.clone(),
                work_stealers: self.work_stealers.clone(),
                work_q,
                work_flag: self.work_flag.clone(),
                status: self.status.clone(),
            };
            match WorkStealingThread::run(worker, i, self.active_cnt.clone()) {
                Ok(handle) => self.threads.push(handle),
                Err(e) => tracing::error!("node {} unable to spawn worker {}: {}", self.node, i, e),
            }
        }
        tracing::debug!("node {} started {} workers", self.node, self.threads.len());
    }
}

impl Drop for WorkStealing {
    #[tracing::instrument(skip_all, level = "debug")]
    fn drop(&mut self) {
        self.status
            .store(SchedulerStatus::Finished as u8, Ordering::SeqCst);
        while let Some(thread) = self.threads.pop() {
            if thread.thread().id() != thread::current().id() {
                thread.thread().unpark();
                let _res = thread.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn pool(workers: usize) -> WorkStealing {
        WorkStealing::new(
            0,
            workers,
            Arc::new(AtomicU8::new(SchedulerStatus::Active as u8)),
        )
    }

    #[test]
    fn submitted_tasks_all_run() {
        let ws = pool(3);
        let cnt = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let cnt = cnt.clone();
            ws.submit_task(async move {
                cnt.fetch_add(1, Ordering::SeqCst);
            });
        }
        ws.block_on(async {
            while cnt.load(Ordering::SeqCst) < 1000 {
                async_std::task::yield_now().await;
            }
        });
        ws.shutdown();
        assert_eq!(cnt.load(Ordering::SeqCst), 1000);
        assert_eq!(ws.status.load(Ordering::SeqCst), SchedulerStatus::Finished as u8);
    }

    #[test]
    fn block_on_borrows_and_waits_for_spawned() {
        let ws = pool(2);
        let local = vec![1, 2, 3];
        let task = ws.spawn_task(async { 40 });
        let res = ws.block_on(async { task.await + local.len() as i32 - 1 });
        assert_eq!(res, 42);
    }

    #[test]
    fn panicking_task_does_not_kill_pool() {
        let ws = pool(1);
        ws.submit_task(async { panic!("boom") });
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let task = ws.spawn_task(async move { flag.store(true, Ordering::SeqCst) });
        ws.block_on(task);
        assert!(ran.load(Ordering::SeqCst));
    }
}
