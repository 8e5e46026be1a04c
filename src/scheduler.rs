use enum_dispatch::enum_dispatch;
use futures::Future;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;

pub(crate) mod work_stealing;
use work_stealing::WorkStealing;

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SchedulerStatus {
    Active,
    Finished,
}

/// The available worker thread scheduling algorithms
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerType {
    #[default]
    WorkStealing,
}

#[enum_dispatch]
pub(crate) trait SchedulerQueue {
    /// Run `future` to completion on some worker, detached
    fn submit_task<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
    /// Run `future` on some worker, the returned task yields its output
    fn spawn_task<F>(&self, future: F) -> async_task::Task<F::Output, usize>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static;
    /// Execute at most one queued task on the calling thread, returns whether one ran
    fn exec_task(&self) -> bool;
    /// Drive `future` to completion on the calling thread, executing queued tasks while it is pending
    fn block_on<F: Future>(&self, future: F) -> F::Output;
    fn shutdown(&self);
}

#[enum_dispatch(SchedulerQueue)]
#[derive(Debug)]
pub(crate) enum Scheduler {
    WorkStealing,
}

pub(crate) fn create_scheduler(
    sched: SchedulerType,
    node: usize,
    num_workers: usize,
    status: Arc<AtomicU8>,
) -> Scheduler {
    match sched {
        SchedulerType::WorkStealing => {
            Scheduler::WorkStealing(WorkStealing::new(node, num_workers, status))
        }
    }
}
