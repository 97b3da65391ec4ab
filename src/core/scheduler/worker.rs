use crate::core::session::SessionInner;
use crate::core::stats::ThreadStats;
use crate::util::sync::lock;
use log::{debug, trace};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// Worker loop, run by every pool thread and by the thread calling
/// `Session::run`.
///
/// Takes the first queued task whose filter is not already in process, so a
/// filter never runs on two threads at once while independent filters run in
/// parallel. Returns once the session is done.
pub(crate) fn thread_proc(session: &Arc<SessionInner>, thread_id: usize) -> ThreadStats {
    let mut stats = ThreadStats::new(thread_id);
    let run_start = Instant::now();
    let sched = &session.scheduler;
    debug!("Session thread {thread_id} started");

    loop {
        if sched.is_done() {
            // pass the wake-up on to the next worker
            sched.notify();
            break;
        }
        if sched.wait().is_err() {
            break;
        }
        if sched.is_done() {
            sched.notify();
            break;
        }

        let mut state = lock(&sched.state);
        let next = state.tasks.iter().position(|task| {
            task.filter
                .as_ref()
                .map_or(true, |f| !f.in_process.load(Ordering::Acquire))
        });
        let Some(pos) = next else {
            if state.tasks.is_empty() {
                if state.in_flight == 0 {
                    drop(state);
                    debug!("Session thread {thread_id}: no more tasks, session done");
                    sched.finish();
                    break;
                }
                // running tasks will post their follow-ups
                continue;
            }
            drop(state);
            // every queued task targets a filter busy on another thread
            sched.notify();
            std::thread::yield_now();
            continue;
        };
        let Some(mut task) = state.tasks.remove(pos) else {
            continue;
        };
        if let Some(filter) = &task.filter {
            filter.in_process.store(true, Ordering::Release);
        }
        state.in_flight += 1;
        drop(state);

        let task_start = Instant::now();
        let requeue = task.run(session);
        let elapsed = task_start.elapsed();

        stats.nb_tasks += 1;
        stats.active_time_us += elapsed.as_micros() as u64;
        if let Some(filter) = &task.filter {
            filter.stats().on_task_done(elapsed);
            trace!(
                "Session thread {thread_id} ran task {} of filter {} in {} us",
                task.name(),
                filter.name(),
                elapsed.as_micros()
            );
        }

        let mut state = lock(&sched.state);
        if let Some(filter) = &task.filter {
            filter.in_process.store(false, Ordering::Release);
        }
        state.in_flight -= 1;
        if requeue {
            state.tasks.push_back(task);
            drop(state);
            sched.notify();
        } else {
            let exhausted = state.tasks.is_empty() && state.in_flight == 0;
            drop(state);
            task.clear();
            sched.task_pool.push(task);
            if exhausted {
                debug!("Session thread {thread_id}: task queue exhausted, session done");
                sched.finish();
            }
        }
    }

    stats.run_time_us = run_start.elapsed().as_micros() as u64;
    debug!(
        "Session thread {thread_id} exited after {} tasks",
        stats.nb_tasks
    );
    stats
}
