use log::info;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Live counters of one filter.
#[derive(Debug, Default)]
pub(crate) struct FilterCounters {
    tasks_done: AtomicU64,
    process_time_us: AtomicU64,
    packets_processed: AtomicU64,
    bytes_processed: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl FilterCounters {
    pub(crate) fn on_packet_sent(&self, len: usize) {
        if len > 0 {
            self.packets_sent.fetch_add(1, Ordering::Relaxed);
            self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn on_packet_processed(&self, len: usize) {
        self.packets_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_task_done(&self, elapsed: Duration) {
        self.tasks_done.fetch_add(1, Ordering::Relaxed);
        self.process_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn packets_processed(&self) -> u64 {
        self.packets_processed.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self) -> FilterStats {
        FilterStats {
            tasks_done: self.tasks_done.load(Ordering::Relaxed),
            process_time_us: self.process_time_us.load(Ordering::Relaxed),
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}

/// Snapshot of a filter's activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub name: String,
    pub id: Option<String>,
    pub nb_input_pids: usize,
    pub nb_output_pids: usize,
    pub tasks_done: u64,
    pub process_time_us: u64,
    pub packets_processed: u64,
    pub bytes_processed: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
}

/// Activity of one scheduler thread during the last run.
///
/// Thread 0 is the thread that called `Session::run`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadStats {
    pub thread_id: usize,
    pub nb_tasks: u64,
    pub run_time_us: u64,
    /// Time spent running tasks.
    pub active_time_us: u64,
}

impl ThreadStats {
    pub(crate) fn new(thread_id: usize) -> Self {
        Self {
            thread_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub filters: Vec<FilterStats>,
    pub threads: Vec<ThreadStats>,
    pub run_time_us: u64,
}

impl SessionStats {
    pub fn total_tasks(&self) -> u64 {
        self.threads.iter().map(|t| t.nb_tasks).sum()
    }

    /// Writes the report through the logger, one line per filter and thread.
    pub fn log(&self) {
        for line in self.to_string().lines() {
            info!("{line}");
        }
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Session stats - {} filters, run time {} us",
            self.filters.len(),
            self.run_time_us
        )?;
        for s in &self.filters {
            writeln!(
                f,
                "Filter {}{}: {} inputs, {} outputs, {} tasks, {} us process time, {} packets ({} bytes) processed, {} packets ({} bytes) sent",
                s.name,
                s.id.as_deref().map(|id| format!(" (FID {id})")).unwrap_or_default(),
                s.nb_input_pids,
                s.nb_output_pids,
                s.tasks_done,
                s.process_time_us,
                s.packets_processed,
                s.bytes_processed,
                s.packets_sent,
                s.bytes_sent
            )?;
        }
        for t in &self.threads {
            let usage = if t.run_time_us > 0 {
                t.active_time_us * 100 / t.run_time_us
            } else {
                0
            };
            writeln!(
                f,
                "Thread {}: run time {} us, active time {} us ({}%), {} tasks",
                t.thread_id, t.run_time_us, t.active_time_us, usage, t.nb_tasks
            )?;
        }
        Ok(())
    }
}
