use crate::run::{NodeExecution, RunId};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
enum LogEvent {
    Entry(NodeExecution),
    Closed,
}

struct RunLog {
    entries: Vec<NodeExecution>,
    next_seq: u64,
    tx: broadcast::Sender<LogEvent>,
    closed: bool,
}

impl RunLog {
    fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            entries: Vec::new(),
            next_seq: 0,
            tx,
            closed: false,
        }
    }
}

/// Append-only record of node execution attempts, ordered per run by a
/// monotonic sequence number assigned at append time. This mutex is
/// the single point where concurrent completions resolve into a total
/// order.
pub struct ExecutionLog {
    buffer: usize,
    runs: Mutex<HashMap<RunId, RunLog>>,
}

impl ExecutionLog {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Append a record, assigning its sequence number. Engine-only.
    pub fn append(&self, mut record: NodeExecution) -> u64 {
        let mut runs = self.runs.lock().expect("log mutex poisoned");
        let buffer = self.buffer;
        let run = runs
            .entry(record.run_id)
            .or_insert_with(|| RunLog::new(buffer));
        record.seq = run.next_seq;
        run.next_seq += 1;
        run.entries.push(record.clone());
        let seq = record.seq;
        // Nobody listening is fine.
        let _ = run.tx.send(LogEvent::Entry(record));
        seq
    }

    /// Full ordered history for a run. Replayable any number of times.
    pub fn history(&self, run_id: RunId) -> Vec<NodeExecution> {
        let runs = self.runs.lock().expect("log mutex poisoned");
        runs.get(&run_id)
            .map(|r| r.entries.clone())
            .unwrap_or_default()
    }

    /// Stream of records appended after this call, ending when the run
    /// reaches a terminal status.
    pub fn subscribe(&self, run_id: RunId) -> LogStream {
        let mut runs = self.runs.lock().expect("log mutex poisoned");
        let buffer = self.buffer;
        let run = runs.entry(run_id).or_insert_with(|| RunLog::new(buffer));
        if run.closed {
            // Already terminal: hand back a stream that ends at once.
            let (tx, rx) = broadcast::channel(1);
            drop(tx);
            return LogStream { rx };
        }
        LogStream {
            rx: run.tx.subscribe(),
        }
    }

    /// Mark the run terminal; open subscriptions end after draining.
    pub fn close_run(&self, run_id: RunId) {
        let mut runs = self.runs.lock().expect("log mutex poisoned");
        if let Some(run) = runs.get_mut(&run_id) {
            run.closed = true;
            let _ = run.tx.send(LogEvent::Closed);
        }
    }
}

/// Lazy sequence of execution-log records for one run
pub struct LogStream {
    rx: broadcast::Receiver<LogEvent>,
}

impl LogStream {
    /// Next appended record, or `None` once the run is terminal.
    pub async fn next(&mut self) -> Option<NodeExecution> {
        loop {
            match self.rx.recv().await {
                Ok(LogEvent::Entry(entry)) => return Some(entry),
                Ok(LogEvent::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "log subscriber lagged, entries dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
