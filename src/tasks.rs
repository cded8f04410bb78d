// Long-running workers (consumer tasks, bridge links, shell threads), kept so
// the `threads` command can list them and shutdown can stop them.

use std::sync::{Arc, Mutex};
use std::thread;

use tokio::task::{AbortHandle, JoinHandle};

enum Worker {
    Task(AbortHandle),
    Thread(thread::JoinHandle<()>),
}

/// One row of the `threads` listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub name: String,
    pub kind: &'static str,
    pub running: bool,
}

#[derive(Default)]
pub struct TaskRegistry {
    workers: Mutex<Vec<(String, Worker)>>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, name: String, worker: Worker) {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name, worker));
    }

    pub fn add_task(&self, name: impl Into<String>, handle: &JoinHandle<()>) {
        self.push(name.into(), Worker::Task(handle.abort_handle()));
    }

    pub fn add_thread(&self, name: impl Into<String>, handle: thread::JoinHandle<()>) {
        self.push(name.into(), Worker::Thread(handle));
    }

    /// Workers in registration order
    pub fn status(&self) -> Vec<TaskStatus> {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, worker)| match worker {
                Worker::Task(handle) => TaskStatus {
                    name: name.clone(),
                    kind: "task",
                    running: !handle.is_finished(),
                },
                Worker::Thread(handle) => TaskStatus {
                    name: name.clone(),
                    kind: "thread",
                    running: !handle.is_finished(),
                },
            })
            .collect()
    }

    /// Abort every async task; threads end with the process
    pub fn abort_all(&self) {
        for (_, worker) in self.workers.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            if let Worker::Task(handle) = worker {
                handle.abort();
            }
        }
    }
}
