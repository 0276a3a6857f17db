// src/worker.rs
//! Worker pool consuming the bounded job queue.
//!
//! In Reactor mode the worker performs the read or write syscall itself
//! before processing; in Proactor mode the reactor has already read and
//! the worker only parses and processes. Either way the worker rearms the
//! descriptor when it is done (inside `process`/`write`), so the one-shot
//! discipline holds: no second event for the fd can arrive while a worker
//! still owns it. A connection a worker wants closed is handed back to
//! the reactor over the reclaim channel plus a self-pipe nudge.

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;

use crate::config::ConcurrencyMode;
use crate::error::{EmberError, EmberResult};
use crate::queue::BlockQueue;
use crate::router::Router;
use crate::server::Shared;
use crate::store::StorePool;
use crate::sync::lock_or_recover;
use crate::syscalls;

/// Which half of the exchange a Reactor-mode job covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Read,
    Write,
}

#[derive(Clone, Copy)]
pub(crate) struct Job {
    fd: i32,
    phase: Phase,
}

pub struct WorkerPool {
    queue: Arc<BlockQueue<Job>>,
}

impl WorkerPool {
    pub(crate) fn new(
        mode: ConcurrencyMode,
        thread_num: usize,
        max_request: usize,
        shared: Arc<Shared>,
        router: Arc<Router>,
        stores: Arc<StorePool>,
        reclaim: Sender<i32>,
    ) -> EmberResult<Self> {
        if thread_num == 0 {
            return Err(EmberError::Config("worker count must be positive".into()));
        }
        if max_request == 0 {
            return Err(EmberError::Config(
                "work queue capacity must be positive".into(),
            ));
        }
        let queue = Arc::new(BlockQueue::new(max_request));
        for i in 0..thread_num {
            let queue = Arc::clone(&queue);
            let shared = Arc::clone(&shared);
            let router = Arc::clone(&router);
            let stores = Arc::clone(&stores);
            let reclaim = reclaim.clone();
            thread::Builder::new()
                .name(format!("ember-worker-{}", i))
                .spawn(move || worker_loop(mode, queue, shared, router, stores, reclaim))
                .map_err(EmberError::Io)?;
        }
        Ok(Self { queue })
    }

    /// Reactor-mode enqueue, tagging the phase. `false` when the queue is
    /// at capacity; the caller decides what to do with the event.
    pub(crate) fn append(&self, fd: i32, phase: Phase) -> bool {
        self.queue.push(Job { fd, phase })
    }

    /// Proactor-mode enqueue; the worker always processes.
    pub(crate) fn append_p(&self, fd: i32) -> bool {
        self.queue.push(Job {
            fd,
            phase: Phase::Read,
        })
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

fn worker_loop(
    mode: ConcurrencyMode,
    queue: Arc<BlockQueue<Job>>,
    shared: Arc<Shared>,
    router: Arc<Router>,
    stores: Arc<StorePool>,
    reclaim: Sender<i32>,
) {
    loop {
        let job = queue.pop();
        let slot = match shared.conns.get(job.fd as usize) {
            Some(slot) => slot,
            None => continue,
        };
        let mut conn = lock_or_recover(slot);
        if !conn.is_open() {
            continue;
        }
        let keep = match mode {
            ConcurrencyMode::Reactor => match job.phase {
                Phase::Read => {
                    if conn.read_once() {
                        let mut guard = stores.acquire();
                        conn.process(&shared.epoll, &router, guard.store())
                    } else {
                        false
                    }
                }
                Phase::Write => conn.write(&shared.epoll),
            },
            ConcurrencyMode::Proactor => {
                let mut guard = stores.acquire();
                conn.process(&shared.epoll, &router, guard.store())
            }
        };
        drop(conn);
        if !keep && reclaim.send(job.fd).is_ok() {
            syscalls::notify_pipe(shared.pipe_wr, syscalls::RECLAIM_TOKEN);
        }
    }
}
