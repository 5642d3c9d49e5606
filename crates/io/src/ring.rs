//! Submission rings.
//!
//! A [`Ring`] is a bounded FIFO of operations serviced by a dedicated worker
//! thread doing positional i/o. Submissions are processed strictly in
//! submission order, so completions for one ring are delivered in submission
//! order too; across rings there is no ordering guarantee. Reads are retried
//! once on transient errors; writes are never retried.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::error;

use crate::aligned::AlignedBuf;

pub(crate) enum Sqe {
    Read { file: Arc<File>, at: u64, len: usize, buf: AlignedBuf, token: u64 },
    Write { file: Arc<File>, at: u64, len: usize, buf: AlignedBuf, token: u64 },
    /// Completes after a delay; test support for completion-chain scenarios.
    Delay { until: Instant, token: u64 },
    /// Completes immediately.
    Nop { token: u64 },
}

pub(crate) struct Cqe {
    pub token: u64,
    pub result: io::Result<usize>,
    pub buf: Option<AlignedBuf>,
}

/// One submission queue plus its worker thread.
pub struct Ring {
    tx: Option<Sender<Sqe>>,
    rx: Receiver<Cqe>,
    worker: Option<JoinHandle<()>>,
}

impl Ring {
    pub fn new(name: &'static str, depth: usize) -> Self {
        let (tx, srx) = bounded::<Sqe>(depth.max(1));
        let (ctx, rx) = bounded::<Cqe>(depth.max(1) * 2);
        let worker = thread::Builder::new()
            .name(format!("triedb-ring-{name}"))
            .spawn(move || worker_loop(srx, ctx))
            .unwrap_or_else(|e| panic!("spawning ring worker failed: {e}"));
        Self { tx: Some(tx), rx, worker: Some(worker) }
    }

    /// Enqueues an operation. Blocks when the queue is at depth, which is the
    /// submission-side backpressure.
    pub(crate) fn submit(&self, sqe: Sqe) {
        if let Some(tx) = &self.tx {
            // The worker only exits after the sender is dropped.
            let _ = tx.send(sqe);
        }
    }

    pub(crate) fn completions(&self) -> &Receiver<Cqe> {
        &self.rx
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(rx: Receiver<Sqe>, tx: Sender<Cqe>) {
    while let Ok(sqe) = rx.recv() {
        let cqe = match sqe {
            Sqe::Read { file, at, len, mut buf, token } => {
                let mut result = read_fully(&file, at, &mut buf[..len]);
                if let Err(e) = &result {
                    if is_transient(e) {
                        result = read_fully(&file, at, &mut buf[..len]);
                    }
                }
                if let Err(e) = &result {
                    error!(target: "ring", at, len, "read failed: {e}");
                }
                Cqe { token, result: result.map(|()| len), buf: Some(buf) }
            }
            Sqe::Write { file, at, len, buf, token } => {
                let result = file.write_all_at(&buf[..len], at);
                if let Err(e) = &result {
                    error!(target: "ring", at, len, "write failed: {e}");
                }
                Cqe { token, result: result.map(|()| len), buf: Some(buf) }
            }
            Sqe::Delay { until, token } => {
                let now = Instant::now();
                if until > now {
                    thread::sleep(until - now);
                }
                Cqe { token, result: Ok(0), buf: None }
            }
            Sqe::Nop { token } => Cqe { token, result: Ok(0), buf: None },
        };
        if tx.send(cqe).is_err() {
            return;
        }
    }
}

fn read_fully(file: &File, at: u64, buf: &mut [u8]) -> io::Result<()> {
    file.read_exact_at(buf, at)
}

fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
}

pub(crate) fn delay_sqe(dur: Duration, token: u64) -> Sqe {
    Sqe::Delay { until: Instant::now() + dur, token }
}
