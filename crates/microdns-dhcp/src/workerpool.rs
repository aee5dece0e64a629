//! WorkerPool (§4.10): a fixed-size pool of tasks draining a bounded
//! `tokio::sync::mpsc` channel, so a burst of datagrams queues rather than
//! spawning unbounded `tokio::spawn`s per packet. Grounded on the donor's
//! per-datagram `tokio::spawn` dispatch in `v4/server.rs`/`v6/server.rs`,
//! generalized into a bounded pool per the spec.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool queue is full or shutting down")]
    Full,
}

/// One inbound datagram, handed to a worker by value.
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub peer: SocketAddr,
}

pub struct WorkerPool {
    tx: mpsc::Sender<Datagram>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` tasks, each looping on `rx.recv()` and invoking
    /// `handle` for every datagram. `handle` must run the full state machine
    /// without holding any shared lock across its own `.await` points.
    pub fn create<F, Fut>(workers: usize, queue_capacity: usize, handle: F) -> Self
    where
        F: Fn(Datagram) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handle = Arc::new(handle);

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let rx = rx.clone();
            let handle = handle.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let datagram = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    match datagram {
                        Some(d) => handle(d).await,
                        None => break,
                    }
                }
            }));
        }

        WorkerPool { tx, handles }
    }

    /// Enqueues a datagram for processing; fails if the queue is full or the
    /// pool has started shutting down.
    pub fn dispatch(&self, datagram: Datagram) -> Result<(), WorkerPoolError> {
        self.tx.try_send(datagram).map_err(|_| WorkerPoolError::Full)
    }

    /// Closes the channel (workers drain remaining items and exit) and waits
    /// for every worker task to finish.
    pub async fn destroy(self) {
        drop(self.tx);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
