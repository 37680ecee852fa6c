//! Fixed set of workers draining the bus queues.
//!
//! Workers share each queue's receiver behind an async mutex, so every task is
//! taken by exactly one worker. A failed task is logged and the worker moves
//! on; its offset is stored unless the failure was transient.

use crate::kafka_consumer::{Acknowledger, SegmentEvent, Task, VehicleMintEvent};
use crate::segment_processor::{SegmentError, TaskHandler};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type SharedQueue<E> = Arc<Mutex<mpsc::Receiver<Task<E>>>>;

/// Running segment and vehicle workers
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawn `worker_count` segment workers and one vehicle worker
    pub fn spawn<H>(
        handler: Arc<H>,
        acknowledger: Arc<dyn Acknowledger>,
        segments: mpsc::Receiver<Task<SegmentEvent>>,
        vehicles: mpsc::Receiver<Task<VehicleMintEvent>>,
        worker_count: usize,
        shutdown: CancellationToken,
    ) -> Self
    where
        H: TaskHandler<SegmentEvent> + TaskHandler<VehicleMintEvent> + 'static,
    {
        let segments: SharedQueue<SegmentEvent> = Arc::new(Mutex::new(segments));
        let vehicles: SharedQueue<VehicleMintEvent> = Arc::new(Mutex::new(vehicles));

        let mut handles = Vec::with_capacity(worker_count + 1);
        for worker_id in 0..worker_count {
            handles.push(tokio::spawn(run_worker::<SegmentEvent, H>(
                "segment",
                worker_id,
                handler.clone(),
                acknowledger.clone(),
                segments.clone(),
                shutdown.clone(),
            )));
        }
        handles.push(tokio::spawn(run_worker::<VehicleMintEvent, H>(
            "vehicle",
            0,
            handler,
            acknowledger,
            vehicles,
            shutdown.clone(),
        )));

        info!(segment_workers = worker_count, "Worker pool started");

        Self { handles, shutdown }
    }

    /// Stop taking tasks and wait up to `drain_timeout` for in-flight ones.
    /// Returns false if tasks had to be abandoned.
    pub async fn shutdown(self, drain_timeout: Duration) -> bool {
        self.shutdown.cancel();

        let aborts: Vec<AbortHandle> = self.handles.iter().map(|h| h.abort_handle()).collect();
        let drained = futures::future::join_all(self.handles);

        match tokio::time::timeout(drain_timeout, drained).await {
            Ok(_) => {
                info!("Worker pool drained");
                true
            }
            Err(_) => {
                warn!(
                    timeout_secs = drain_timeout.as_secs(),
                    "Drain timeout elapsed, abandoning in-flight tasks"
                );
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}

async fn run_worker<E, H>(
    queue_name: &'static str,
    worker_id: usize,
    handler: Arc<H>,
    acknowledger: Arc<dyn Acknowledger>,
    queue: SharedQueue<E>,
    shutdown: CancellationToken,
) where
    E: Send + Sync + 'static,
    H: TaskHandler<E> + ?Sized,
{
    debug!(queue = queue_name, worker_id, "Worker started");

    loop {
        let task = {
            let mut receiver = queue.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                task = receiver.recv() => task,
            }
        };
        let Some(task) = task else {
            break;
        };

        let result = handler.handle(&task.event).await;
        settle(queue_name, worker_id, &task, result, acknowledger.as_ref());
    }

    debug!(queue = queue_name, worker_id, "Worker stopped");
}

/// Log a finished task and store its offset unless it should be redelivered
fn settle<E>(
    queue_name: &'static str,
    worker_id: usize,
    task: &Task<E>,
    result: Result<(), SegmentError>,
    acknowledger: &dyn Acknowledger,
) {
    match result {
        Ok(()) => acknowledger.acknowledge(&task.delivery),
        Err(e) => {
            let class = e.class();
            error!(
                error = %e,
                class = class.as_str(),
                stage = e.stage(),
                queue = queue_name,
                worker_id,
                event_id = %task.event.id,
                subject = %task.event.subject,
                partition = task.delivery.partition,
                offset = task.delivery.offset,
                "Task failed"
            );
            metrics::counter!("trips.segments.failed", "class" => class.as_str()).increment(1);

            if class.acknowledges() {
                acknowledger.acknowledge(&task.delivery);
            }
        }
    }
}
