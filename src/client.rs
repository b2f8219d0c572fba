use std::sync::Arc;
use std::time::Duration;

use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    error::ApplicationError,
    manager::PieceManager,
    peer::{PeerEvent, SharedManager, WorkerContext, run_worker},
    protocol::PeerId,
    queue::PeerQueue,
    storage::Storage,
    torrent::Torrent,
    tracker::{Tracker, generate_peer_id},
};

/// How a download ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Every piece was verified and written
    Complete,
    /// Stopped before completion
    Aborted,
}

/// A download that has not been started yet
pub struct Client {
    torrent: Torrent,
    config:  Config,
    peer_id: PeerId,
}

impl Client {
    pub fn new(torrent: Torrent, config: Config) -> Self {
        Self {
            torrent,
            config,
            peer_id: generate_peer_id(),
        }
    }

    /// Spawns the worker pool and the coordinator, writing verified pieces
    /// to `storage`. Must be called from within a tokio runtime.
    pub fn start(self, storage: Box<dyn Storage>) -> Result<ClientHandle, ApplicationError> {
        let tracker = Tracker::new(&self.torrent, self.peer_id, &self.config)?;
        let manager = Arc::new(Mutex::new(PieceManager::new(
            &self.torrent,
            self.config.block_size,
            self.config.pending_timeout,
            storage,
        )));
        let queue = PeerQueue::new();
        let stop = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let config = Arc::new(self.config);

        let ctx = WorkerContext {
            queue:     Arc::clone(&queue),
            manager:   Arc::clone(&manager),
            events:    events_tx,
            info_hash: self.torrent.info_hash(),
            peer_id:   self.peer_id,
            config:    Arc::clone(&config),
            stop:      stop.clone(),
        };
        let workers = (0..config.max_peer_connections)
            .map(|worker| tokio::spawn(run_worker(worker, ctx.clone())))
            .collect();
        info!(workers = config.max_peer_connections, "download started");

        let coordinator = Coordinator {
            manager,
            queue,
            tracker,
            events: events_rx,
            workers,
            config,
            stop: stop.clone(),
        };

        Ok(ClientHandle {
            stop,
            task: tokio::spawn(coordinator.run()),
        })
    }
}

/// Control over a running download
pub struct ClientHandle {
    stop: CancellationToken,
    task: JoinHandle<Result<DownloadOutcome, ApplicationError>>,
}

impl ClientHandle {
    /// Aborts the download. Calling it again has no further effect.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!("stopping download");
        }
        self.stop.cancel();
    }

    /// A token that stops the download when cancelled
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Waits for the download to finish and every worker to exit
    pub async fn wait(self) -> Result<DownloadOutcome, ApplicationError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ApplicationError::WorkerError(format!(
                "coordinator task failed: {}",
                e
            ))),
        }
    }
}

/// Interval until the next announce, never shorter than the retry delay
fn announce_interval(reported: u64, config: &Config) -> Duration {
    Duration::from_secs(reported).max(config.announce_retry)
}

struct Coordinator {
    manager: SharedManager,
    queue:   Arc<PeerQueue>,
    tracker: Tracker,
    events:  mpsc::UnboundedReceiver<PeerEvent>,
    workers: Vec<JoinHandle<Result<(), ApplicationError>>>,
    config:  Arc<Config>,
    stop:    CancellationToken,
}

impl Coordinator {
    async fn run(mut self) -> Result<DownloadOutcome, ApplicationError> {
        let outcome = self.download().await;

        self.stop.cancel();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                error!(error = %e, "worker task failed");
            }
        }
        let closed = self.manager.lock().await.close();
        self.tracker.close();

        let outcome = outcome?;
        closed?;
        info!(?outcome, "download finished");
        Ok(outcome)
    }

    async fn download(&mut self) -> Result<DownloadOutcome, ApplicationError> {
        let mut interval = self.config.default_announce_interval;
        let mut next_announce = Instant::now();
        let mut events_open = true;

        loop {
            if self.manager.lock().await.complete() {
                return Ok(DownloadOutcome::Complete);
            }
            if self.stop.is_cancelled() {
                return Ok(DownloadOutcome::Aborted);
            }
            self.reap_workers().await?;

            if Instant::now() >= next_announce {
                let (uploaded, downloaded, left, verified) = {
                    let manager = self.manager.lock().await;
                    (
                        manager.bytes_uploaded(),
                        manager.bytes_downloaded(),
                        manager.bytes_left(),
                        manager.verified_pieces(),
                    )
                };
                info!(verified, downloaded, left, "announcing progress");

                let announce = tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => continue,
                    announce = self.tracker.announce(uploaded, downloaded, left) => announce,
                };
                match announce {
                    Ok(response) => {
                        interval = announce_interval(response.interval, &self.config);
                        self.queue.replace(response.peers).await;
                        next_announce = Instant::now() + interval;
                    }
                    Err(e) => {
                        let retry = interval.min(self.config.announce_retry);
                        warn!(error = %e, retry = ?retry, "announce failed");
                        next_announce = Instant::now() + retry;
                    }
                }
                continue;
            }

            tokio::select! {
                _ = self.stop.cancelled() => {}
                _ = sleep(self.config.idle_interval) => {}
                event = self.events.recv(), if events_open => match event {
                    Some(PeerEvent::BlockRetrieved { piece, offset, .. }) => {
                        debug!(piece, offset, "block retrieved");
                    }
                    None => events_open = false,
                },
            }
        }
    }

    /// Collects workers that exited on their own. A worker only does so on
    /// an error that is not tied to a single peer, which ends the download.
    async fn reap_workers(&mut self) -> Result<(), ApplicationError> {
        let mut i = 0;
        while i < self.workers.len() {
            if !self.workers[i].is_finished() {
                i += 1;
                continue;
            }
            match self.workers.swap_remove(i).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => error!(error = %e, "worker task failed"),
            }
        }

        if self.workers.is_empty() {
            return Err(ApplicationError::WorkerError("no workers left".into()));
        }
        Ok(())
    }
}
