use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, Notify};

use crate::peer::Peer;

/// FIFO of peer addresses shared by the coordinator and all workers.
///
/// Every address handed out is wrapped in a [`PeerTicket`]; the queue counts
/// an address as unfinished from the moment it is pushed until its ticket
/// is dropped (or the address is cleared away unconsumed).
#[derive(Debug, Default)]
pub struct PeerQueue {
    peers:      Mutex<VecDeque<Peer>>,
    available:  Notify,
    unfinished: AtomicUsize,
}

/// A peer taken from the queue. Dropping it marks the peer as done.
#[derive(Debug)]
pub struct PeerTicket {
    peer:  Peer,
    queue: Arc<PeerQueue>,
}

impl PeerTicket {
    pub fn peer(&self) -> &Peer {
        &self.peer
    }
}

impl Drop for PeerTicket {
    fn drop(&mut self) {
        self.queue.unfinished.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PeerQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn push(&self, peer: Peer) {
        let mut queue = self.peers.lock().await;
        queue.push_back(peer);
        self.unfinished.fetch_add(1, Ordering::AcqRel);
        drop(queue);
        self.available.notify_one();
    }

    /// Drops every address still waiting and enqueues `peers` instead
    pub async fn replace(&self, peers: Vec<Peer>) {
        let mut queue = self.peers.lock().await;
        let stale = queue.len();
        queue.clear();
        queue.extend(peers);
        let fresh = queue.len();
        if fresh >= stale {
            self.unfinished.fetch_add(fresh - stale, Ordering::AcqRel);
        } else {
            self.unfinished.fetch_sub(stale - fresh, Ordering::AcqRel);
        }
        drop(queue);

        if fresh > 0 {
            self.available.notify_one();
        }
    }

    /// Waits for the next address
    pub async fn pop(self: &Arc<Self>) -> PeerTicket {
        loop {
            let notified = self.available.notified();
            {
                let mut queue = self.peers.lock().await;
                if let Some(peer) = queue.pop_front() {
                    // pass the wake-up on, more addresses may be waiting
                    if !queue.is_empty() {
                        self.available.notify_one();
                    }
                    return PeerTicket {
                        peer,
                        queue: Arc::clone(self),
                    };
                }
            }
            notified.await;
        }
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }

    /// Addresses queued or still being served
    pub fn unfinished(&self) -> usize {
        self.unfinished.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use super::*;

    fn peer(port: u16) -> Peer {
        Peer {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        }
    }

    #[tokio::test]
    async fn pops_in_fifo_order() {
        let queue = PeerQueue::new();
        queue.push(peer(1)).await;
        queue.push(peer(2)).await;

        assert_eq!(queue.pop().await.peer().port, 1);
        assert_eq!(queue.pop().await.peer().port, 2);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn tickets_keep_accounting_balanced() {
        let queue = PeerQueue::new();
        queue.replace(vec![peer(1), peer(2), peer(3)]).await;
        assert_eq!(queue.unfinished(), 3);

        let ticket = queue.pop().await;
        assert_eq!(queue.unfinished(), 3);

        // stale addresses are dropped, the one being served stays counted
        queue.replace(vec![peer(4)]).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.unfinished(), 2);

        drop(ticket);
        assert_eq!(queue.unfinished(), 1);
        drop(queue.pop().await);
        assert_eq!(queue.unfinished(), 0);
    }

    #[tokio::test]
    async fn waiting_workers_wake_up() {
        let queue = PeerQueue::new();
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.pop().await.peer().port })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.replace(vec![peer(1), peer(2), peer(3)]).await;

        let mut ports = Vec::new();
        for worker in workers {
            ports.push(
                tokio::time::timeout(Duration::from_secs(5), worker)
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        ports.sort();
        assert_eq!(ports, [1, 2, 3]);
    }
}
