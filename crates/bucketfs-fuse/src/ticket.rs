//! Admission tickets bounding background remote work.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Number of concurrent replication-style calls (upload cancels).
pub const REPLICATOR_TICKETS: usize = 16;
/// Number of concurrent restore-style calls (read-ahead fetches).
pub const RESTORER_TICKETS: usize = 8;

#[derive(Debug, Clone)]
pub struct Ticket {
    total: usize,
    sem: Arc<Semaphore>,
}

impl Ticket {
    pub fn new(total: usize) -> Self {
        let total = total.max(1);
        Self {
            total,
            sem: Arc::new(Semaphore::new(total)),
        }
    }

    /// Waits for a permit. The permit is returned when dropped.
    pub async fn take(&self) -> OwnedSemaphorePermit {
        // the semaphore is never closed
        match Arc::clone(&self.sem).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("ticket semaphore closed"),
        }
    }

    pub fn try_take(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.sem).try_acquire_owned().ok()
    }

    /// Permits currently held.
    pub fn outstanding(&self) -> usize {
        self.total - self.sem.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ticket_bounds_holders() {
        let ticket = Ticket::new(2);
        let a = ticket.take().await;
        let _b = ticket.take().await;
        assert_eq!(ticket.outstanding(), 2);
        assert!(ticket.try_take().is_none());
        drop(a);
        assert!(ticket.try_take().is_some());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let ticket = Ticket::new(1);
        let held = ticket.take().await;
        let waiter = {
            let ticket = ticket.clone();
            tokio::spawn(async move {
                let _p = ticket.take().await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(held);
        waiter.await.unwrap();
        assert_eq!(ticket.outstanding(), 0);
    }
}
