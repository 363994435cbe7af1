//! # Bounded Queue
//!
//! A fixed-capacity FIFO connecting one producer to one consumer, built on a
//! `crossbeam` bounded channel. On top of the channel it keeps a drain
//! barrier: every pushed item counts as outstanding until the consumer
//! acknowledges it with [`QueueConsumer::task_done`], and
//! [`QueueProducer::join`] waits until nothing is outstanding.
//!
//! The queue never holds more than `capacity` items. A producer facing a full
//! queue either blocks ([`QueueProducer::push`]) or gets the item back
//! ([`QueueProducer::try_push`]) so a cooperative task can yield and retry.
//!
//! Dropping the consumer half marks the queue as abandoned: blocked pushes
//! fail instead of waiting forever, and `join` reports the items that will
//! never be acknowledged.

use crossbeam::channel::{self, RecvTimeoutError, TryRecvError, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue capacity must be greater than zero")]
    ZeroCapacity,
    #[error("queue consumer went away with {outstanding} unacknowledged item(s)")]
    Disconnected { outstanding: usize },
}

/// Returned by [`QueueProducer::try_push`], handing the rejected item back.
#[derive(Debug, PartialEq, Eq)]
pub enum TryPushError<T> {
    Full(T),
    Disconnected(T),
}

impl<T> TryPushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TryPushError::Full(item) | TryPushError::Disconnected(item) => item,
        }
    }
}

#[derive(Debug)]
struct DrainState {
    outstanding: usize,
    consumer_alive: bool,
}

#[derive(Debug)]
struct DrainBarrier {
    state: Mutex<DrainState>,
    drained: Condvar,
}

impl DrainBarrier {
    fn register(&self) {
        self.state.lock().outstanding += 1;
    }

    fn unregister(&self) {
        let mut state = self.state.lock();
        state.outstanding -= 1;
        if state.outstanding == 0 {
            self.drained.notify_all();
        }
    }

    fn disconnected(&self) -> QueueError {
        QueueError::Disconnected {
            outstanding: self.state.lock().outstanding,
        }
    }
}

/// Create a queue holding at most `capacity` items.
pub fn bounded<T>(capacity: usize) -> Result<(QueueProducer<T>, QueueConsumer<T>), QueueError> {
    if capacity == 0 {
        return Err(QueueError::ZeroCapacity);
    }
    let (tx, rx) = channel::bounded(capacity);
    let barrier = Arc::new(DrainBarrier {
        state: Mutex::new(DrainState {
            outstanding: 0,
            consumer_alive: true,
        }),
        drained: Condvar::new(),
    });
    Ok((
        QueueProducer {
            tx,
            barrier: barrier.clone(),
            capacity,
        },
        QueueConsumer { rx, barrier },
    ))
}

/// Sending half of a bounded queue.
#[derive(Debug)]
pub struct QueueProducer<T> {
    tx: channel::Sender<T>,
    barrier: Arc<DrainBarrier>,
    capacity: usize,
}

impl<T> QueueProducer<T> {
    /// Enqueue `item`, blocking while the queue is full.
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        self.barrier.register();
        if self.tx.send(item).is_err() {
            self.barrier.unregister();
            return Err(self.barrier.disconnected());
        }
        Ok(())
    }

    /// Enqueue `item` without blocking.
    pub fn try_push(&self, item: T) -> Result<(), TryPushError<T>> {
        self.barrier.register();
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) => {
                self.barrier.unregister();
                Err(TryPushError::Full(item))
            }
            Err(TrySendError::Disconnected(item)) => {
                self.barrier.unregister();
                Err(TryPushError::Disconnected(item))
            }
        }
    }

    /// Block until every pushed item has been acknowledged.
    pub fn join(&self) -> Result<(), QueueError> {
        let mut state = self.barrier.state.lock();
        while state.outstanding > 0 {
            if !state.consumer_alive {
                return Err(QueueError::Disconnected {
                    outstanding: state.outstanding,
                });
            }
            self.barrier.drained.wait(&mut state);
        }
        Ok(())
    }

    /// Non-blocking form of [`join`](Self::join).
    pub fn is_drained(&self) -> Result<bool, QueueError> {
        let state = self.barrier.state.lock();
        if state.outstanding == 0 {
            Ok(true)
        } else if !state.consumer_alive {
            Err(QueueError::Disconnected {
                outstanding: state.outstanding,
            })
        } else {
            Ok(false)
        }
    }

    /// Items pushed but not yet acknowledged, queued or in flight.
    pub fn outstanding(&self) -> usize {
        self.barrier.state.lock().outstanding
    }

    /// Items currently sitting in the queue.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Receiving half of a bounded queue.
#[derive(Debug)]
pub struct QueueConsumer<T> {
    rx: channel::Receiver<T>,
    barrier: Arc<DrainBarrier>,
}

impl<T> QueueConsumer<T> {
    /// Wait up to `timeout` for an item. `Ok(None)` means the wait timed out,
    /// which is the normal idle case.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<T>, QueueError> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.barrier.disconnected()),
        }
    }

    /// Take an item if one is available.
    pub fn try_pop(&self) -> Result<Option<T>, QueueError> {
        match self.rx.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.barrier.disconnected()),
        }
    }

    /// Acknowledge `count` consumed items.
    pub fn task_done(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut state = self.barrier.state.lock();
        debug_assert!(
            count <= state.outstanding,
            "acknowledged more items than were pushed"
        );
        state.outstanding = state.outstanding.saturating_sub(count);
        if state.outstanding == 0 {
            self.barrier.drained.notify_all();
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> Drop for QueueConsumer<T> {
    fn drop(&mut self) {
        let mut state = self.barrier.state.lock();
        state.consumer_alive = false;
        self.barrier.drained.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(bounded::<u8>(0).unwrap_err(), QueueError::ZeroCapacity);
    }

    #[test]
    fn test_fifo_order_and_capacity() {
        let (producer, consumer) = bounded(3).unwrap();
        producer.push(1).unwrap();
        producer.push(2).unwrap();
        producer.push(3).unwrap();
        assert_eq!(producer.len(), 3);
        assert_eq!(producer.try_push(4), Err(TryPushError::Full(4)));
        assert_eq!(producer.outstanding(), 3);

        assert_eq!(consumer.try_pop().unwrap(), Some(1));
        assert_eq!(consumer.try_pop().unwrap(), Some(2));
        assert_eq!(consumer.try_pop().unwrap(), Some(3));
        assert_eq!(consumer.try_pop().unwrap(), None);
    }

    #[test]
    fn test_pop_timeout_is_not_an_error() {
        let (_producer, consumer) = bounded::<u8>(1).unwrap();
        assert_eq!(
            consumer.pop_timeout(Duration::from_micros(1)).unwrap(),
            None
        );
    }

    #[test]
    fn test_join_waits_for_acknowledgement() {
        let (producer, consumer) = bounded(4).unwrap();
        producer.push(10u32).unwrap();
        producer.push(20u32).unwrap();
        assert!(!producer.is_drained().unwrap());

        let worker = thread::spawn(move || {
            let mut seen = Vec::new();
            while seen.len() < 2 {
                if let Some(item) = consumer.pop_timeout(Duration::from_millis(10)).unwrap() {
                    seen.push(item);
                }
            }
            thread::sleep(Duration::from_millis(20));
            consumer.task_done(2);
            seen
        });

        producer.join().unwrap();
        assert!(producer.is_drained().unwrap());
        assert_eq!(worker.join().unwrap(), vec![10, 20]);
    }

    #[test]
    fn test_dropped_consumer_unblocks_producer() {
        let (producer, consumer) = bounded(1).unwrap();
        producer.push(1u8).unwrap();

        let dropper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(consumer);
        });

        // Queue is full, so this blocks until the consumer is dropped.
        let err = producer.push(2u8).unwrap_err();
        assert_eq!(err, QueueError::Disconnected { outstanding: 1 });
        assert_eq!(
            producer.join().unwrap_err(),
            QueueError::Disconnected { outstanding: 1 }
        );
        assert!(matches!(
            producer.try_push(3u8),
            Err(TryPushError::Disconnected(3))
        ));
        dropper.join().unwrap();
    }
}
