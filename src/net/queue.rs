// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! A bounded outbound queue: `try_send` rejects once full rather than
//! blocking, so a slow peer backs off the sender instead of stalling it.

use amplify::{Display, Error};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum QueueError {
    /// queue is at capacity.
    Full,
}

pub struct Queue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    pub fn try_send(&self, item: T) -> Result<(), QueueError> {
        self.tx.try_send(item).map_err(|err| match err {
            TrySendError::Full(_) | TrySendError::Disconnected(_) => QueueError::Full,
        })
    }

    pub fn pop(&self) -> Option<T> { self.rx.try_recv().ok() }

    pub fn len(&self) -> usize { self.tx.len() }

    pub fn is_empty(&self) -> bool { self.tx.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_once_at_capacity() {
        let q: Queue<u8> = Queue::new(2);
        q.try_send(1).unwrap();
        q.try_send(2).unwrap();
        assert!(matches!(q.try_send(3), Err(QueueError::Full)));
        assert_eq!(q.pop(), Some(1));
        q.try_send(3).unwrap();
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert!(q.is_empty());
    }
}
