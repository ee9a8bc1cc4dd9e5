use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

/// Bounded queue that makes room for new items by discarding the oldest.
///
/// Producers never block. The consumer side is a plain channel receiver.
#[derive(Debug, Clone)]
pub struct DropOldestQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> DropOldestQueue<T> {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = bounded(depth.max(1));
        Self { tx, rx }
    }

    /// Enqueues `item`, returning the item evicted to make room, if any.
    pub fn push(&self, item: T) -> Option<T> {
        let mut item = item;
        let mut evicted = None;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if let Ok(oldest) = self.rx.try_recv() {
                        evicted.get_or_insert(oldest);
                    }
                }
                // Unreachable while `self.rx` is alive.
                Err(TrySendError::Disconnected(back)) => return Some(back),
            }
        }
    }

    pub fn receiver(&self) -> Receiver<T> {
        self.rx.clone()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
