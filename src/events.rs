use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::sync::lock;

/// A list of event listeners. Each subscriber gets its own channel; dropping the
/// receiver unsubscribes it.
///
/// Sending never blocks and is never awaited by the emitter.
pub struct Subscribers<E> {
    senders: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E: Clone> Subscribers<E> {
    pub fn new() -> Self {
        Subscribers {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.senders).push(tx);
        rx
    }

    pub fn emit(&self, event: E) {
        // Senders whose receiver is gone are pruned here.
        lock(&self.senders).retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        lock(&self.senders)
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Clone> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropped_receiver_unsubscribes() {
        let subscribers = Subscribers::<u32>::new();
        let mut first = subscribers.subscribe();
        let second = subscribers.subscribe();
        assert_eq!(subscribers.len(), 2);

        drop(second);
        subscribers.emit(7);
        assert_eq!(first.try_recv().unwrap(), 7);
        assert_eq!(subscribers.len(), 1);
    }
}
