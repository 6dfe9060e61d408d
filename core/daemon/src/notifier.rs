//! Change notifications for snapshot consumers.
//!
//! Every mutating store call publishes at most one signal. Subscribers get
//! their own channel; slow consumers coalesce by draining what is pending
//! before they re-read the snapshot.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeSignal {
    pub generation: u64,
}

#[derive(Debug, Default)]
pub struct ChangeNotifier {
    generation: AtomicU64,
    subscribers: Mutex<Vec<Sender<ChangeSignal>>>,
    // Receivers still held; senders are only pruned on publish.
    live: Arc<AtomicUsize>,
}

/// Receiving end of a subscription. Dropping it unsubscribes at once as far
/// as `subscriber_count` is concerned.
#[derive(Debug)]
pub struct Subscription {
    rx: Receiver<ChangeSignal>,
    live: Arc<AtomicUsize>,
}

impl Deref for Subscription {
    type Target = Receiver<ChangeSignal>;

    fn deref(&self) -> &Self::Target {
        &self.rx
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        self.live.fetch_add(1, Ordering::SeqCst);
        Subscription {
            rx,
            live: Arc::clone(&self.live),
        }
    }

    /// Bumps the generation and signals every live subscriber. Subscribers
    /// whose receiver was dropped are pruned here.
    pub fn publish(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let signal = ChangeSignal { generation };

        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(signal).is_ok());
        tracing::trace!(
            generation,
            subscribers = subscribers.len(),
            "Change published"
        );
        generation
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// Drains pending signals and returns the newest one.
pub fn coalesce(rx: &Receiver<ChangeSignal>, first: ChangeSignal) -> ChangeSignal {
    let mut latest = first;
    while let Ok(next) = rx.try_recv() {
        latest = next;
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_every_subscriber() {
        let notifier = ChangeNotifier::new();
        let a = notifier.subscribe();
        let b = notifier.subscribe();

        assert_eq!(notifier.publish(), 1);

        assert_eq!(a.try_recv(), Ok(ChangeSignal { generation: 1 }));
        assert_eq!(b.try_recv(), Ok(ChangeSignal { generation: 1 }));
        assert_eq!(notifier.generation(), 1);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let notifier = ChangeNotifier::new();
        let kept = notifier.subscribe();
        let dropped = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 2);

        drop(dropped);
        assert_eq!(notifier.subscriber_count(), 1);

        notifier.publish();

        assert_eq!(
            notifier
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            1
        );
        assert!(kept.try_recv().is_ok());
    }

    #[test]
    fn coalesce_returns_latest_pending_signal() {
        let notifier = ChangeNotifier::new();
        let rx = notifier.subscribe();
        for _ in 0..3 {
            notifier.publish();
        }

        let first = rx.recv().expect("first signal");
        let latest = coalesce(&rx, first);

        assert_eq!(latest.generation, 3);
        assert!(rx.try_recv().is_err());
    }
}
