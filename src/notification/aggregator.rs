use futures_util::future::{join_all, BoxFuture};
use std::sync::Arc;
use tokio::sync::watch;

use crate::errors::NotificationError;
use crate::event_sourcing::core::EventStreamChangeEvent;

// ============================================================================
// Change Notification Aggregator
// ============================================================================
//
// The set of obligations a save must discharge before it counts as fully
// handled. The store only knows "these events were appended"; interested
// parties (relays, projectors) register factories that turn those events
// into pending operations.
//
// - Factories are deferred: nothing runs until `complete`.
// - All operations run concurrently.
// - The reported failure is the FIRST in registration order, no matter
//   which operation finishes last.
// - A panicking operation is a defect and unwinds through `complete`.
//
// ============================================================================

pub type PendingOperation = BoxFuture<'static, Result<(), NotificationError>>;

type TaskFactory = Box<dyn FnOnce(&[EventStreamChangeEvent]) -> Vec<PendingOperation> + Send>;

pub struct ChangeNotificationAggregator {
    events: Arc<[EventStreamChangeEvent]>,
    factories: Vec<TaskFactory>,
}

impl ChangeNotificationAggregator {
    pub fn new(events: Vec<EventStreamChangeEvent>) -> Self {
        Self {
            events: events.into(),
            factories: Vec::new(),
        }
    }

    pub fn events(&self) -> &[EventStreamChangeEvent] {
        &self.events
    }

    pub fn add_tasks<F>(&mut self, factory: F)
    where
        F: FnOnce(&[EventStreamChangeEvent]) -> Vec<PendingOperation> + Send + 'static,
    {
        self.factories.push(Box::new(factory));
    }

    pub fn registered(&self) -> usize {
        self.factories.len()
    }

    fn into_operations(self) -> Vec<PendingOperation> {
        let events = self.events;
        self.factories
            .into_iter()
            .flat_map(|factory| factory(&events[..]))
            .collect()
    }

    pub async fn complete(self) -> Result<(), NotificationError> {
        let operations = self.into_operations();
        if operations.is_empty() {
            return Ok(());
        }

        let count = operations.len();
        let results = join_all(operations).await;

        let failures = results.iter().filter(|r| r.is_err()).count();
        if failures > 0 {
            tracing::warn!(operations = count, failures = failures, "Post-save obligations failed");
        } else {
            tracing::debug!(operations = count, "Post-save obligations completed");
        }

        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }

    /// Like `complete`, but stops waiting once `shutdown` flips to true.
    ///
    /// Operations already in flight are dropped; any external effect they
    /// already started (a publish, an HTTP call) is not retracted.
    pub async fn complete_until(self, mut shutdown: watch::Receiver<bool>) -> Result<(), NotificationError> {
        if *shutdown.borrow() {
            return Err(NotificationError::Cancelled);
        }

        tokio::select! {
            result = self.complete() => result,
            Ok(_) = shutdown.wait_for(|stop| *stop) => {
                tracing::warn!("Post-save obligations cancelled");
                Err(NotificationError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn failure(tag: &str) -> NotificationError {
        NotificationError::Consumer {
            consumer: tag.to_string(),
            stream: "s".to_string(),
            version: 1,
            message: tag.to_string(),
        }
    }

    fn delayed(ms: u64, result: Result<(), NotificationError>) -> PendingOperation {
        async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            result
        }
        .boxed()
    }

    #[tokio::test]
    async fn test_no_tasks_is_success() {
        let aggregator = ChangeNotificationAggregator::new(Vec::new());
        assert!(aggregator.complete().await.is_ok());
    }

    #[tokio::test]
    async fn test_all_succeed() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut aggregator = ChangeNotificationAggregator::new(Vec::new());

        for _ in 0..3 {
            let ran = ran.clone();
            aggregator.add_tasks(move |_events| {
                vec![async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()]
            });
        }

        assert!(aggregator.complete().await.is_ok());
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_first_failure_in_registration_order_wins() {
        let mut aggregator = ChangeNotificationAggregator::new(Vec::new());

        // Second-registered fails last, third fails first in time
        aggregator.add_tasks(|_| vec![delayed(5, Ok(()))]);
        aggregator.add_tasks(|_| vec![delayed(60, Err(failure("second")))]);
        aggregator.add_tasks(|_| vec![delayed(1, Err(failure("third")))]);

        let err = aggregator.complete().await.unwrap_err();
        assert!(matches!(err, NotificationError::Consumer { ref consumer, .. } if consumer == "second"));
    }

    #[tokio::test]
    async fn test_factories_are_deferred_until_complete() {
        let built = Arc::new(AtomicUsize::new(0));
        let mut aggregator = ChangeNotificationAggregator::new(Vec::new());

        let counter = built.clone();
        aggregator.add_tasks(move |events| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert!(events.is_empty());
            Vec::new()
        });

        assert_eq!(built.load(Ordering::SeqCst), 0);
        assert_eq!(aggregator.registered(), 1);
        aggregator.complete().await.unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "projection invariant broken")]
    async fn test_panics_propagate_as_defects() {
        let mut aggregator = ChangeNotificationAggregator::new(Vec::new());
        aggregator.add_tasks(|_| {
            vec![async {
                if true {
                    panic!("projection invariant broken");
                }
                Ok(())
            }
            .boxed()]
        });
        let _ = aggregator.complete().await;
    }

    #[tokio::test]
    async fn test_cancellation_stops_waiting() {
        let (stop, shutdown) = watch::channel(false);
        let mut aggregator = ChangeNotificationAggregator::new(Vec::new());
        aggregator.add_tasks(|_| vec![delayed(10_000, Ok(()))]);

        let handle = tokio::spawn(aggregator.complete_until(shutdown));
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.send(true).unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(NotificationError::Cancelled)));
    }
}
