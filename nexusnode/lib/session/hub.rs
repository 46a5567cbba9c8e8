use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{Mutex, MutexGuard},
};

use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::models::SessionFrame;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A boxed stream of session frames.
pub type FrameStream<T> = Pin<Box<dyn Stream<Item = SessionFrame<T>> + Send>>;

/// Single-producer fan-out with a bounded replay backlog.
///
/// Every subscriber sees the backlog and then live items in publish order. A subscriber that
/// falls more than `capacity` items behind loses the oldest ones and is told how many. The
/// producer never waits for subscribers.
pub struct Hub<T> {
    capacity: usize,
    state: Mutex<HubState<T>>,
}

struct HubState<T> {
    backlog: VecDeque<T>,
    sender: Option<broadcast::Sender<T>>,
}

/// A consistent view of a hub taken at subscription time.
pub struct Subscription<T> {
    backlog: Vec<T>,
    receiver: Option<broadcast::Receiver<T>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<T> Hub<T>
where
    T: Clone + Send + 'static,
{
    /// Creates an open hub that buffers up to `capacity` items.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);

        Self {
            capacity,
            state: Mutex::new(HubState {
                backlog: VecDeque::with_capacity(capacity),
                sender: Some(sender),
            }),
        }
    }

    /// Delivers an item to every subscriber. Ignored once the hub is closed.
    pub fn publish(&self, item: T) {
        let mut state = self.lock();
        let Some(sender) = state.sender.clone() else {
            return;
        };

        if state.backlog.len() == self.capacity {
            state.backlog.pop_front();
        }
        state.backlog.push_back(item.clone());

        let _ = sender.send(item);
    }

    /// Subscribes to the backlog and all future items.
    pub fn subscribe(&self) -> Subscription<T> {
        let state = self.lock();
        Subscription {
            backlog: state.backlog.iter().cloned().collect(),
            receiver: state.sender.as_ref().map(|sender| sender.subscribe()),
        }
    }

    /// Closes the hub. Subscribers drain what they have and then see the end marker.
    pub fn close(&self) {
        self.lock().sender = None;
    }

    /// Whether the hub has been closed.
    pub fn is_closed(&self) -> bool {
        self.lock().sender.is_none()
    }

    fn lock(&self) -> MutexGuard<'_, HubState<T>> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T> Subscription<T>
where
    T: Clone + Send + 'static,
{
    /// A subscription that is already over.
    pub fn ended() -> Self {
        Self {
            backlog: Vec::new(),
            receiver: None,
        }
    }

    /// Turns the subscription into a frame stream that ends with [`SessionFrame::End`].
    ///
    /// Cancelling `cancel` ends the stream early. `guard` is dropped together with the stream.
    pub fn into_frames<G>(self, cancel: CancellationToken, guard: G) -> FrameStream<T>
    where
        G: Send + 'static,
    {
        let Subscription { backlog, receiver } = self;

        Box::pin(async_stream::stream! {
            let _guard = guard;

            for item in backlog {
                if cancel.is_cancelled() {
                    break;
                }
                yield SessionFrame::Event(item);
            }

            if let Some(mut receiver) = receiver {
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        next = receiver.recv() => next,
                    };

                    match next {
                        Ok(item) => yield SessionFrame::Event(item),
                        Err(RecvError::Lagged(count)) => yield SessionFrame::Dropped { count },
                        Err(RecvError::Closed) => break,
                    }
                }
            }

            yield SessionFrame::End;
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn test_late_subscriber_sees_backlog_then_live_items() {
        let hub = Hub::new(8);
        hub.publish(1);
        hub.publish(2);

        let mut frames = hub.subscribe().into_frames(CancellationToken::new(), ());
        hub.publish(3);
        hub.close();

        let collected: Vec<_> = frames.by_ref().collect().await;
        assert_eq!(
            collected,
            vec![
                SessionFrame::Event(1),
                SessionFrame::Event(2),
                SessionFrame::Event(3),
                SessionFrame::End
            ]
        );
    }

    #[tokio::test]
    async fn test_backlog_is_bounded() {
        let hub = Hub::new(2);
        for i in 0..5 {
            hub.publish(i);
        }
        hub.close();

        let collected: Vec<_> = hub
            .subscribe()
            .into_frames(CancellationToken::new(), ())
            .collect()
            .await;
        assert_eq!(
            collected,
            vec![SessionFrame::Event(3), SessionFrame::Event(4), SessionFrame::End]
        );
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_told_about_drops() {
        let hub = Hub::new(2);
        let slow = hub.subscribe();

        for i in 0..5 {
            hub.publish(i);
        }
        hub.close();

        let collected: Vec<_> = slow
            .into_frames(CancellationToken::new(), ())
            .collect()
            .await;
        assert_eq!(
            collected,
            vec![
                SessionFrame::Dropped { count: 3 },
                SessionFrame::Event(3),
                SessionFrame::Event(4),
                SessionFrame::End
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_ends_one_stream_only() {
        let hub = Hub::new(8);
        let cancel = CancellationToken::new();
        let mut first = hub.subscribe().into_frames(cancel.clone(), ());
        let mut second = hub.subscribe().into_frames(CancellationToken::new(), ());

        hub.publish("a");
        assert_eq!(first.next().await, Some(SessionFrame::Event("a")));
        cancel.cancel();
        assert_eq!(first.next().await, Some(SessionFrame::End));
        assert_eq!(first.next().await, None);

        hub.publish("b");
        assert_eq!(second.next().await, Some(SessionFrame::Event("a")));
        assert_eq!(second.next().await, Some(SessionFrame::Event("b")));
    }

    #[tokio::test]
    async fn test_closed_hub_subscription_ends_immediately() {
        let hub: Hub<u8> = Hub::new(4);
        hub.close();
        assert!(hub.is_closed());

        hub.publish(1);
        let collected: Vec<_> = hub
            .subscribe()
            .into_frames(CancellationToken::new(), ())
            .collect()
            .await;
        assert_eq!(collected, vec![SessionFrame::End]);
    }
}
