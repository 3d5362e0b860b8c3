use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::chunk::OutputChunk;

pub const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle of a [`StreamChannel`].
///
/// A channel leaves `Alive` exactly once. `TimedOut` is set when the
/// activity timeout elapses, which lets logs tell a stalled producer
/// apart from a graceful `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Alive,
    Ended,
    TimedOut,
    Disconnected,
}

impl ChannelStatus {
    pub fn is_terminal(self) -> bool {
        self != ChannelStatus::Alive
    }
}

struct Inner {
    queue: VecDeque<OutputChunk>,
    status: ChannelStatus,
    last_activity: Instant,
}

/// Per-request FIFO of output chunks shared between the dispatched model
/// handler (producer) and the HTTP response writer (consumer).
///
/// Any number of producers and consumers may share one channel through an
/// `Arc`. Writes fail once the channel is terminated, and the channel
/// terminates itself when no activity is observed for the configured
/// timeout. `end` keeps already-queued chunks drainable; `disconnect` is
/// set by the HTTP layer when the client has gone away and additionally
/// forbids further writes.
pub struct StreamChannel {
    timeout: Duration,
    state: Mutex<Inner>,
    notify: Notify,
}

impl StreamChannel {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(Inner {
                queue: VecDeque::new(),
                status: ChannelStatus::Alive,
                last_activity: Instant::now(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Transitions to `TimedOut` when the activity timeout has elapsed.
    /// Returns true only on the transition itself, matching the read
    /// contract: the observation that discovers the timeout yields
    /// nothing, later reads may still drain the queue.
    fn poll_timeout(&self, inner: &mut Inner) -> bool {
        if inner.status == ChannelStatus::Alive && inner.last_activity.elapsed() > self.timeout {
            inner.status = ChannelStatus::TimedOut;
            self.notify.notify_waiters();
            return true;
        }
        false
    }

    /// Queue a chunk. Fails when the channel is ended, disconnected, or
    /// the activity timeout has already elapsed. On success the activity
    /// clock is refreshed and one waiter is woken.
    pub fn push(&self, chunk: OutputChunk) -> bool {
        {
            let mut inner = self.state.lock().unwrap();
            if inner.status.is_terminal() || self.poll_timeout(&mut inner) {
                return false;
            }
            inner.queue.push_back(chunk);
            inner.last_activity = Instant::now();
        }
        self.notify.notify_one();
        true
    }

    /// Mark the stream complete. Queued chunks stay drainable.
    pub fn end(&self) {
        {
            let mut inner = self.state.lock().unwrap();
            if inner.status == ChannelStatus::Alive {
                inner.status = ChannelStatus::Ended;
            }
        }
        self.notify.notify_waiters();
    }

    /// The client went away: implies `end` and forbids further writes.
    pub fn disconnect(&self) {
        {
            let mut inner = self.state.lock().unwrap();
            inner.status = ChannelStatus::Disconnected;
        }
        self.notify.notify_waiters();
    }

    /// True once the channel is terminated *and* fully drained.
    pub fn is_ended(&self) -> bool {
        let mut inner = self.state.lock().unwrap();
        self.poll_timeout(&mut inner);
        inner.status.is_terminal() && inner.queue.is_empty()
    }

    pub fn is_writable(&self) -> bool {
        self.status() == ChannelStatus::Alive
    }

    pub fn is_alive(&self) -> bool {
        self.status() == ChannelStatus::Alive
    }

    /// Current lifecycle state, observing the activity timeout first.
    pub fn status(&self) -> ChannelStatus {
        let mut inner = self.state.lock().unwrap();
        self.poll_timeout(&mut inner);
        inner.status
    }

    pub fn reset_timeout(&self) {
        let mut inner = self.state.lock().unwrap();
        inner.last_activity = Instant::now();
    }

    /// Non-blocking pop, in push order.
    pub fn try_pop(&self) -> Option<OutputChunk> {
        let mut inner = self.state.lock().unwrap();
        if self.poll_timeout(&mut inner) {
            return None;
        }
        inner.queue.pop_front()
    }

    /// Pop, waiting until a chunk is available, the channel terminates,
    /// or the activity timeout elapses.
    pub async fn wait_pop(&self) -> Option<OutputChunk> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut inner = self.state.lock().unwrap();
                if self.poll_timeout(&mut inner) {
                    return None;
                }
                if let Some(chunk) = inner.queue.pop_front() {
                    return Some(chunk);
                }
                if inner.status.is_terminal() {
                    return None;
                }
                inner.last_activity + self.timeout
            };

            tokio::select! {
                _ = notified.as_mut() => {}
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
            }
        }
    }

    /// Like [`wait_pop`](Self::wait_pop), but gives up after `wait`
    /// regardless of the activity timeout.
    pub async fn wait_pop_for(&self, wait: Duration) -> Option<OutputChunk> {
        tokio::time::timeout(wait, self.wait_pop())
            .await
            .ok()
            .flatten()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().queue.is_empty()
    }
}

impl Default for StreamChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn basic_push_pop() {
        let ch = StreamChannel::default();
        assert!(ch.push(OutputChunk::text_delta("Hello", "gpt-4")));
        assert!(ch.push(OutputChunk::text_delta(" World", "gpt-4")));
        ch.end();

        match ch.try_pop() {
            Some(OutputChunk::TextDelta { text, .. }) => assert_eq!(text, "Hello"),
            other => panic!("unexpected: {other:?}"),
        }
        match ch.try_pop() {
            Some(OutputChunk::TextDelta { text, .. }) => assert_eq!(text, " World"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(ch.try_pop().is_none());
        assert!(ch.is_ended());
    }

    #[tokio::test]
    async fn push_after_end_fails() {
        let ch = StreamChannel::default();
        ch.end();
        assert!(!ch.push(OutputChunk::text_delta("late", "gpt-4")));
        assert!(!ch.is_writable());
    }

    #[tokio::test]
    async fn disconnect_forbids_writes_and_ends() {
        let ch = StreamChannel::default();
        assert!(ch.push(OutputChunk::text_delta("x", "gpt-4")));
        ch.disconnect();
        assert!(!ch.push(OutputChunk::text_delta("y", "gpt-4")));
        assert_eq!(ch.status(), ChannelStatus::Disconnected);
    }

    #[tokio::test]
    async fn wait_pop_blocks_until_data() {
        let ch = Arc::new(StreamChannel::default());
        let producer = {
            let ch = ch.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                ch.push(OutputChunk::text_delta("delayed", "gpt-4"));
                ch.end();
            })
        };

        match ch.wait_pop().await {
            Some(OutputChunk::TextDelta { text, .. }) => assert_eq!(text, "delayed"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(ch.wait_pop().await.is_none());
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn activity_timeout_self_terminates() {
        let ch = StreamChannel::new(Duration::from_millis(200));
        assert!(ch.push(OutputChunk::text_delta("data", "gpt-4")));
        assert!(ch.try_pop().is_some());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(ch.is_ended());
        assert_eq!(ch.status(), ChannelStatus::TimedOut);
        assert!(!ch.push(OutputChunk::text_delta("late", "gpt-4")));
    }

    #[tokio::test]
    async fn push_refreshes_activity_clock() {
        let ch = StreamChannel::new(Duration::from_millis(200));
        assert!(ch.push(OutputChunk::text_delta("1", "gpt-4")));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(ch.push(OutputChunk::text_delta("2", "gpt-4")));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(!ch.is_ended());
        match ch.try_pop() {
            Some(OutputChunk::TextDelta { text, .. }) => assert_eq!(text, "1"),
            other => panic!("unexpected: {other:?}"),
        }
        match ch.try_pop() {
            Some(OutputChunk::TextDelta { text, .. }) => assert_eq!(text, "2"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_pop_for_gives_up() {
        let ch = StreamChannel::default();
        let start = Instant::now();
        assert!(ch.wait_pop_for(Duration::from_millis(50)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn all_pushed_chunks_are_drained() {
        let ch = Arc::new(StreamChannel::default());
        let n = 1000;
        let producer = {
            let ch = ch.clone();
            tokio::spawn(async move {
                for i in 0..n {
                    assert!(ch.push(OutputChunk::text_delta(i.to_string(), "gpt-4")));
                }
                ch.end();
            })
        };

        let mut count = 0;
        while let Some(chunk) = ch.wait_pop().await {
            assert!(!chunk.is_end());
            count += 1;
        }
        producer.await.unwrap();
        assert_eq!(count, n);
    }

    #[tokio::test]
    async fn end_keeps_queued_chunks_drainable() {
        let ch = StreamChannel::default();
        ch.push(OutputChunk::text_delta("kept", "gpt-4"));
        ch.end();
        assert!(!ch.is_ended());
        assert!(ch.wait_pop().await.is_some());
        assert!(ch.is_ended());
    }
}
