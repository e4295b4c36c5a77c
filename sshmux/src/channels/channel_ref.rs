use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;

use crate::{ChannelMsg, Error};

/// The peer's window on one channel: how many bytes we may still send.
///
/// Shared between the connection's event loop, which credits it on
/// `CHANNEL_WINDOW_ADJUST`, and the writers of the channel, which take
/// credit from it before handing data to the event loop.
#[derive(Debug, Clone)]
pub struct WindowSizeRef {
    state: Arc<Mutex<WindowState>>,
    notify: Arc<Notify>,
}

#[derive(Debug)]
struct WindowState {
    size: u32,
    closed: bool,
    /// EOF was sent or queued: writers may not add data.
    writes_finished: bool,
}

impl WindowSizeRef {
    pub fn new(size: u32) -> Self {
        WindowSizeRef {
            state: Arc::new(Mutex::new(WindowState {
                size,
                closed: false,
                writes_finished: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes up to `wanted` bytes of credit (and at most one packet),
    /// waiting while the window is exhausted.
    pub async fn reserve(&self, max_packet_size: u32, wanted: usize) -> Result<usize, Error> {
        loop {
            // Registered before the check so that a credit arriving in
            // between is not missed.
            let notified = self.notify.notified();
            if let Some(n) = self.try_take(max_packet_size, wanted, true)? {
                return Ok(n);
            }
            notified.await;
        }
    }

    /// Non-blocking version of [`WindowSizeRef::reserve`] for the event
    /// loop's own queue: returns 0 when the window is exhausted or closed.
    pub fn try_reserve(&self, max_packet_size: u32, wanted: usize) -> usize {
        self.try_take(max_packet_size, wanted, false)
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    fn try_take(
        &self,
        max_packet_size: u32,
        wanted: usize,
        writer: bool,
    ) -> Result<Option<usize>, Error> {
        let mut state = self.lock();
        if state.closed || (writer && state.writes_finished) {
            return Err(Error::ChannelClosed);
        }
        let n = (state.size.min(max_packet_size) as usize).min(wanted);
        if n == 0 {
            return Ok(None);
        }
        state.size -= n as u32;
        Ok(Some(n))
    }

    /// Credits the window, waking up suspended writers. Returns the new size.
    pub fn add(&self, bytes: u32) -> u32 {
        let size = {
            let mut state = self.lock();
            state.size = state.size.saturating_add(bytes);
            state.size
        };
        self.notify.notify_waiters();
        size
    }

    pub fn set(&self, size: u32) {
        self.lock().size = size;
        self.notify.notify_waiters();
    }

    pub fn size(&self) -> u32 {
        self.lock().size
    }

    /// Writers get [`Error::ChannelClosed`] from now on. Data the event
    /// loop already queued is still sent.
    pub fn finish_writes(&self) {
        self.lock().writes_finished = true;
        self.notify.notify_waiters();
    }

    /// No more data can be sent: pending and future reservations fail.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }
}

/// The event loop's end of a [`super::Channel`]: its mailbox and its window.
#[derive(Debug)]
pub struct ChannelRef {
    pub(crate) sender: UnboundedSender<ChannelMsg>,
    pub(crate) window: WindowSizeRef,
}

impl ChannelRef {
    pub fn new(sender: UnboundedSender<ChannelMsg>) -> Self {
        Self {
            sender,
            window: WindowSizeRef::new(0),
        }
    }

    /// Delivers `msg` to the channel's holder. Returns `false` if nobody
    /// holds the channel anymore.
    pub fn send(&self, msg: ChannelMsg) -> bool {
        self.sender.send(msg).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn reserve_suspends_until_credited() {
        let window = WindowSizeRef::new(10);
        assert_eq!(window.reserve(4, 100).await.unwrap(), 4);
        assert_eq!(window.reserve(32, 100).await.unwrap(), 6);
        assert_eq!(window.try_reserve(32, 1), 0);

        let writer = {
            let window = window.clone();
            tokio::spawn(async move { window.reserve(32, 100).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        assert_eq!(window.add(50), 50);
        assert_eq!(writer.await.unwrap().unwrap(), 32);
        assert_eq!(window.size(), 18);
    }

    #[tokio::test]
    async fn close_fails_waiting_writers() {
        let window = WindowSizeRef::new(0);
        let writer = {
            let window = window.clone();
            tokio::spawn(async move { window.reserve(32, 1).await })
        };
        tokio::task::yield_now().await;
        window.close();
        assert!(matches!(
            writer.await.unwrap(),
            Err(Error::ChannelClosed)
        ));
        window.add(10);
        assert_eq!(window.try_reserve(32, 1), 0);
    }

    #[tokio::test]
    async fn finished_writes_keep_the_queue_going() {
        let window = WindowSizeRef::new(0);
        let writer = {
            let window = window.clone();
            tokio::spawn(async move { window.reserve(32, 1).await })
        };
        tokio::task::yield_now().await;
        window.finish_writes();
        assert!(matches!(
            writer.await.unwrap(),
            Err(Error::ChannelClosed)
        ));
        window.add(10);
        assert!(matches!(
            window.reserve(32, 1).await,
            Err(Error::ChannelClosed)
        ));
        assert_eq!(window.try_reserve(32, 4), 4);
    }
}
