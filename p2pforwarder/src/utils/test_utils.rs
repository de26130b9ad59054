//! Tracks values moved into tasks, so tests can assert that everything they handed out was
//! eventually dropped, exactly once.

use std::{
    fmt::Debug,
    io,
    ops::{Deref, DerefMut},
    pin::Pin,
    sync::{atomic::AtomicBool, Arc},
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub struct DropChecker {
    tracked: Vec<Arc<DropCheckTracker>>,
}

impl DropChecker {
    pub const fn new() -> Self {
        Self { tracked: Vec::new() }
    }

    pub fn track_named<T, S: ToString>(&mut self, name: S, value: T) -> DC<T> {
        let tracker = Arc::new(DropCheckTracker {
            was_dropped: AtomicBool::new(false),
            name: name.to_string(),
        });

        self.tracked.push(Arc::clone(&tracker));
        DC { tracker, value }
    }

    pub fn ensure_all_dropped(&mut self) {
        for t in self.tracked.drain(..) {
            if !t.was_dropped.load(std::sync::atomic::Ordering::Relaxed) {
                panic!("A value named {} wasn't dropped", t.name);
            }
        }
    }
}

struct DropCheckTracker {
    was_dropped: AtomicBool,
    name: String,
}

impl Drop for DropChecker {
    fn drop(&mut self) {
        self.ensure_all_dropped()
    }
}

pub struct DC<T> {
    tracker: Arc<DropCheckTracker>,
    pub value: T,
}

impl<T> Deref for DC<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> DerefMut for DC<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

impl<T> Drop for DC<T> {
    fn drop(&mut self) {
        if self.tracker.was_dropped.swap(true, std::sync::atomic::Ordering::Relaxed) {
            panic!("A value named {} was double-dropped", self.tracker.name);
        }
    }
}

impl<T: Debug> Debug for DC<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self.deref(), f)
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for DC<T> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.value).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for DC<T> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.value).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.value).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.value).poll_shutdown(cx)
    }
}
