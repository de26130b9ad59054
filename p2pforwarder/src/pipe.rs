//! Bidirectional copying between two streams.
//!
//! [`pipe_both_and_close`] copies each direction on its own task. A direction reaching end of
//! stream only shuts down the writer it was copying into, so half-closed connections keep working
//! in the other direction. A direction failing, or the parent scope being cancelled, ends both.
//! The call returns once both directions are done, after which both streams are dropped.

use std::{fmt, io};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::cancel::CancelScope;

/// How one direction of a pipe ended.
#[derive(Debug)]
pub enum DirectionOutcome {
    /// The source reached end of stream after this many bytes were copied.
    Finished(u64),
    Failed(io::Error),
    Cancelled,
}

impl DirectionOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished(_))
    }
}

impl fmt::Display for DirectionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finished(bytes) => write!(f, "{bytes} bytes"),
            Self::Failed(error) => write!(f, "error: {error}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug)]
pub struct PipeOutcome {
    pub a_to_b: DirectionOutcome,
    pub b_to_a: DirectionOutcome,
}

impl PipeOutcome {
    /// Whether both directions reached end of stream.
    pub fn is_clean(&self) -> bool {
        self.a_to_b.is_finished() && self.b_to_a.is_finished()
    }
}

/// Pipes `a` and `b` into each other until both directions end, then drops both.
pub async fn pipe_both_and_close<A, B>(parent: &CancelScope, a: A, b: B) -> PipeOutcome
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let scope = parent.child();

    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let a_to_b = tokio::spawn(copy_direction(scope.clone(), a_read, b_write));
    let b_to_a = tokio::spawn(copy_direction(scope.clone(), b_read, a_write));

    let (a_to_b, b_to_a) = tokio::join!(a_to_b, b_to_a);
    scope.cancel();

    PipeOutcome {
        a_to_b: a_to_b.unwrap_or_else(|error| DirectionOutcome::Failed(io::Error::other(error))),
        b_to_a: b_to_a.unwrap_or_else(|error| DirectionOutcome::Failed(io::Error::other(error))),
    }
}

async fn copy_direction<R, W>(scope: CancelScope, mut reader: ReadHalf<R>, mut writer: WriteHalf<W>) -> DirectionOutcome
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let result = tokio::select! {
        biased;
        _ = scope.cancelled() => return DirectionOutcome::Cancelled,
        result = tokio::io::copy(&mut reader, &mut writer) => result,
    };

    match result {
        Ok(bytes) => {
            tokio::select! {
                biased;
                _ = scope.cancelled() => {}
                _ = writer.shutdown() => {}
            }

            DirectionOutcome::Finished(bytes)
        }
        Err(error) => {
            scope.cancel();
            DirectionOutcome::Failed(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::{pipe_both_and_close, DirectionOutcome};
    use crate::{cancel::CancelScope, utils::test_utils::DropChecker};

    #[tokio::test]
    async fn copies_both_ways_and_half_closes() {
        let (a, mut a_remote) = tokio::io::duplex(64);
        let (b, mut b_remote) = tokio::io::duplex(64);
        let scope = CancelScope::new();

        let pipe = tokio::spawn(async move { pipe_both_and_close(&scope, a, b).await });

        a_remote.write_all(b"request").await.unwrap();
        a_remote.shutdown().await.unwrap();

        let mut request = Vec::new();
        b_remote.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        // The other direction still works after the first one finished.
        b_remote.write_all(b"response").await.unwrap();
        b_remote.shutdown().await.unwrap();

        let mut response = Vec::new();
        a_remote.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");

        let outcome = tokio::time::timeout(Duration::from_secs(1), pipe).await.unwrap().unwrap();
        assert!(outcome.is_clean());
        assert!(matches!(outcome.a_to_b, DirectionOutcome::Finished(7)));
        assert!(matches!(outcome.b_to_a, DirectionOutcome::Finished(8)));
    }

    #[tokio::test]
    async fn parent_cancellation_ends_both_directions() {
        let mut checker = DropChecker::new();
        let (a, a_remote) = tokio::io::duplex(64);
        let (b, b_remote) = tokio::io::duplex(64);
        let a = checker.track_named("a", a);
        let b = checker.track_named("b", b);
        let parent = CancelScope::new();
        let scope = parent.clone();

        let pipe = tokio::spawn(async move { pipe_both_and_close(&scope, a, b).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pipe.is_finished());

        parent.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), pipe).await.unwrap().unwrap();
        assert!(matches!(outcome.a_to_b, DirectionOutcome::Cancelled));
        assert!(matches!(outcome.b_to_a, DirectionOutcome::Cancelled));

        drop((a_remote, b_remote));
        checker.ensure_all_dropped();
    }

    #[tokio::test]
    async fn an_error_ends_the_other_direction() {
        let (a, a_remote) = tokio::io::duplex(64);
        let (b, mut b_remote) = tokio::io::duplex(64);
        let scope = CancelScope::new();

        let pipe = tokio::spawn(async move { pipe_both_and_close(&scope, a, b).await });

        // Writes into `a` fail once its remote is gone, while nothing ever arrives from `b`.
        drop(a_remote);
        b_remote.write_all(b"lost").await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), pipe).await.unwrap().unwrap();
        assert!(matches!(outcome.b_to_a, DirectionOutcome::Failed(_)));
        assert!(!outcome.is_clean());
    }
}
