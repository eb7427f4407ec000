//! Raw duplex relay between two byte streams.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// How long the surviving direction may sit idle once the other one has
/// finished before the tunnel is torn down.
pub const DRAIN_IDLE: Duration = Duration::from_secs(1);

/// Copies bytes both ways between `a` and `b`.
///
/// A direction that reaches EOF shuts down the write half of its
/// destination so the peer sees end of stream. The other direction keeps
/// flowing while it moves bytes and is cut after [`DRAIN_IDLE`] without
/// progress, so closing one side always ends the bind. The first error
/// from either direction tears down the other one and is returned.
pub async fn bind<A, B>(a: A, b: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    bind_with_drain(a, b, DRAIN_IDLE).await
}

/// [`bind`] with an explicit idle limit for the half-closed phase.
pub async fn bind_with_drain<A, B>(a: A, b: B, drain_idle: Duration) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let (done, mut finished) = mpsc::channel::<io::Result<()>>(2);
    let moved = Arc::new(AtomicU64::new(0));

    let forward = tokio::spawn(copy_half(a_read, b_write, moved.clone(), done.clone()));
    let backward = tokio::spawn(copy_half(b_read, a_write, moved.clone(), done));

    let first = finished.recv().await.unwrap_or(Ok(()));
    let second = match first {
        Err(_) => None,
        Ok(()) => drain(&mut finished, &moved, drain_idle).await,
    };

    forward.abort();
    backward.abort();
    let _ = forward.await;
    let _ = backward.await;

    first.and(second.unwrap_or(Ok(())))
}

/// Waits for the remaining direction while it makes progress. `None` means
/// it went idle and was cut.
async fn drain(
    finished: &mut mpsc::Receiver<io::Result<()>>,
    moved: &AtomicU64,
    idle: Duration,
) -> Option<io::Result<()>> {
    let mut seen = moved.load(Ordering::Relaxed);
    loop {
        match tokio::time::timeout(idle, finished.recv()).await {
            Ok(result) => return result,
            Err(_) => {
                let now = moved.load(Ordering::Relaxed);
                if now == seen {
                    tracing::trace!("Half-closed tunnel went idle");
                    return None;
                }
                seen = now;
            }
        }
    }
}

async fn copy_half<R, W>(
    mut from: R,
    mut to: W,
    moved: Arc<AtomicU64>,
    done: mpsc::Sender<io::Result<()>>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = copy_until_eof(&mut from, &mut to, &moved).await;
    let _ = done.try_send(result);
}

async fn copy_until_eof<R, W>(from: &mut R, to: &mut W, moved: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        to.write_all(&buf[..n]).await?;
        moved.fetch_add(n as u64, Ordering::Relaxed);
    }
    if let Err(e) = to.shutdown().await {
        tracing::trace!(error = %e, "Shutdown after EOF failed");
    }
    Ok(())
}
