//! Raw bidirectional relay
//!
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::Instant;

use crate::errors::Result;

const RELAY_BUFFER: usize = 16 * 1024;

/// Copy bytes in both directions until both sides have closed, either side
/// fails, or neither side has sent anything for `idle_timeout`.
///
/// A close on one side is propagated as a write shutdown to the other, so
/// half-closed connections keep flowing in the remaining direction.
/// Returns the byte counts `(client → upstream, upstream → client)`.
pub async fn relay<C, U>(client: C, upstream: U, idle_timeout: Duration) -> Result<(u64, u64)>
where
  C: AsyncRead + AsyncWrite + Unpin,
  U: AsyncRead + AsyncWrite + Unpin,
{
  let (mut client_read, mut client_write) = tokio::io::split(client);
  let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
  let started = Instant::now();
  let last_activity = AtomicU64::new(0);
  let sent = AtomicU64::new(0);
  let received = AtomicU64::new(0);

  let client_to_upstream = pump(
    &mut client_read,
    &mut upstream_write,
    started,
    &last_activity,
    &sent,
  );
  let upstream_to_client = pump(
    &mut upstream_read,
    &mut client_write,
    started,
    &last_activity,
    &received,
  );
  let watchdog = async {
    loop {
      let idle_for = started.elapsed().saturating_sub(Duration::from_millis(
        last_activity.load(Ordering::Relaxed),
      ));
      if idle_for >= idle_timeout {
        break;
      }
      tokio::time::sleep(idle_timeout - idle_for).await;
    }
  };

  tokio::select! {
    result = async { tokio::try_join!(client_to_upstream, upstream_to_client) } => {
      result?;
    },
    _ = watchdog => {
      tracing::debug!(?idle_timeout, "relay idle, closing");
    },
  }
  Ok((sent.load(Ordering::Relaxed), received.load(Ordering::Relaxed)))
}

async fn pump<R, W>(
  reader: &mut ReadHalf<R>,
  writer: &mut WriteHalf<W>,
  started: Instant,
  last_activity: &AtomicU64,
  total: &AtomicU64,
) -> Result<()>
where
  R: AsyncRead,
  W: AsyncWrite,
{
  let mut buffer = vec![0u8; RELAY_BUFFER];
  loop {
    let n = reader.read(&mut buffer).await?;
    if n == 0 {
      // peer closed: pass the half-close along; the other side may be gone already
      let _ = writer.shutdown().await;
      return Ok(());
    }
    writer.write_all(&buffer[..n]).await?;
    writer.flush().await?;
    total.fetch_add(n as u64, Ordering::Relaxed);
    last_activity.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
  }
}
