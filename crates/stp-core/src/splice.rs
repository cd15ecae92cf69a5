//! Bidirectional byte copy between two connections

use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

/// Copy bytes in both directions until either side closes.
///
/// When one direction reaches EOF or fails, both write halves are shut
/// down and both connections are dropped, so closing either side closes
/// both. An I/O error in the direction that finished first is returned.
pub async fn splice<A, B>(a: A, b: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = io::split(a);
    let (mut b_read, mut b_write) = io::split(b);

    let result = tokio::select! {
        result = io::copy(&mut a_read, &mut b_write) => {
            result.map(|n| tracing::trace!("Splice closed after {} bytes a->b", n))
        }
        result = io::copy(&mut b_read, &mut a_write) => {
            result.map(|n| tracing::trace!("Splice closed after {} bytes b->a", n))
        }
    };

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
    result?;

    Ok(())
}
