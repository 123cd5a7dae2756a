//! Streaming copy that observes cancellation between buffers.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::ArtifactError;

/// Size of one copy buffer; cancellation is checked at this granularity.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Copy `reader` into `writer` until EOF, then flush.
///
/// Returns the number of bytes copied. Fails with
/// [`ArtifactError::Cancelled`] if `cancel` fires before the copy finishes,
/// and with [`ArtifactError::Stream`] if either side errors.
pub async fn copy_cancellable<R, W>(
    reader: &mut R,
    writer: &mut W,
    path: &str,
    cancel: &CancellationToken,
) -> Result<u64, ArtifactError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let cancelled = || ArtifactError::Cancelled {
        path: path.to_string(),
    };
    let stream_err = |source: std::io::Error| ArtifactError::Stream {
        path: path.to_string(),
        source,
    };

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            read = reader.read(&mut buf) => read.map_err(stream_err)?,
        };
        if n == 0 {
            break;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            written = writer.write_all(&buf[..n]) => written.map_err(stream_err)?,
        }
        total += n as u64;
    }

    writer.flush().await.map_err(stream_err)?;
    Ok(total)
}
