use std::io;

use log::{debug, warn};
use tokio::io::{copy_bidirectional_with_sizes, AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

const SPLICE_BUFFER_SIZE: usize = 32 * 1024;

/// Bidirectional streaming copy between an accepted TCP connection and the
/// channel (or socket) leading back to the tunnel client. Read EOF on one
/// side half-closes the other side for writing; the copy finishes when both
/// directions have drained, either side fails, or the owning forward is
/// canceled. No locks are held while copying.
pub(crate) async fn splice<A, B>(downstream: &mut A, upstream: &mut B, token: &CancellationToken)
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    tokio::select! {
        _ = token.cancelled() => {}
        result = copy_bidirectional_with_sizes(
            downstream,
            upstream,
            SPLICE_BUFFER_SIZE,
            SPLICE_BUFFER_SIZE,
        ) => match result {
            Ok((sent, received)) => {
                debug!("tunnel drained: {sent} bytes out, {received} bytes in");
            }
            Err(error) if is_normal_close(&error) => {
                debug!("tunnel closed by peer: {error}");
            }
            Err(error) => warn!("tunnel failed: {error}"),
        },
    }
}

fn is_normal_close(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
    )
}
