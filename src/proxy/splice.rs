//! Bidirectional byte copy between two TCP streams.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

/// Copy bytes from `src` to `dst` until EOF or an error on either side.
///
/// Returns the number of bytes copied. Errors are not distinguished from
/// EOF: either way the transfer is over and the caller tears both streams
/// down.
async fn copy_half<R, W>(mut src: R, mut dst: W, buffer_size: usize) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;

    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if dst.write_all(&buf[..n]).await.is_err() {
            break;
        }
        total += n as u64;
    }

    total
}

/// Shuttle bytes both ways between `client` and `backend`.
///
/// Each direction runs as its own copy task. Whichever direction finishes
/// first (EOF, error, or peer closure), the other is torn down with it, so
/// both sockets are closed by the time this returns and neither copy task
/// can outlive its peer.
///
/// Returns `(client_to_backend, backend_to_client)` byte counts; a count
/// for a direction that was torn down mid-transfer is reported as 0.
pub(crate) async fn splice(client: TcpStream, backend: TcpStream, buffer_size: usize) -> (u64, u64) {
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let mut upstream = tokio::spawn(copy_half(client_read, backend_write, buffer_size));
    let mut downstream = tokio::spawn(copy_half(backend_read, client_write, buffer_size));

    let (up, down) = tokio::select! {
        up = &mut upstream => {
            downstream.abort();
            (up, downstream.await)
        }
        down = &mut downstream => {
            upstream.abort();
            (upstream.await, down)
        }
    };

    let bytes = (finished(up), finished(down));
    trace!(up = bytes.0, down = bytes.1, "Splice finished");
    bytes
}

fn finished(result: Result<u64, tokio::task::JoinError>) -> u64 {
    result.unwrap_or(0)
}
