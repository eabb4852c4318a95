//! Safe TCP connect/read helper functions.

use std::io::{self, ErrorKind};
use std::marker::Unpin;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::LoadError;

/// Receives exactly `frame_len` bytes from TCP readable connection
/// `conn_read`, using `read_buf` as buffer storage for partial reads.
/// Returns:
///   - `Ok(frame)` if successful; upon returning, the frame's bytes have been
///     split off the front of the read buffer
///   - `Err(err)` if the peer closed the connection or any unexpected error
///     occurs
///
/// CANCELLATION SAFETY: we cannot use `read_exact()` here because this
/// function is intended to be raced against a timeout and `read_exact()` is
/// not cancellation-safe. Instead, in the case of being cancelled midway
/// before receiving the entire frame (note that such cancellation can only
/// happen at `.await` points), bytes already read are stored in the read
/// buffer and will continue to be appended by future invocations until
/// successful returning.
pub(crate) async fn safe_tcp_read_frame<Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
    frame_len: usize,
) -> Result<BytesMut, LoadError>
where
    Conn: AsyncReadExt + Unpin,
{
    if read_buf.capacity() < frame_len {
        read_buf.reserve(frame_len - read_buf.len());
    }
    while read_buf.len() < frame_len {
        let n = conn_read.read_buf(read_buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "connection closed with {} of {} frame bytes read",
                    read_buf.len(),
                    frame_len
                ),
            )
            .into());
        }
    }

    // if reached this point, no further cancellation to this call is
    // possible (because there are no more awaits ahead)
    Ok(read_buf.split_to(frame_len))
}

/// Wrapper over tokio `TcpStream::connect()` that resolves a `host:port`
/// address string and provides a retrying logic. Sets `TCP_NODELAY` on the
/// connected stream.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: &str,
    mut retries: u8,
) -> Result<TcpStream, LoadError> {
    loop {
        match tcp_connect_once(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err);
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Resolves `conn_addr` and tries each resolved socket address once.
async fn tcp_connect_once(conn_addr: &str) -> Result<TcpStream, LoadError> {
    let mut last_err =
        LoadError::msg(format!("address '{}' resolved to nothing", conn_addr));
    for addr in lookup_host(conn_addr).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last_err = err.into(),
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn read_frames_across_partial_writes() -> Result<(), LoadError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(&[1, 2, 3]).await.unwrap();
            conn.flush().await.unwrap();
            time::sleep(Duration::from_millis(50)).await;
            conn.write_all(&[4, 5, 6, 7, 8]).await.unwrap();
        });

        let mut stream = tcp_connect_with_retry(&addr, 0).await?;
        let mut read_buf = BytesMut::new();
        let first = safe_tcp_read_frame(&mut read_buf, &mut stream, 4).await?;
        assert_eq!(&first[..], &[1, 2, 3, 4]);
        let second = safe_tcp_read_frame(&mut read_buf, &mut stream, 4).await?;
        assert_eq!(&second[..], &[5, 6, 7, 8]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn read_frame_survives_timeout() -> Result<(), LoadError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(&[9, 9]).await.unwrap();
            time::sleep(Duration::from_millis(200)).await;
            conn.write_all(&[9, 9]).await.unwrap();
        });

        let mut stream = tcp_connect_with_retry(&addr, 0).await?;
        let mut read_buf = BytesMut::new();
        let timed = time::timeout(
            Duration::from_millis(50),
            safe_tcp_read_frame(&mut read_buf, &mut stream, 4),
        )
        .await;
        assert!(timed.is_err());
        let frame = safe_tcp_read_frame(&mut read_buf, &mut stream, 4).await?;
        assert_eq!(&frame[..], &[9, 9, 9, 9]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn read_frame_eof() -> Result<(), LoadError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(&[1]).await.unwrap();
        });

        let mut stream = tcp_connect_with_retry(&addr, 0).await?;
        let mut read_buf = BytesMut::new();
        assert!(safe_tcp_read_frame(&mut read_buf, &mut stream, 4)
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_refused_without_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(tcp_connect_with_retry(&addr, 0).await.is_err());
    }
}
