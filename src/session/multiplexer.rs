use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{OutputChunk, StreamOrigin};

/// Join handles of the two reader tasks, each yielding the bytes it read
pub struct ReaderHandles {
    pub stdout: JoinHandle<io::Result<u64>>,
    pub stderr: JoinHandle<io::Result<u64>>,
}

impl ReaderHandles {
    /// Stops both readers without waiting for end-of-input
    pub fn abort(&self) {
        self.stdout.abort();
        self.stderr.abort();
    }

    /// Waits until both readers have stopped
    ///
    /// A failing reader is logged here; it never affects its sibling.
    pub async fn join(self, session_id: &str) {
        let (stdout, stderr) = tokio::join!(self.stdout, self.stderr);
        for (origin, result) in [(StreamOrigin::Stdout, stdout), (StreamOrigin::Stderr, stderr)] {
            match result {
                Ok(Ok(total)) => {
                    log::trace!("Session {session_id} {origin:?} reader done after {total} bytes")
                }
                Ok(Err(e)) => log::warn!("Session {session_id} {origin:?} reader failed: {e}"),
                Err(e) if e.is_cancelled() => {
                    log::debug!("Session {session_id} {origin:?} reader aborted")
                }
                Err(e) => log::error!("Session {session_id} {origin:?} reader task crashed: {e}"),
            }
        }
    }
}

/// Starts one reader task per stream, both feeding a bounded queue
///
/// The returned receiver sees end-of-stream only once both readers have
/// finished, since each reader owns one of the only two senders.
pub fn spawn_readers<O, E>(
    stdout: O,
    stderr: E,
    chunk_size: usize,
    queue_capacity: usize,
) -> (mpsc::Receiver<OutputChunk>, ReaderHandles)
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(queue_capacity);
    let handles = ReaderHandles {
        stdout: tokio::spawn(read_stream(
            stdout,
            StreamOrigin::Stdout,
            chunk_size,
            tx.clone(),
        )),
        stderr: tokio::spawn(read_stream(stderr, StreamOrigin::Stderr, chunk_size, tx)),
    };
    (rx, handles)
}

async fn read_stream<R>(
    mut reader: R,
    origin: StreamOrigin,
    chunk_size: usize,
    tx: mpsc::Sender<OutputChunk>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        total += n as u64;

        let chunk = OutputChunk {
            bytes: buf[..n].to_vec(),
            origin,
        };
        // Blocks while the queue is full, which backpressures the program's pipe
        if tx.send(chunk).await.is_err() {
            log::debug!("{origin:?} reader stopping, output queue closed");
            return Ok(total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Reader that fails on the first poll
    struct BrokenReader;

    impl AsyncRead for BrokenReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("pipe exploded")))
        }
    }

    async fn drain(mut rx: mpsc::Receiver<OutputChunk>) -> Vec<OutputChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_chunks_preserve_per_stream_order() {
        let stdout: Vec<u8> = (0..100u8).collect();
        let stderr = b"warning: something".to_vec();
        let (rx, handles) = spawn_readers(
            io::Cursor::new(stdout.clone()),
            io::Cursor::new(stderr.clone()),
            7,
            2,
        );

        let chunks = drain(rx).await;
        handles.join("test").await;

        let collect = |origin| {
            chunks
                .iter()
                .filter(|c| c.origin == origin)
                .flat_map(|c| c.bytes.clone())
                .collect::<Vec<u8>>()
        };
        assert_eq!(collect(StreamOrigin::Stdout), stdout);
        assert_eq!(collect(StreamOrigin::Stderr), stderr);
        assert!(chunks.iter().all(|c| !c.bytes.is_empty() && c.bytes.len() <= 7));
        assert!(chunks.iter().filter(|c| c.origin == StreamOrigin::Stdout).count() >= 15);
    }

    #[tokio::test]
    async fn test_read_error_does_not_stop_sibling() {
        let (rx, handles) = spawn_readers(BrokenReader, io::Cursor::new(b"still here".to_vec()), 64, 4);

        let chunks = drain(rx).await;
        let stdout = handles.stdout.await.unwrap();
        let stderr = handles.stderr.await.unwrap();

        assert!(stdout.is_err());
        assert_eq!(stderr.unwrap(), 10);
        assert_eq!(
            chunks,
            vec![OutputChunk {
                bytes: b"still here".to_vec(),
                origin: StreamOrigin::Stderr,
            }]
        );
    }

    #[tokio::test]
    async fn test_readers_stop_when_queue_is_dropped() {
        let (rx, handles) = spawn_readers(
            io::Cursor::new(vec![b'x'; 1024]),
            io::Cursor::new(Vec::new()),
            8,
            1,
        );
        drop(rx);
        let total = handles.stdout.await.unwrap().unwrap();
        assert!(total <= 8);
        assert_eq!(handles.stderr.await.unwrap().unwrap(), 0);
    }
}
