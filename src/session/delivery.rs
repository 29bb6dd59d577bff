use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{OutputChunk, StreamOrigin, TransportError};

/// Live destination for a session's output
///
/// Encoding and framing belong to the implementation; the core hands over
/// raw chunks in queue order.
#[async_trait]
pub trait OutputSink: Send {
    /// Called once the session id is known, before any output
    async fn session_started(&mut self, _session_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn push_chunk(&mut self, chunk: &OutputChunk) -> Result<(), TransportError>;

    /// End of output; no chunk follows
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Forwards every queued chunk to `sink` until the queue closes
///
/// Returns the number of chunks delivered. Stops at the first sink error
/// without touching the running process.
pub async fn forward<S>(
    mut queue: mpsc::Receiver<OutputChunk>,
    sink: &mut S,
) -> Result<usize, TransportError>
where
    S: OutputSink + ?Sized,
{
    let mut delivered = 0;
    while let Some(chunk) = queue.recv().await {
        sink.push_chunk(&chunk).await?;
        delivered += 1;
    }
    sink.close().await?;
    Ok(delivered)
}

/// Sink that keeps the combined output in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub chunks: Vec<OutputChunk>,
    pub session_id: Option<String>,
    pub closed: bool,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All bytes in delivery order, both streams interleaved
    pub fn combined(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|c| c.bytes.iter().copied()).collect()
    }

    pub fn stream(&self, origin: StreamOrigin) -> Vec<u8> {
        self.chunks
            .iter()
            .filter(|c| c.origin == origin)
            .flat_map(|c| c.bytes.iter().copied())
            .collect()
    }
}

#[async_trait]
impl OutputSink for CollectingSink {
    async fn session_started(&mut self, session_id: &str) -> Result<(), TransportError> {
        self.session_id = Some(session_id.to_string());
        Ok(())
    }

    async fn push_chunk(&mut self, chunk: &OutputChunk) -> Result<(), TransportError> {
        self.chunks.push(chunk.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}
