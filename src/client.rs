//! Client side of the ingestion protocol
//!
//! Used by the `leafscan-client` binary and the end-to-end tests. Payload
//! chunks must match the server's chunk size: the server acknowledges every
//! `chunk_size` bytes and the client waits for each acknowledgement before
//! sending the next chunk.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::codec;
use crate::protocol::{SubmitterId, ACK_TOKEN};

/// Server replies for one upload
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// Immediate reply: accepted with a task id, or an error
    pub reply: Value,
    /// Final frame after an accepted upload: the result or a timeout error
    pub result: Option<Value>,
}

impl UploadOutcome {
    pub fn task_id(&self) -> Option<&str> {
        self.reply.get("task_id").and_then(Value::as_str)
    }
}

pub struct Client<S> {
    stream: S,
    chunk_size: usize,
    max_frame_bytes: u32,
}

impl Client<TcpStream> {
    pub async fn connect(addr: &str, chunk_size: usize, max_frame_bytes: u32) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, chunk_size, max_frame_bytes))
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, chunk_size: usize, max_frame_bytes: u32) -> Self {
        Self {
            stream,
            chunk_size: chunk_size.max(1),
            max_frame_bytes,
        }
    }

    /// Upload the file at `path` and wait for its classification
    pub async fn send_image(&mut self, path: &Path, submitter: &SubmitterId) -> Result<UploadOutcome> {
        let mut file = File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let file_size = file.metadata().await?.len();
        let image_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .context("Image path has no file name")?;

        tracing::debug!("Sending {} ({} bytes)", image_name, file_size);
        codec::write_frame(
            &mut self.stream,
            &json!({
                "action": "send_image",
                "submitter_id": submitter,
                "image_name": image_name,
                "file_size": file_size,
            }),
        )
        .await?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut sent: u64 = 0;
        while sent < file_size {
            let n = (file_size - sent).min(self.chunk_size as u64) as usize;
            file.read_exact(&mut buf[..n]).await?;
            self.stream.write_all(&buf[..n]).await?;
            self.stream.flush().await?;

            let mut ack = [0u8; 3];
            self.stream
                .read_exact(&mut ack)
                .await
                .context("Connection closed while waiting for chunk acknowledgement")?;
            if &ack != ACK_TOKEN {
                bail!("Expected chunk acknowledgement after {} bytes", sent + n as u64);
            }
            sent += n as u64;
        }

        let reply = self.read_reply().await?;
        let result = if reply["status"] == "success" {
            Some(self.read_reply().await?)
        } else {
            None
        };
        Ok(UploadOutcome { reply, result })
    }

    pub async fn history(&mut self, submitter: &SubmitterId) -> Result<Value> {
        self.request(&json!({"action": "get_history", "submitter_id": submitter}))
            .await
    }

    /// Send one request frame and read one reply frame
    pub async fn request(&mut self, request: &Value) -> Result<Value> {
        codec::write_frame(&mut self.stream, request).await?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<Value> {
        match codec::read_frame(&mut self.stream, self.max_frame_bytes).await? {
            Some(value) => Ok(value),
            None => bail!("Server closed the connection"),
        }
    }
}
