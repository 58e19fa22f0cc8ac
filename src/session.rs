//! Transfer session
//!
//! One session per connection. The session loops over request frames:
//!
//! ```text
//! AWAIT_REQUEST -> RECEIVING_PAYLOAD -> AWAIT_DISPATCH -> AWAIT_RESULT -> AWAIT_REQUEST
//!       |                                                                   |
//!       +---------------------------> CLOSED <------------------------------+
//! ```
//!
//! Business failures (bad request, busy submitter, dispatch failure, result
//! timeout) are answered with an error frame and the session keeps reading.
//! Only transport failures and peers that hang up end the session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec;
use crate::config::SessionConfig;
use crate::dispatcher::TaskDispatcher;
use crate::error::{FrameError, PipelineError};
use crate::metrics;
use crate::protocol::{
    HistoryRequest, Reply, Request, SubmitterId, UploadRequest, ACK_TOKEN,
};
use crate::router::{Delivery, ResultRouter};
use crate::storage::{ImageRecord, PredictionStore};

/// Collaborators shared by every session of a server
pub struct SessionContext {
    pub config: SessionConfig,
    pub store: Arc<dyn PredictionStore>,
    pub dispatcher: TaskDispatcher,
    pub router: ResultRouter,
}

impl SessionContext {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn PredictionStore>,
        dispatcher: TaskDispatcher,
        router: ResultRouter,
    ) -> Self {
        Self {
            config,
            store,
            dispatcher,
            router,
        }
    }

    /// Create the submitter (if new) and the image record for a stored payload
    pub async fn register_image(
        &self,
        path: &Path,
        submitter: &SubmitterId,
    ) -> Result<ImageRecord, PipelineError> {
        self.store.create_user(submitter).await?;
        let image = self
            .store
            .create_image(&path.to_string_lossy(), submitter)
            .await?;
        Ok(image)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitRequest,
    ReceivingPayload,
    AwaitDispatch,
    AwaitResult,
    Closed,
}

/// What the session does after a request has been handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

pub struct TransferSession<R, W> {
    id: u64,
    peer: String,
    reader: R,
    writer: W,
    ctx: Arc<SessionContext>,
    state: SessionState,
}

impl<R, W> TransferSession<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(id: u64, peer: impl Into<String>, reader: R, writer: W, ctx: Arc<SessionContext>) -> Self {
        Self {
            id,
            peer: peer.into(),
            reader,
            writer,
            ctx,
            state: SessionState::AwaitRequest,
        }
    }

    fn transition(&mut self, next: SessionState) {
        tracing::trace!(session = self.id, "{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Serve requests until the peer leaves or the transport fails
    pub async fn run(mut self) {
        tracing::debug!(session = self.id, peer = %self.peer, "Session started");

        loop {
            self.transition(SessionState::AwaitRequest);
            match self.next_request().await {
                Ok(flow) => {
                    if flow == Flow::Close {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(session = self.id, peer = %self.peer, "Closing session: {}", e);
                    break;
                }
            }
        }

        self.transition(SessionState::Closed);
        tracing::debug!(session = self.id, peer = %self.peer, "Session closed");
    }

    async fn next_request(&mut self) -> Result<Flow, PipelineError> {
        let max_frame_bytes = self.ctx.config.max_frame_bytes;
        let value = match codec::read_frame(&mut self.reader, max_frame_bytes).await {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(Flow::Close),
            Err(FrameError::Oversized { len, max }) => {
                metrics::FRAME_ERRORS.with_label_values(&["oversized"]).inc();
                tracing::warn!(session = self.id, "Rejecting {} byte frame (limit {})", len, max);
                let err = PipelineError::Framing(FrameError::Oversized { len, max });
                self.send(&Reply::failed(&err)).await?;
                // drop the body so the next prefix lines up
                return match codec::skip_body(&mut self.reader, len).await? {
                    true => Ok(Flow::Continue),
                    false => Ok(Flow::Close),
                };
            }
            Err(e @ FrameError::Malformed(_)) => {
                metrics::FRAME_ERRORS.with_label_values(&[e.label()]).inc();
                tracing::warn!(session = self.id, "Malformed request frame: {}", e);
                self.send(&Reply::failed(&PipelineError::Framing(e))).await?;
                return Ok(Flow::Continue);
            }
            Err(e) => {
                metrics::FRAME_ERRORS.with_label_values(&[e.label()]).inc();
                return Err(e.into());
            }
        };

        match Request::parse(value) {
            Ok(Request::Upload(request)) => self.handle_upload(request).await,
            Ok(Request::History(request)) => self.handle_history(request).await,
            Ok(Request::Unrecognized(action)) => {
                tracing::info!(session = self.id, action = %action, "Unrecognized action");
                self.send(&Reply::unrecognized()).await?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                tracing::info!(session = self.id, "Invalid request: {}", e);
                self.send(&Reply::failed(&e)).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_upload(&mut self, request: UploadRequest) -> Result<Flow, PipelineError> {
        let submitter = request.submitter_id.clone();
        let path = self.upload_path(&request);
        tracing::info!(
            session = self.id,
            submitter = %submitter,
            image = %request.image_name,
            size = request.file_size,
            "Receiving upload"
        );

        self.transition(SessionState::ReceivingPayload);
        if let Err(e) = self.receive_payload(&path, request.file_size).await {
            discard(&path).await;
            if matches!(e, PipelineError::TransferInterrupted { .. }) {
                metrics::UPLOADS_INTERRUPTED.inc();
            }
            tracing::warn!(session = self.id, submitter = %submitter, "Upload failed: {}", e);
            // the peer may still be reading even if it stopped writing
            let _ = self.send(&Reply::failed(&e)).await;
            return Ok(Flow::Close);
        }

        // subscribe before dispatch so a fast worker cannot beat us
        let claim = match self.ctx.router.claim(&submitter, self.id).await {
            Ok(claim) => claim,
            Err(e) => {
                discard(&path).await;
                self.send(&Reply::failed(&e)).await?;
                return Ok(Flow::Continue);
            }
        };

        self.transition(SessionState::AwaitDispatch);
        let image = match self.ctx.register_image(&path, &submitter).await {
            Ok(image) => image,
            Err(e) => {
                tracing::error!(session = self.id, "Could not record image: {}", e);
                drop(claim);
                discard(&path).await;
                self.send(&Reply::failed(&e)).await?;
                return Ok(Flow::Continue);
            }
        };

        let task = match self
            .ctx
            .dispatcher
            .submit(image.id, &image.storage_path, &submitter)
            .await
        {
            Ok(task) => task,
            Err(e) => {
                drop(claim);
                self.send(&Reply::failed(&e)).await?;
                return Ok(Flow::Continue);
            }
        };
        self.send(&Reply::accepted(task.task_id.clone())).await?;

        self.transition(SessionState::AwaitResult);
        let timeout = self.ctx.config.result_timeout;
        let outcome = self
            .ctx
            .router
            .await_result(claim, &task, timeout, &mut self.writer, peer_closed(&mut self.reader))
            .await;

        match outcome {
            Ok(Delivery::Forwarded(_)) => Ok(Flow::Continue),
            Ok(Delivery::Missed(_)) => Ok(Flow::Close),
            Err(e) => {
                self.send(&Reply::failed(&e)).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_history(&mut self, request: HistoryRequest) -> Result<Flow, PipelineError> {
        metrics::HISTORY_QUERIES.inc();
        let reply = match self.ctx.store.list_predictions(&request.submitter_id).await {
            Ok(records) => Reply::history(records.into_iter().map(Into::into).collect()),
            Err(e) => {
                tracing::error!(session = self.id, "History query failed: {}", e);
                Reply::failed(&PipelineError::Persistence(e))
            }
        };
        self.send(&reply).await?;
        Ok(Flow::Continue)
    }

    /// Stream `size` payload bytes into `path`, acknowledging every chunk
    async fn receive_payload(&mut self, path: &Path, size: u64) -> Result<(), PipelineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(path).await?;

        let chunk_size = self.ctx.config.chunk_size.max(1);
        let mut buf = vec![0u8; usize::try_from(size).unwrap_or(usize::MAX).min(chunk_size)];
        let mut received: u64 = 0;

        while received < size {
            let n = (size - received).min(chunk_size as u64) as usize;
            if let Err(e) = self.reader.read_exact(&mut buf[..n]).await {
                tracing::debug!(session = self.id, "Payload read failed: {}", e);
                return Err(PipelineError::TransferInterrupted {
                    received,
                    expected: size,
                });
            }

            file.write_all(&buf[..n]).await?;
            file.flush().await?;
            received += n as u64;

            self.writer.write_all(ACK_TOKEN).await?;
            self.writer.flush().await?;
            metrics::ACKS_SENT.inc();
        }
        file.sync_all().await?;

        metrics::UPLOADS_TOTAL.inc();
        metrics::UPLOAD_BYTES.inc_by(size);
        tracing::debug!(session = self.id, path = %path.display(), "Payload stored");
        Ok(())
    }

    /// `<upload_dir>/<submitter>/<millis>-<session>-<file name>`
    fn upload_path(&self, request: &UploadRequest) -> PathBuf {
        let file_name = Path::new(&request.image_name)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());

        self.ctx
            .config
            .upload_dir
            .join(safe_component(&request.submitter_id.to_string()))
            .join(format!(
                "{}-{}-{}",
                chrono::Utc::now().timestamp_millis(),
                self.id,
                file_name
            ))
    }

    async fn send(&mut self, reply: &Reply) -> Result<(), PipelineError> {
        codec::write_frame(&mut self.writer, reply).await?;
        Ok(())
    }
}

/// Resolves once the peer has closed its side of the connection
///
/// Bytes already waiting in the buffer (a pipelined request) keep it pending.
async fn peer_closed<R: AsyncBufRead + Unpin>(reader: &mut R) {
    match reader.fill_buf().await {
        Ok(buf) if !buf.is_empty() => std::future::pending::<()>().await,
        _ => {}
    }
}

async fn discard(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed partial upload"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "Could not remove partial upload: {}", e),
    }
}

fn safe_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
