//! HTTPS upload server feeding the data processor.
//!
//! Accepts a streamed disk-image body, gates concurrency to a single
//! in-flight upload, and bridges the async request body into the
//! blocking processor. Sync endpoints run the whole pipeline before
//! responding; async endpoints acknowledge as soon as the bytes are
//! staged and fsynced, then finish Convert/Resize in the background.

mod tls;

pub use tls::TlsMaterial;

use std::convert::Infallible;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use futures::{StreamExt, TryStreamExt};
use http::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyStream, Full};
use hyper::body::{Body, Bytes};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::constants::{defaults, paths};
use crate::errors::{ImportError, ImportResult};
use crate::pipeline::TargetLayout;
use crate::processor::{
    AsyncUploadDataSource, ContentType, DataProcessor, DataSource, ProcessOutcome,
    UploadDataSource,
};
use crate::qemu::{QemuImg, QemuOperations};
use crate::size::Quantity;

/// Body streams the pump can bridge into the blocking processor.
trait UploadBody: Body<Data = Bytes> + Send + Unpin + 'static {}
impl<B> UploadBody for B
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
}

/// Upload-server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub bind_port: u16,
    /// Target path: a mounted directory or a block device.
    pub destination: PathBuf,
    /// Scratch directory for staged bytes that need conversion.
    pub scratch_dir: PathBuf,
    /// Requested virtual size of the finished image.
    pub image_size: Option<Quantity>,
    pub content_type: ContentType,
    /// Overhead fraction reserved when validating filesystem targets.
    pub filesystem_overhead: f64,
    /// Mutual-TLS material; plain HTTP when absent.
    pub tls: Option<TlsMaterial>,
    /// Required client certificate Common Name.
    pub expected_client_name: Option<String>,
    /// Health listener port; 0 disables the listener.
    pub health_port: u16,
}

impl ServerConfig {
    pub fn new(bind_address: impl Into<String>, bind_port: u16, destination: impl Into<PathBuf>) -> Self {
        ServerConfig {
            bind_address: bind_address.into(),
            bind_port,
            destination: destination.into(),
            scratch_dir: PathBuf::from("/scratch"),
            image_size: None,
            content_type: ContentType::Kubevirt,
            filesystem_overhead: defaults::FILESYSTEM_OVERHEAD,
            tls: None,
            expected_client_name: None,
            health_port: 0,
        }
    }
}

#[derive(Debug, Default)]
struct UploadState {
    uploading: bool,
    done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Sync,
    Async,
}

/// How an accepted upload left the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadOutcome {
    /// Pipeline finished; the server can shut down.
    Finished,
    /// Bytes staged; Convert/Resize continue in the background.
    Resuming,
}

/// The HTTPS endpoint bridging one upload into one processor run.
///
/// At most one upload is in flight; a finished upload flips the server
/// into a terminal state where further requests conflict.
pub struct UploadServer {
    config: ServerConfig,
    qemu: Arc<dyn QemuOperations>,
    state: Mutex<UploadState>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    bound_port: AtomicU16,
}

impl UploadServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Self::with_qemu(config, Arc::new(QemuImg))
    }

    /// Construct with an injected qemu handle (tests substitute a
    /// fake).
    pub fn with_qemu(config: ServerConfig, qemu: Arc<dyn QemuOperations>) -> Arc<Self> {
        Arc::new(UploadServer {
            config,
            qemu,
            state: Mutex::new(UploadState::default()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            bound_port: AtomicU16::new(0),
        })
    }

    /// The port actually bound, once [`run`](Self::run) is listening.
    /// Useful when configured with port 0.
    pub fn local_port(&self) -> u16 {
        self.bound_port.load(Ordering::SeqCst)
    }

    /// Ask the server to stop. In-flight work is allowed to finish.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Bind and serve until a successful upload completes or
    /// [`shutdown`](Self::shutdown) is called.
    pub async fn run(self: Arc<Self>) -> ImportResult<()> {
        let listener =
            TcpListener::bind((self.config.bind_address.as_str(), self.config.bind_port)).await?;
        let local_addr = listener.local_addr()?;
        self.bound_port.store(local_addr.port(), Ordering::SeqCst);
        tracing::info!(
            addr = %local_addr,
            tls = self.config.tls.is_some(),
            "upload server listening"
        );

        let acceptor = match &self.config.tls {
            Some(material) => Some(TlsAcceptor::from(Arc::new(tls::server_config(material)?))),
            None => None,
        };

        if self.config.health_port != 0 {
            let health = TcpListener::bind((
                self.config.bind_address.as_str(),
                self.config.health_port,
            ))
            .await?;
            tracing::info!(port = self.config.health_port, "health listener up");
            self.tracker
                .spawn(run_health(health, self.shutdown.clone()));
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::warn!(%err, "accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(%peer, "accepted connection");
                    let server = Arc::clone(&self);
                    let acceptor = acceptor.clone();
                    self.tracker.spawn(async move {
                        if let Err(err) = server.serve_connection(stream, acceptor).await {
                            tracing::warn!(%err, "connection failed");
                        }
                    });
                }
            }
        }

        // Let the in-flight upload and any background resume finish.
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("upload server stopped");
        Ok(())
    }

    async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        acceptor: Option<TlsAcceptor>,
    ) -> ImportResult<()> {
        match acceptor {
            Some(acceptor) => {
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| ImportError::Stream(format!("TLS handshake: {}", e)))?;
                let client_cn = tls_stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(tls::peer_common_name);
                self.serve_http(TokioIo::new(tls_stream), client_cn).await
            }
            None => self.serve_http(TokioIo::new(stream), None).await,
        }
    }

    async fn serve_http<I>(self: Arc<Self>, io: I, client_cn: Option<String>) -> ImportResult<()>
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let server = self;
        let service = service_fn(move |req| {
            let server = Arc::clone(&server);
            let client_cn = client_cn.clone();
            async move { Ok::<_, Infallible>(server.handle(req, client_cn.as_deref()).await) }
        });
        hyper::server::conn::http1::Builder::new()
            .serve_connection(io, service)
            .await
            .map_err(|e| ImportError::Stream(e.to_string()))
    }

    /// Route one request. Every response carries the CORS header.
    pub(crate) async fn handle<B>(
        &self,
        req: Request<B>,
        client_cn: Option<&str>,
    ) -> Response<Full<Bytes>>
    where
        B: UploadBody,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();
        tracing::debug!(%method, %path, "request");

        let response = match (method.as_str(), path.as_str()) {
            ("POST", paths::UPLOAD_SYNC) | ("POST", paths::UPLOAD_SYNC_ALPHA) => {
                self.upload(req, client_cn, Mode::Sync, false).await
            }
            ("POST", paths::UPLOAD_ASYNC) | ("POST", paths::UPLOAD_ASYNC_ALPHA) => {
                self.upload(req, client_cn, Mode::Async, false).await
            }
            ("POST", paths::UPLOAD_FORM_SYNC) => {
                self.upload(req, client_cn, Mode::Sync, true).await
            }
            ("POST", paths::UPLOAD_FORM_ASYNC) => {
                self.upload(req, client_cn, Mode::Async, true).await
            }
            // Readiness probe for resuming clients.
            ("HEAD", paths::UPLOAD_ASYNC) | ("HEAD", paths::UPLOAD_ASYNC_ALPHA) => {
                plain_response(StatusCode::OK, "")
            }
            _ => plain_response(StatusCode::NOT_FOUND, "not found"),
        };
        with_cors(response)
    }

    async fn upload<B>(
        &self,
        req: Request<B>,
        client_cn: Option<&str>,
        mode: Mode,
        multipart: bool,
    ) -> Response<Full<Bytes>>
    where
        B: UploadBody,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        if let Err(err) = self.authorize(client_cn) {
            tracing::warn!(%err, "rejecting upload");
            return error_response(&err);
        }

        let boundary = if multipart {
            let parsed = req
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .and_then(|ct| multer::parse_boundary(ct).ok());
            match parsed {
                Some(boundary) => Some(boundary),
                None => {
                    return error_response(&ImportError::BadRequest(
                        "expected multipart/form-data content type".into(),
                    ))
                }
            }
        } else {
            None
        };

        if let Err(err) = self.try_begin() {
            tracing::warn!(%err, "rejecting upload");
            return error_response(&err);
        }

        match self.run_upload(req.into_body(), boundary, mode).await {
            Ok(outcome) => {
                self.finish(true);
                if outcome == UploadOutcome::Finished {
                    // The volume is populated; the process can exit.
                    self.shutdown.cancel();
                }
                plain_response(StatusCode::OK, "")
            }
            Err(err) => {
                self.finish(false);
                tracing::warn!(%err, "upload failed");
                error_response(&err)
            }
        }
    }

    /// Bridge the body into a blocking reader and drive the processor
    /// on the blocking pool. The body is always drained to EOF, even
    /// when processing fails early, so the client never sees a
    /// mid-stream reset.
    async fn run_upload<B>(
        &self,
        body: B,
        boundary: Option<String>,
        mode: Mode,
    ) -> ImportResult<UploadOutcome>
    where
        B: UploadBody,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(8);
        let reader = SyncIoBridge::new(StreamReader::new(ReceiverStream::new(rx)));

        let layout = TargetLayout::detect(&self.config.destination);
        let content_type = self.config.content_type;
        let scratch_dir = self.config.scratch_dir.clone();
        let image_size = self.config.image_size;
        let overhead = self.config.filesystem_overhead;
        let qemu = Arc::clone(&self.qemu);

        let processor_task = task::spawn_blocking(move || {
            let source: Box<dyn DataSource> = match mode {
                Mode::Sync => Box::new(UploadDataSource::new(reader, content_type)),
                Mode::Async => Box::new(AsyncUploadDataSource::new(reader, content_type)),
            };
            let mut processor =
                DataProcessor::new(source, qemu, layout, scratch_dir, image_size, overhead);
            let outcome = match mode {
                Mode::Sync => {
                    processor.process_data()?;
                    ProcessOutcome::Done
                }
                Mode::Async => processor.process_data_with_pause()?,
            };
            Ok::<_, ImportError>((processor, outcome))
        });

        match boundary {
            None => pump_body(body, tx).await,
            Some(boundary) => pump_multipart(body, boundary, tx).await,
        }

        let (processor, outcome) = processor_task
            .await
            .map_err(|e| ImportError::Internal(format!("processor task failed: {}", e)))??;

        if outcome == ProcessOutcome::Paused {
            // Acknowledge now; Convert/Resize continue after the
            // response has gone out.
            let shutdown = self.shutdown.clone();
            self.tracker.spawn(async move {
                let result =
                    task::spawn_blocking(move || {
                        let mut processor = processor;
                        processor.process_data_resume()
                    })
                    .await;
                match result {
                    Ok(Ok(())) => {
                        tracing::info!("resumed processing complete");
                        shutdown.cancel();
                    }
                    Ok(Err(err)) => tracing::error!(%err, "resumed processing failed"),
                    Err(err) => tracing::error!(%err, "resume task failed"),
                }
            });
            return Ok(UploadOutcome::Resuming);
        }
        Ok(UploadOutcome::Finished)
    }

    fn authorize(&self, client_cn: Option<&str>) -> ImportResult<()> {
        let Some(expected) = self.config.expected_client_name.as_deref() else {
            return Ok(());
        };
        match client_cn {
            Some(cn) if cn == expected => Ok(()),
            Some(cn) => Err(ImportError::Unauthorized(format!(
                "client common name {:?} does not match expected {:?}",
                cn, expected
            ))),
            None => Err(ImportError::Unauthorized(
                "no client certificate identity presented".into(),
            )),
        }
    }

    fn try_begin(&self) -> ImportResult<()> {
        let mut state = self.lock_state();
        if state.uploading {
            return Err(ImportError::Busy);
        }
        if state.done {
            return Err(ImportError::Conflict);
        }
        state.uploading = true;
        Ok(())
    }

    fn finish(&self, success: bool) {
        let mut state = self.lock_state();
        state.uploading = false;
        if success {
            state.done = true;
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, UploadState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Feed raw body frames into the channel. Draining continues past a
/// closed receiver so the whole request body is consumed.
async fn pump_body<B>(body: B, tx: mpsc::Sender<io::Result<Bytes>>)
where
    B: UploadBody,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
    let mut stream = BodyStream::new(body);
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(frame) => {
                if let Ok(data) = frame.into_data() {
                    let _ = tx.send(Ok(data)).await;
                }
            }
            Err(err) => {
                let _ = tx.send(Err(io::Error::other(err))).await;
                return;
            }
        }
    }
}

/// Feed the `file` field of a multipart body into the channel,
/// draining the remaining fields afterwards.
async fn pump_multipart<B>(body: B, boundary: String, tx: mpsc::Sender<io::Result<Bytes>>)
where
    B: UploadBody,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
    let stream = BodyStream::new(body)
        .try_filter_map(|frame| std::future::ready(Ok(frame.into_data().ok())));
    let mut multipart = multer::Multipart::new(stream, boundary);
    let mut found = false;
    loop {
        let mut field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                let _ = tx.send(Err(io::Error::other(err))).await;
                return;
            }
        };
        let wanted = field.name() == Some(defaults::FORM_FIELD_NAME) && !found;
        loop {
            match field.chunk().await {
                Ok(Some(chunk)) => {
                    if wanted {
                        let _ = tx.send(Ok(chunk)).await;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = tx.send(Err(io::Error::other(err))).await;
                    return;
                }
            }
        }
        found = found || wanted;
    }
    if !found {
        let _ = tx
            .send(Err(io::Error::other("no file field in form body")))
            .await;
    }
}

/// Serve `GET /healthz` on its own listener.
async fn run_health(listener: TcpListener, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        Ok::<_, Infallible>(handle_healthz(&req))
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        }
    }
}

pub(crate) fn handle_healthz<B>(req: &Request<B>) -> Response<Full<Bytes>> {
    if req.method() == Method::GET && req.uri().path() == paths::HEALTHZ {
        plain_response(StatusCode::OK, "OK")
    } else {
        plain_response(StatusCode::NOT_FOUND, "not found")
    }
}

fn status_for(err: &ImportError) -> StatusCode {
    match err {
        ImportError::RequiresScratchSpace
        | ImportError::SourceTooLarge { .. }
        | ImportError::BadRequest(_) => StatusCode::BAD_REQUEST,
        ImportError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        ImportError::Busy => StatusCode::SERVICE_UNAVAILABLE,
        ImportError::Conflict => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &ImportError) -> Response<Full<Bytes>> {
    plain_response(status_for(err), &err.to_string())
}

fn plain_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
}

fn with_cors(mut response: Response<Full<Bytes>>) -> Response<Full<Bytes>> {
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}
