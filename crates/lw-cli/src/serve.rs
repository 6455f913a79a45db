use anyhow::{Context, Result};
use lw_core::{
    Backend, Caller, DaemonConfig, DirectConfig, DirectEngine, Dispatcher, Error, LockdownPolicy,
    LockdownWhitelist, MemoryBackend, Request, Response,
};
use lw_ipt::IptablesBackend;
use lw_metrics::{MetricsCollector, MetricsServer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// One line on stdin
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    caller: Caller,
    request: Request,
}

/// One line on stdout
#[derive(Debug, Serialize)]
struct Reply {
    id: Value,
    response: Response,
}

pub async fn serve(config_path: &Path, metrics_port: Option<u16>, dry_run: bool) -> Result<()> {
    let config = DaemonConfig::load_or_default(config_path)?;

    if dry_run {
        info!("dry run: backend calls are recorded, not executed");
        run_daemon(&config, MemoryBackend::new(), metrics_port).await
    } else {
        let backend = IptablesBackend::new(config.backend.clone());
        run_daemon(&config, backend, metrics_port).await
    }
}

/// Build the dispatcher from the daemon configuration
pub async fn boot<B: Backend>(config: &DaemonConfig, backend: B) -> Result<Dispatcher<B>> {
    let whitelist = match &config.lockdown_whitelist {
        Some(path) => LockdownWhitelist::from_file(path)?,
        None => LockdownWhitelist::default(),
    };
    let lockdown = Arc::new(LockdownPolicy::new(Arc::new(whitelist)));
    if config.lockdown {
        lockdown.enable_lockdown().await?;
    }

    let direct = Arc::new(DirectEngine::new(backend));
    if let Some(path) = &config.direct {
        let direct_config = DirectConfig::from_file(path)?;
        match direct.load(&direct_config).await {
            Ok(()) => {}
            Err(err) if err.is_backend() => {
                warn!("direct configuration loaded but not applied: {}", err);
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("Invalid direct configuration {:?}", path)));
            }
        }
    }

    Ok(Dispatcher::new(direct, lockdown))
}

async fn run_daemon<B: Backend + 'static>(
    config: &DaemonConfig,
    backend: B,
    metrics_port: Option<u16>,
) -> Result<()> {
    let dispatcher = boot(config, backend).await?;

    let metrics = Arc::new(MetricsCollector::new()?);
    refresh_metrics(&dispatcher, &metrics).await;
    if let Some(port) = metrics_port {
        let server = MetricsServer::new(metrics.clone(), port);
        tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                error!("metrics server failed: {}", e);
            }
        });
    }

    info!("serving requests on stdin");
    let served = serve_lines(
        config,
        &dispatcher,
        metrics,
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await;

    shutdown(&dispatcher).await;
    served
}

/// Answer one JSON request per input line until EOF, a read error or Ctrl-C.
///
/// Requests run concurrently; every one that started is finished before
/// this returns. SIGHUP re-reads the lockdown whitelist.
pub async fn serve_lines<B, R, W>(
    config: &DaemonConfig,
    dispatcher: &Dispatcher<B>,
    metrics: Arc<MetricsCollector>,
    input: R,
    output: W,
) -> Result<()>
where
    B: Backend + 'static,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    let (tx, mut rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            if let Err(e) = output.write_all(line.as_bytes()).await {
                warn!("failed to write reply, dropping further replies: {}", e);
                break;
            }
            if let Err(e) = output.flush().await {
                warn!("failed to flush reply, dropping further replies: {}", e);
                break;
            }
        }
    });

    let mut reader = BufReader::new(input);
    let mut buf = Vec::new();
    let mut in_flight = JoinSet::new();

    loop {
        let raw = tokio::select! {
            read = reader.read_until(b'\n', &mut buf) => match read {
                Ok(0) if buf.is_empty() => break,
                Ok(_) => std::mem::take(&mut buf),
                Err(e) => {
                    warn!("failed to read requests, shutting down: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            _ = hangup.recv() => {
                if let Err(e) = reload_whitelist(config, dispatcher.lockdown()).await {
                    warn!("keeping current lockdown whitelist: {:#}", e);
                }
                continue;
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
        };

        let dispatcher = dispatcher.clone();
        let metrics = metrics.clone();
        let tx = tx.clone();
        in_flight.spawn(async move {
            if let Some(reply) = handle_bytes(&dispatcher, &metrics, raw).await {
                if tx.send(reply).await.is_err() {
                    warn!("reply dropped, stdout writer has stopped");
                }
            }
        });
    }

    while in_flight.join_next().await.is_some() {}
    drop(tx);
    let _ = writer.await;
    Ok(())
}

/// Re-read the lockdown whitelist file. The current whitelist stays on failure.
pub async fn reload_whitelist(config: &DaemonConfig, lockdown: &LockdownPolicy) -> Result<()> {
    let Some(path) = &config.lockdown_whitelist else {
        return Ok(());
    };
    let whitelist = LockdownWhitelist::from_file(path)?;
    lockdown.replace_whitelist(Arc::new(whitelist)).await;
    info!("reloaded lockdown whitelist from {:?}", path);
    Ok(())
}

/// Decode one raw input line. Blank lines get no reply.
pub async fn handle_bytes<B: Backend>(
    dispatcher: &Dispatcher<B>,
    metrics: &MetricsCollector,
    raw: Vec<u8>,
) -> Option<String> {
    match String::from_utf8(raw) {
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(handle_line(dispatcher, metrics, line.trim()).await),
        Err(e) => {
            let lossy = String::from_utf8_lossy(e.as_bytes()).into_owned();
            let message = format!("request is not valid UTF-8: {}", e.utf8_error());
            let response = malformed(message);
            Some(finish(dispatcher, metrics, request_id(&lossy), "invalid", response).await)
        }
    }
}

pub async fn handle_line<B: Backend>(
    dispatcher: &Dispatcher<B>,
    metrics: &MetricsCollector,
    line: &str,
) -> String {
    let (id, method, response) = match serde_json::from_str::<Envelope>(line) {
        Ok(envelope) => {
            let method = envelope.request.method();
            let response = dispatcher.handle(&envelope.caller, envelope.request).await;
            (envelope.id, method, response)
        }
        Err(e) => (
            request_id(line),
            "invalid",
            malformed(format!("malformed request: {}", e)),
        ),
    };
    finish(dispatcher, metrics, id, method, response).await
}

/// Best-effort `id` of a line that did not parse as a request
fn request_id(line: &str) -> Value {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("id").cloned())
        .unwrap_or(Value::Null)
}

fn malformed(message: String) -> Response {
    Response::error(&Error::InvalidArgument(message))
}

async fn finish<B: Backend>(
    dispatcher: &Dispatcher<B>,
    metrics: &MetricsCollector,
    id: Value,
    method: &str,
    response: Response,
) -> String {
    let result = response.error_kind().map_or("ok", |kind| kind.as_str());
    metrics.record_request(method, result);
    refresh_metrics(dispatcher, metrics).await;

    match serde_json::to_string(&Reply { id, response }) {
        Ok(json) => json,
        Err(e) => {
            error!("failed to encode reply: {}", e);
            r#"{"id":null,"response":{"ok":false}}"#.to_string()
        }
    }
}

async fn refresh_metrics<B: Backend>(dispatcher: &Dispatcher<B>, metrics: &MetricsCollector) {
    let chains = dispatcher.direct().get_all_chains().await;
    let rules = dispatcher.direct().get_all_rules().await;
    metrics.update_store(&chains, &rules);
    metrics.set_lockdown(dispatcher.lockdown().query_lockdown().await);
}

/// Tear down direct state and reset lockdown
pub async fn shutdown<B: Backend>(dispatcher: &Dispatcher<B>) {
    if let Err(e) = dispatcher.direct().cleanup().await {
        warn!("cleanup left backend state behind: {}", e);
    }
    dispatcher.lockdown().cleanup().await;
    info!("shutdown complete");
}
