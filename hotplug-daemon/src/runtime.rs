use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hotplug_core::db::is_valid_tag;
use hotplug_core::{DaemonConfig, FileDeviceDb, LogFormat};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::broadcast::{BroadcastGateway, MonitorTransport};
use crate::engine::{ControlMessage, Engine, EngineSettings, EngineStatus};
use crate::error::{io_err, DaemonError};
use crate::finalizer::Finalizer;
use crate::paths::{config_path, db_root, run_dir, socket_path, DAEMON_LABEL};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::runner::{CommandRunner, PassthroughRunner, RuleRunner};
use crate::source::{self, ChannelSource, EventSender, JsonLinesSource};

/// Command-line overrides applied on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub children_max: Option<usize>,
    pub rules_program: Option<PathBuf>,
    /// Also read JSON device lines from stdin.
    pub read_stdin: bool,
}

/// Everything a control-socket client handler needs.
#[derive(Clone)]
struct ControlContext {
    home: PathBuf,
    control: mpsc::Sender<ControlMessage>,
    events: EventSender,
    monitor: MonitorTransport,
    shutdown: broadcast::Sender<()>,
    rules_program: Option<PathBuf>,
    started_at_unix: u64,
}

/// Load `<home>/.hotplug/config.yaml` and apply `options` on top.
pub fn load_config(home: &Path, options: &DaemonOptions) -> Result<DaemonConfig, DaemonError> {
    let mut config = DaemonConfig::load_at(&config_path(home))?;
    if let Some(children_max) = options.children_max {
        config.children_max = children_max;
    }
    if let Some(program) = &options.rules_program {
        config.rules_program = Some(program.clone());
    }
    config.validate()?;
    Ok(config)
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path, options: DaemonOptions) -> Result<(), DaemonError> {
    let config = load_config(home, &options)?;
    init_tracing(&config);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config, options.read_stdin))
}

/// Run the daemon runtime.
pub async fn run(home: PathBuf, config: DaemonConfig, read_stdin: bool) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let started_at_unix = unix_seconds_now();

    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let (control_tx, control_rx) = mpsc::channel::<ControlMessage>(64);
    let (events, source) = source::channel(1024);
    let (finalized_tx, finalized_rx) = mpsc::unbounded_channel();
    let monitor = MonitorTransport::new(256);
    let settings = EngineSettings::from(&config);

    tracing::info!(
        workers = settings.workers,
        event_timeout_secs = settings.event_timeout.as_secs(),
        rules = ?config.rules_program,
        "starting hotplug daemon",
    );

    let engine_handle = match &config.rules_program {
        Some(program) => spawn_engine(
            Engine::new(settings, Arc::new(CommandRunner::new(program)), finalized_tx),
            source,
            control_rx,
            &shutdown_tx,
        ),
        None => spawn_engine(
            Engine::new(settings, Arc::new(PassthroughRunner), finalized_tx),
            source,
            control_rx,
            &shutdown_tx,
        ),
    };

    let finalizer_handle = {
        let db = Arc::new(FileDeviceDb::new(db_root(&home)));
        let gateway = BroadcastGateway::new(Arc::new(monitor.clone()));
        let finalizer = Finalizer::new(db, gateway);
        tokio::spawn(async move {
            let handled = finalizer.run(finalized_rx).await;
            tracing::info!(handled, "finalizer stopped");
            Ok::<(), DaemonError>(())
        })
    };

    let stdin_handle = {
        let shutdown = shutdown_tx.clone();
        let events = events.clone();
        tokio::spawn(async move {
            if !read_stdin {
                return Ok::<(), DaemonError>(());
            }
            let mut shutdown_rx = shutdown.subscribe();
            let stdin = JsonLinesSource::new(BufReader::new(tokio::io::stdin()));
            tokio::select! {
                _ = shutdown_rx.recv() => {}
                forwarded = source::forward(stdin, events) => {
                    tracing::info!(forwarded, "stdin closed");
                }
            }
            Ok(())
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let context = ControlContext {
            home: home.clone(),
            control: control_tx,
            events,
            monitor,
            shutdown: shutdown.clone(),
            rules_program: config.rules_program.clone(),
            started_at_unix,
        };
        tokio::spawn(async move {
            let result = socket_server_task(context, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = wait_for_signal() => match signal {
                    Ok(name) => {
                        tracing::info!(signal = name, "received signal, shutting down daemon");
                        let _ = shutdown.send(());
                        Ok(())
                    }
                    Err(err) => Err(err),
                },
            }
        })
    };

    let (engine_result, finalizer_result, stdin_result, socket_result, signal_result) = tokio::join!(
        engine_handle,
        finalizer_handle,
        stdin_handle,
        socket_handle,
        signal_handle
    );

    handle_join("engine", engine_result)?;
    handle_join("finalizer", finalizer_result)?;
    handle_join("stdin_reader", stdin_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

fn spawn_engine<R: RuleRunner>(
    engine: Engine<R>,
    source: ChannelSource,
    control: mpsc::Receiver<ControlMessage>,
    shutdown: &broadcast::Sender<()>,
) -> JoinHandle<Result<(), DaemonError>> {
    let shutdown = shutdown.clone();
    let shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        let stats = engine.run(source, control, shutdown_rx).await;
        tracing::info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            discarded = stats.discarded,
            "engine stopped",
        );
        let _ = shutdown.send(());
        Ok(())
    })
}

async fn wait_for_signal() -> Result<&'static str, DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).map_err(|e| io_err("SIGTERM handler", e))?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.map_err(|e| io_err("ctrl-c handler", e))?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

async fn socket_server_task(
    context: ControlContext,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let run = run_dir(&context.home);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
    }

    let socket = socket_path(&context.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let context = context.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, context).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(stream: UnixStream, context: ControlContext) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "ping" => DaemonResponse::ok(json!({ "pong": true })),
            "status" => match engine_status(&context.control).await {
                Ok(status) => DaemonResponse::ok(build_status_payload(&context, &status)),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            "pause" | "resume" => {
                match set_paused(&context.control, request.cmd == "pause").await {
                    Ok(paused) => DaemonResponse::ok(json!({ "paused": paused })),
                    Err(err) => DaemonResponse::error(err.to_string()),
                }
            }
            "settle" => {
                let timeout = request.timeout_ms.map(Duration::from_millis);
                match settle(&context.control, timeout).await {
                    Ok(()) => DaemonResponse::ok(json!({ "settled": true })),
                    Err(err) => DaemonResponse::error(err.to_string()),
                }
            }
            "trigger" => match request.device {
                Some(device) if !device.tags.iter().all(|tag| is_valid_tag(tag)) => {
                    DaemonResponse::error("trigger device carries an invalid tag")
                }
                Some(device) => {
                    tracing::debug!(devpath = %device.devpath, action = %device.action, "device triggered over control socket");
                    match context.events.send(device).await {
                        Ok(()) => DaemonResponse::ok(json!({ "queued": true })),
                        Err(err) => DaemonResponse::error(err.to_string()),
                    }
                }
                None => DaemonResponse::error("trigger requires a device"),
            },
            "monitor" => {
                write_response(&mut writer, &DaemonResponse::ok(json!({ "monitoring": true })))
                    .await?;
                return stream_devices(&mut writer, &context).await;
            }
            "stop" => {
                let _ = context.shutdown.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

/// Forward every broadcast device to a `monitor` client until it hangs up
/// or the daemon stops.
async fn stream_devices(
    writer: &mut OwnedWriteHalf,
    context: &ControlContext,
) -> Result<(), DaemonError> {
    let mut devices = context.monitor.subscribe();
    let mut shutdown_rx = context.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return Ok(()),
            received = devices.recv() => match received {
                Ok(device) => {
                    let payload = serde_json::to_string(device.as_ref())?;
                    if write_line(writer, &payload).await.is_err() {
                        tracing::debug!("monitor client disconnected");
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "monitor client fell behind, devices dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn engine_status(
    control: &mpsc::Sender<ControlMessage>,
) -> Result<EngineStatus, DaemonError> {
    let (tx, rx) = oneshot::channel();
    control
        .send(ControlMessage::Status(tx))
        .await
        .map_err(|_| DaemonError::ChannelClosed("engine control"))?;
    rx.await
        .map_err(|_| DaemonError::ChannelClosed("engine status response"))
}

async fn set_paused(
    control: &mpsc::Sender<ControlMessage>,
    paused: bool,
) -> Result<bool, DaemonError> {
    let (tx, rx) = oneshot::channel();
    control
        .send(ControlMessage::SetPaused {
            paused,
            respond_to: tx,
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("engine control"))?;
    rx.await
        .map_err(|_| DaemonError::ChannelClosed("engine pause response"))
}

async fn settle(
    control: &mpsc::Sender<ControlMessage>,
    timeout: Option<Duration>,
) -> Result<(), DaemonError> {
    let (tx, rx) = oneshot::channel();
    control
        .send(ControlMessage::Settle(tx))
        .await
        .map_err(|_| DaemonError::ChannelClosed("engine control"))?;
    let settled = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, rx).await.map_err(|_| {
            DaemonError::Protocol(format!(
                "queue did not settle within {}ms",
                timeout.as_millis()
            ))
        })?,
        None => rx.await,
    };
    settled.map_err(|_| DaemonError::ChannelClosed("engine settle response"))
}

fn build_status_payload(context: &ControlContext, status: &EngineStatus) -> Value {
    json!({
        "running": true,
        "label": DAEMON_LABEL,
        "pid": std::process::id(),
        "started_at_unix": context.started_at_unix,
        "socket": socket_path(&context.home).display().to_string(),
        "db_root": db_root(&context.home).display().to_string(),
        "rules_program": context.rules_program.as_ref().map(|p| p.display().to_string()),
        "monitors": context.monitor.listeners(),
        "engine": status,
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [db_root(home), run_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_line(writer: &mut OwnedWriteHalf, payload: &str) -> Result<(), DaemonError> {
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    write_line(writer, &payload).await
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &DaemonConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = match config.log_format {
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
        LogFormat::Text => fmt().with_env_filter(filter).with_target(false).try_init(),
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
