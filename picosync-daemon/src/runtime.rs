use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};

use picosync_core::{config, Settings};
use picosync_device::{bootsel, DeviceTool, Mpremote};

use crate::dispatcher::{Control, Dispatcher, Input};
use crate::error::{io_err, DaemonError};
use crate::events::EventSink;
use crate::journal::{self, Journal};
use crate::monitor::monitor_task;
use crate::paths::{journal_path, logs_dir, picosync_root, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon with the saved settings and the `mpremote` tool.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let settings = config::load_at(&home)?;
    let tool: Arc<dyn DeviceTool> = Arc::new(Mpremote::from_settings(&settings.tool, &settings.engine));
    serve(home, settings, tool, bootsel::default_mount_roots()).await
}

/// Run the daemon around an arbitrary device tool.
///
/// Returns once a `stop` request, a signal, or a failing task triggers
/// shutdown and every task has wound down.
pub async fn serve(
    home: PathBuf,
    settings: Settings,
    tool: Arc<dyn DeviceTool>,
    mount_roots: Vec<PathBuf>,
) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let (input_tx, input_rx) = mpsc::channel::<Input>(256);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let (events, journal_writer) = EventSink::with_journal(Journal::new(journal_path(&home)));
    let mut dispatcher = Dispatcher::new(settings.clone(), tool.clone(), events, input_tx.clone());
    dispatcher.open()?;

    let dispatcher_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = dispatcher.run(input_rx, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let monitor_handle = {
        let shutdown = shutdown_tx.clone();
        let inputs = input_tx.clone();
        let engine = settings.engine.clone();
        let pinned = settings.tool.port.clone();
        tokio::spawn(async move {
            let result = monitor_task(
                tool,
                engine,
                pinned,
                mount_roots,
                inputs,
                shutdown.subscribe(),
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let inputs = input_tx.clone();
        tokio::spawn(async move {
            let result =
                socket_server_task(home, inputs, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };
    drop(input_tx);

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        tokio::spawn(async move {
            let result = log_rotation_task(home, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move { signal_task(shutdown).await })
    };

    let (dispatcher_result, monitor_result, socket_result, rotation_result, signal_result) = tokio::join!(
        dispatcher_handle,
        monitor_handle,
        socket_handle,
        rotation_handle,
        signal_handle
    );

    handle_join("dispatcher", dispatcher_result)?;
    handle_join("device_monitor", monitor_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("log_rotation", rotation_result)?;
    handle_join("signal_handler", signal_result)?;
    // The dispatcher held the last sink; the writer only has its backlog left.
    if let Err(err) = journal_writer.await {
        tracing::warn!(error = %err, "journal writer join failure");
    }
    tracing::info!("daemon stopped");
    Ok(())
}

async fn signal_task(shutdown: broadcast::Sender<()>) -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut shutdown_rx = shutdown.subscribe();
    let mut terminate = signal(SignalKind::terminate())
        .map_err(|err| DaemonError::Protocol(format!("SIGTERM handler failed: {err}")))?;
    tokio::select! {
        _ = shutdown_rx.recv() => Ok(()),
        _ = terminate.recv() => {
            tracing::info!("received SIGTERM, shutting down daemon");
            let _ = shutdown.send(());
            Ok(())
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    tracing::info!("received ctrl-c, shutting down daemon");
                    let _ = shutdown.send(());
                    Ok(())
                }
                Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
            }
        }
    }
}

async fn socket_server_task(
    home: PathBuf,
    inputs: mpsc::Sender<Input>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "daemon listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let home = home.clone();
                let inputs = inputs.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, home, inputs, shutdown_tx).await {
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

async fn handle_socket_client(
    stream: UnixStream,
    home: PathBuf,
    inputs: mpsc::Sender<Input>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
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

        let stop = request.cmd == "stop";
        let response = if stop {
            let _ = shutdown_tx.send(());
            DaemonResponse::ok(serde_json::json!({ "stopping": true }))
        } else {
            match respond(&home, &inputs, request).await {
                Ok(data) => DaemonResponse::ok(data),
                Err(message) => DaemonResponse::error(message),
            }
        };

        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

/// Turn one request into a dispatcher control and await its answer.
async fn respond(
    home: &Path,
    inputs: &mpsc::Sender<Input>,
    request: DaemonRequest,
) -> Result<Value, String> {
    let control = match request.cmd.as_str() {
        "status" => Control::Status,
        "sync" => Control::Sync,
        "reset" => Control::Reset,
        "wipe" => Control::Wipe,
        "ls" => Control::List(request.path),
        "push" => Control::Upload(PathBuf::from(required_path(request.path, "push")?)),
        "rm" => Control::Remove(required_path(request.path, "rm")?),
        "reload" => {
            let home = home.to_path_buf();
            let settings = tokio::task::spawn_blocking(move || config::load_at(&home))
                .await
                .map_err(|err| format!("settings reload join error: {err}"))?
                .map_err(|err| err.to_string())?;
            Control::Reconfigure(Box::new(settings))
        }
        other => return Err(format!("unknown command '{other}'")),
    };
    let is_status = matches!(control, Control::Status);

    let mut data = dispatch(inputs, control).await.map_err(|e| e.to_string())??;
    if is_status {
        if let Value::Object(map) = &mut data {
            map.insert(
                "socket".to_string(),
                Value::String(socket_path(home).display().to_string()),
            );
            map.insert(
                "journal".to_string(),
                Value::String(journal_path(home).display().to_string()),
            );
        }
    }
    Ok(data)
}

fn required_path(path: Option<String>, cmd: &str) -> Result<String, String> {
    path.filter(|p| !p.trim().is_empty())
        .ok_or_else(|| format!("'{cmd}' needs a path"))
}

async fn dispatch(
    inputs: &mpsc::Sender<Input>,
    control: Control,
) -> Result<Result<Value, String>, DaemonError> {
    let (tx, rx) = oneshot::channel();
    inputs
        .send(Input::Control(control, tx))
        .await
        .map_err(|_| DaemonError::ChannelClosed("dispatcher"))?;
    rx.await
        .map_err(|_| DaemonError::ChannelClosed("dispatcher reply"))
}

async fn log_rotation_task(
    home: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await; // consume the first immediate tick

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let home = home.clone();
                tokio::task::spawn_blocking(move || journal::rotate_logs(&home))
                    .await
                    .ok(); // rotate_logs reports its own failures
            }
        }
    }
    Ok(())
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
    for dir in [picosync_root(home), logs_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
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
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
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

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var_os("PICOSYNC_LOG_JSON").is_some() {
        let _ = fmt().json().with_env_filter(filter).try_init();
    } else {
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    }
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
