//! Daemon runner.
//!
//! `domaind run` starts the service in the current process: bind the
//! control socket, open the mapping store, spawn the state thread, then
//! accept clients until a signal or a shutdown request arrives.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::Sid;
use crate::daemon::discovery::Discovery;
use crate::daemon::ipc::{
    decode_request, encode_response, ensure_socket_dir, DaemonMeta, ErrorPayload, IpcError,
    Request, Response, IPC_PROTOCOL_VERSION,
};
use crate::daemon::server::{run_state_loop, Daemon, RequestMessage};
use crate::daemon::transport::{SecurityProvider, TcpProbeProvider};
use crate::store::{IdRange, IdmapConfig, IdmapStore};
use crate::Result;

/// Run the daemon in the current process.
///
/// Does not return until a shutdown signal or IPC shutdown request.
pub fn run_daemon(config: Config) -> Result<()> {
    ensure_socket_dir()?;
    let socket = crate::paths::socket_path();
    let meta_path = crate::paths::meta_path();

    // If another daemon is already listening, exit quietly.
    if UnixStream::connect(&socket).is_ok() {
        warn!(socket = %socket.display(), "daemon already running");
        return Ok(());
    }

    // Remove a stale socket left by an unclean exit.
    let _ = std::fs::remove_file(&socket);

    let listener = UnixListener::bind(&socket).map_err(IpcError::from)?;
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&socket, std::fs::Permissions::from_mode(0o600));
    }
    info!(socket = %socket.display(), "daemon listening");

    // Metadata for client version checks.
    let meta = DaemonMeta {
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: IPC_PROTOCOL_VERSION,
        pid: std::process::id(),
    };
    let _ = std::fs::write(
        &meta_path,
        serde_json::to_vec(&meta).unwrap_or_else(|_| b"{}".to_vec()),
    );
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&meta_path, std::fs::Permissions::from_mode(0o600));
    }

    // Graceful shutdown on SIGTERM/SIGINT.
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone());
        let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone());
    }

    let (req_tx, req_rx) = crossbeam::channel::unbounded::<RequestMessage>();
    let (events_tx, events_rx) = crossbeam::channel::unbounded();
    let (probe_timer_tx, probe_timer_rx) = crossbeam::channel::unbounded::<String>();
    let (trust_tick_tx, trust_tick_rx) = crossbeam::channel::unbounded::<()>();

    let store = open_store(&config)?;

    let machine = config.auth.machine_account_or_default();
    let discovery = Arc::new(Discovery::standard(&config.connect, machine));
    let provider: Arc<dyn SecurityProvider> = Arc::new(TcpProbeProvider);

    let rescan = config.server.trust_rescan();
    let daemon = Daemon::new(
        config,
        provider,
        discovery,
        store,
        events_tx,
        probe_timer_tx,
    );

    let state_handle = std::thread::spawn(move || {
        run_state_loop(daemon, req_rx, events_rx, probe_timer_rx, trust_tick_rx);
    });

    // Periodic trust rescans. The thread dies with the state loop when the
    // tick channel's receiver goes away.
    std::thread::spawn(move || loop {
        std::thread::sleep(rescan);
        if trust_tick_tx.send(()).is_err() {
            break;
        }
    });

    // Non-blocking accepts so the signal flag gets checked.
    listener.set_nonblocking(true).map_err(IpcError::from)?;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("shutdown signal received");
            break;
        }
        if state_loop_finished(&state_handle) {
            break;
        }

        match listener.accept() {
            Ok((stream, _)) => {
                let req_tx = req_tx.clone();
                std::thread::spawn(move || {
                    let _ = stream.set_nonblocking(false);
                    handle_client(stream, req_tx);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            Err(e) => {
                error!(error = %e, "accept error");
            }
        }
    }

    // On signal shutdown, ask the state thread to wind down cleanly.
    if shutdown.load(Ordering::Relaxed) {
        let (respond_tx, respond_rx) = crossbeam::channel::bounded(1);
        let _ = req_tx.send(RequestMessage {
            request: Request::Shutdown,
            respond: respond_tx,
        });
        let _ = respond_rx.recv_timeout(std::time::Duration::from_secs(10));
    }

    drop(req_tx);
    let _ = state_handle.join();

    let _ = std::fs::remove_file(&socket);
    let _ = std::fs::remove_file(&meta_path);
    info!("daemon stopped");
    Ok(())
}

fn state_loop_finished(handle: &std::thread::JoinHandle<()>) -> bool {
    handle.is_finished()
}

fn open_store(config: &Config) -> Result<IdmapStore> {
    let store_config = IdmapConfig {
        uid_range: IdRange::new(config.idmap.uid_low, config.idmap.uid_high),
        gid_range: IdRange::new(config.idmap.gid_low, config.idmap.gid_high),
        path: config.idmap.path.clone(),
    };
    let path = config
        .idmap
        .path
        .clone()
        .unwrap_or_else(crate::paths::idmap_store_path);

    // Legacy records name domains by their short name; resolve through the
    // statically configured SIDs during the upgrade pass.
    let known: Vec<(String, Sid)> = config
        .static_domains
        .iter()
        .filter_map(|d| {
            let sid = d.sid.as_deref()?;
            Sid::parse(sid).ok().map(|sid| (d.name.to_uppercase(), sid))
        })
        .collect();
    let resolve = move |name: &str| {
        let name = name.to_uppercase();
        known
            .iter()
            .find(|(known_name, _)| *known_name == name)
            .map(|(_, sid)| sid.clone())
    };

    let store = IdmapStore::open(&path, store_config, resolve)?;
    info!(path = %path.display(), mappings = store.mapping_count().unwrap_or(0), "idmap store open");
    Ok(store)
}

/// Handle a single client connection.
///
/// Reads newline-delimited requests, forwards them to the state thread, and
/// writes each answer back on the same stream.
fn handle_client(stream: UnixStream, req_tx: crossbeam::channel::Sender<RequestMessage>) {
    let reader = match stream.try_clone() {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "failed to clone client stream");
            return;
        }
    };
    let reader = BufReader::new(reader);
    let mut writer = stream;

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };

        if line.trim().is_empty() {
            continue;
        }

        let request = match decode_request(&line) {
            Ok(r) => r,
            Err(e) => {
                let resp = Response::err(ErrorPayload {
                    code: "parse_error".into(),
                    message: e.to_string(),
                    details: None,
                });
                if write_response(&mut writer, &resp).is_err() {
                    break;
                }
                continue;
            }
        };

        let is_shutdown = matches!(request, Request::Shutdown);

        let (respond_tx, respond_rx) = crossbeam::channel::bounded(1);
        if req_tx
            .send(RequestMessage {
                request,
                respond: respond_tx,
            })
            .is_err()
        {
            break;
        }

        let response = match respond_rx.recv() {
            Ok(r) => r,
            Err(_) => break,
        };

        if write_response(&mut writer, &response).is_err() {
            break;
        }

        if is_shutdown {
            break;
        }
    }
}

fn write_response(writer: &mut UnixStream, response: &Response) -> std::io::Result<()> {
    let bytes = encode_response(response).unwrap_or_else(|e| {
        let msg = e.to_string().replace('"', "\\\"");
        format!("{{\"err\":{{\"code\":\"internal\",\"message\":\"{msg}\"}}}}\n").into_bytes()
    });
    writer.write_all(&bytes)?;
    writer.flush()
}
