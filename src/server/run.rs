//! Server thread loops.
//!
//! Three kinds of threads:
//! - Socket acceptors (TCP clients, optional Unix control socket)
//! - Per-connection handlers that decode frames and forward requests
//! - The state thread, which owns the `Server` and processes messages
//!   sequentially. This is THE serialization point: the effect on the
//!   store is a serial order of whole handlers.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};

use super::admin::{AdminOutcome, handle_admin_command};
use super::{Reply, Server, error_doc, proto};

const FLUSH_INTERVAL: Duration = Duration::from_secs(10 * 60);
const ACCEPT_POLL: Duration = Duration::from_millis(100);

pub struct RequestMessage {
    pub doc: crate::document::Document,
    pub addr: String,
    pub respond: Sender<Option<Reply>>,
}

pub struct AdminMessage {
    pub line: String,
    pub respond: Sender<String>,
}

pub enum LoopMessage {
    Request(RequestMessage),
    Admin(AdminMessage),
    Reload,
    Shutdown,
}

/// Runs the state thread loop until shutdown. Flushes the config on a
/// fixed deadline and once more on teardown.
pub fn run_state_loop(
    mut server: Server,
    rx: Receiver<LoopMessage>,
    shutdown: Arc<AtomicBool>,
) {
    let mut next_flush = Instant::now() + FLUSH_INTERVAL;

    loop {
        let wait = next_flush.saturating_duration_since(Instant::now());
        let flush_tick = crossbeam::channel::after(wait);

        crossbeam::select! {
            recv(rx) -> msg => match msg {
                Ok(LoopMessage::Request(RequestMessage { doc, addr, respond })) => {
                    let reply = server.handle_request(doc, &addr);
                    let _ = respond.send(reply);
                }
                Ok(LoopMessage::Admin(AdminMessage { line, respond })) => {
                    match handle_admin_command(&mut server, &line) {
                        AdminOutcome::Handled(reply) => {
                            let _ = respond.send(reply);
                        }
                        AdminOutcome::Shutdown(reply) => {
                            let _ = respond.send(reply);
                            break;
                        }
                    }
                }
                Ok(LoopMessage::Reload) => {
                    tracing::info!("SIGHUP caught, reloading config");
                    match server.reload() {
                        Ok(()) => tracing::info!("reloaded configuration"),
                        Err(e) => tracing::error!("configuration reload failed: {e}"),
                    }
                }
                Ok(LoopMessage::Shutdown) | Err(_) => break,
            },
            recv(flush_tick) -> _ => {
                // A failing flush means the store can no longer persist;
                // carrying on would silently drop mutations.
                if let Err(e) = server.write_config() {
                    tracing::error!("periodic flush failed, shutting down: {e}");
                    break;
                }
                next_flush = Instant::now() + FLUSH_INTERVAL;
            }
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    if let Err(e) = server.write_config() {
        tracing::error!("final flush failed: {e}");
    }
    tracing::info!("server stopped");
}

/// Binds the sockets, spawns the worker threads, and blocks until
/// shutdown. This never returns early on success.
pub fn run_server(server: Server) -> crate::Result<()> {
    let port = server.port();
    let compress_level = server.config().compress_level;
    let size_limit = server.config().document_size_limit;
    let control_socket = match server.config().control_socket.as_str() {
        "" => None,
        path => Some(server.store.root().join(path)),
    };

    // Rust ignores SIGPIPE by default, so a dropped client cannot kill
    // the process mid-send.
    let shutdown = Arc::new(AtomicBool::new(false));
    let sighup = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGHUP, sighup.clone());

    let (tx, rx) = crossbeam::channel::unbounded::<LoopMessage>();

    let state_handle = {
        let shutdown = shutdown.clone();
        std::thread::spawn(move || run_state_loop(server, rx, shutdown))
    };

    let control_handle = control_socket.clone().map(|path| {
        let tx = tx.clone();
        let shutdown = shutdown.clone();
        std::thread::spawn(move || run_control_loop(path, tx, shutdown))
    });

    let listener = TcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;
    tracing::info!("listening on port {port}");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            tracing::info!("shutdown requested");
            break;
        }
        if sighup.swap(false, Ordering::Relaxed) {
            let _ = tx.send(LoopMessage::Reload);
        }

        match listener.accept() {
            Ok((stream, _)) => {
                let tx = tx.clone();
                std::thread::spawn(move || {
                    let _ = stream.set_nonblocking(false);
                    handle_client(stream, tx, size_limit, compress_level);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                tracing::error!("accept error: {e}");
            }
        }
    }

    let _ = tx.send(LoopMessage::Shutdown);
    drop(tx);
    let _ = state_handle.join();
    if let Some(handle) = control_handle {
        let _ = handle.join();
    }
    if let Some(path) = control_socket {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

/// Handles one client connection: read a framed document, run it through
/// the state thread, write the reply, repeat until the peer goes away.
fn handle_client(
    stream: TcpStream,
    tx: Sender<LoopMessage>,
    size_limit: usize,
    compress_level: u32,
) {
    let addr = stream
        .peer_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_default();
    let reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(e) => {
            tracing::error!("failed to clone stream: {e}");
            return;
        }
    };
    let mut reader = BufReader::new(reader);
    let mut writer = stream;

    loop {
        let doc = match proto::read_document(&mut reader, size_limit) {
            Ok(Some(doc)) => doc,
            Ok(None) => break, // clean disconnect
            Err(e) => {
                tracing::warn!("[{addr}] bad request: {e}");
                let doc = error_doc("Invalid request document.");
                let _ = proto::write_document(&mut writer, &doc, compress_level);
                break;
            }
        };

        let (respond_tx, respond_rx) = crossbeam::channel::bounded(1);
        let message = RequestMessage {
            doc,
            addr: addr.clone(),
            respond: respond_tx,
        };
        if tx.send(LoopMessage::Request(message)).is_err() {
            break; // state thread is gone
        }

        match respond_rx.recv() {
            Ok(Some(Reply::Doc(doc))) => {
                if let Err(e) = proto::write_document(&mut writer, &doc, compress_level) {
                    tracing::debug!("[{addr}] send failed: {e}");
                    break;
                }
            }
            Ok(Some(Reply::File(path))) => {
                if let Err(e) = proto::send_file(&mut writer, &path) {
                    tracing::debug!("[{addr}] file send failed: {e}");
                    break;
                }
            }
            Ok(None) => continue,
            Err(_) => break,
        }
    }
}

/// Accepts control-socket connections and relays one command per line.
fn run_control_loop(path: PathBuf, tx: Sender<LoopMessage>, shutdown: Arc<AtomicBool>) {
    let _ = std::fs::remove_file(&path);
    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("could not open control socket at {}: {e}", path.display());
            return;
        }
    };
    if listener.set_nonblocking(true).is_err() {
        return;
    }
    tracing::info!(
        "opened control socket at {}; server commands may be written to it",
        path.display()
    );

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let tx = tx.clone();
                std::thread::spawn(move || handle_control_client(stream, tx));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                tracing::error!("control socket accept error: {e}");
            }
        }
    }
}

fn handle_control_client(stream: UnixStream, tx: Sender<LoopMessage>) {
    let _ = stream.set_nonblocking(false);
    let reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(_) => return,
    };
    let reader = BufReader::new(reader);
    let mut writer = stream;

    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let (respond_tx, respond_rx) = crossbeam::channel::bounded(1);
        let message = AdminMessage {
            line,
            respond: respond_tx,
        };
        if tx.send(LoopMessage::Admin(message)).is_err() {
            break;
        }
        match respond_rx.recv() {
            Ok(reply) => {
                if writeln!(writer, "{reply}").is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}
