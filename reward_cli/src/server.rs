//! TCP front end: one thread per connection, one request per line.

use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use eyre::WrapErr;
use reward_config::Config;
use reward_core::util::SharedClock;
use reward_core::{Controller, ControllerOptions};
use reward_traits::{Board, MonotonicClock};

use crate::protocol::{Action, Reply, handle_frame};

const POLL: Duration = Duration::from_millis(50);

/// Longest accepted request line in bytes, newline excluded. A longer line
/// is answered with `ERROR` and skipped up to its newline.
pub const MAX_FRAME: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub simulate: bool,
    pub reset_positions: bool,
}

/// Cloneable trigger that stops [`Server::run`].
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Server {
    ctrl: Arc<Controller>,
    listener: TcpListener,
    shutdown: Shutdown,
}

impl Server {
    pub fn new(ctrl: Arc<Controller>, listener: TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            ctrl,
            listener,
            shutdown: Shutdown::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Accept connections until shut down, then wait for every connection
    /// thread to notice.
    pub fn run(self) {
        let mut connections: Vec<JoinHandle<()>> = Vec::new();
        while !self.shutdown.is_triggered() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    tracing::info!(%peer, "client connected");
                    let ctrl = self.ctrl.clone();
                    let shutdown = self.shutdown.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("conn-{peer}"))
                        .spawn(move || {
                            if let Err(e) = serve_connection(&ctrl, stream, &shutdown) {
                                tracing::debug!(%peer, error = %e, "connection closed with error");
                            }
                            tracing::info!(%peer, "client disconnected");
                        });
                    match spawned {
                        Ok(h) => connections.push(h),
                        Err(e) => tracing::error!(error = %e, "failed to spawn connection thread"),
                    }
                    connections.retain(|h| !h.is_finished());
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL),
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    thread::sleep(POLL);
                }
            }
        }
        for h in connections {
            let _ = h.join();
        }
        tracing::info!("server stopped");
    }
}

fn serve_connection(ctrl: &Controller, stream: TcpStream, shutdown: &Shutdown) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    // Inside an overlong line that was already answered.
    let mut skipping = false;
    loop {
        if shutdown.is_triggered() {
            return Ok(());
        }
        let room = (MAX_FRAME + 1).saturating_sub(buf.len()) as u64;
        match (&mut reader).take(room).read_until(b'\n', &mut buf) {
            Ok(0) => {
                if !buf.is_empty() && !skipping {
                    respond(ctrl, &buf, &mut writer, shutdown)?;
                }
                return Ok(());
            }
            Ok(_) => {
                let complete = buf.last() == Some(&b'\n');
                if skipping {
                    skipping = !complete;
                    buf.clear();
                } else if !complete && buf.len() > MAX_FRAME {
                    tracing::warn!(limit = MAX_FRAME, "request line too long, discarding");
                    writer.write_all(Reply::Error.to_line().as_bytes())?;
                    skipping = true;
                    buf.clear();
                } else if !complete {
                    // EOF inside a frame; answer what arrived and close
                    respond(ctrl, &buf, &mut writer, shutdown)?;
                    return Ok(());
                } else {
                    respond(ctrl, &buf, &mut writer, shutdown)?;
                    buf.clear();
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e),
        }
    }
}

fn respond(
    ctrl: &Controller,
    frame: &[u8],
    writer: &mut TcpStream,
    shutdown: &Shutdown,
) -> io::Result<()> {
    let frame = String::from_utf8_lossy(frame);
    if frame.trim().is_empty() {
        return Ok(());
    }
    tracing::debug!(frame = %frame.trim(), "request");
    match handle_frame(ctrl, &frame) {
        Action::Reply(reply) => writer.write_all(reply.to_line().as_bytes()),
        Action::Shutdown => {
            tracing::info!("KILL received");
            writer.write_all(Reply::Success.to_line().as_bytes())?;
            shutdown.trigger();
            Ok(())
        }
    }
}

fn board(simulate: bool) -> eyre::Result<Arc<dyn Board>> {
    if simulate {
        return Ok(Arc::new(reward_hardware::SimBoard::new()));
    }
    #[cfg(all(feature = "hardware", target_os = "linux"))]
    {
        let board = reward_hardware::RpiBoard::new().wrap_err("open Raspberry Pi GPIO")?;
        Ok(Arc::new(board))
    }
    #[cfg(not(all(feature = "hardware", target_os = "linux")))]
    {
        eyre::bail!("hardware backend not built in: rebuild with --features hardware or pass --simulate")
    }
}

/// Build the controller, start its workers and serve until `KILL` or Ctrl-C.
pub fn serve(cfg: &Config, opts: &ServerOptions) -> eyre::Result<()> {
    let clock: SharedClock = Arc::new(MonotonicClock::new());
    let ctrl = Controller::from_config(
        cfg,
        board(opts.simulate)?,
        clock,
        ControllerOptions {
            reset_positions: opts.reset_positions,
        },
    )?;
    let ctrl = Arc::new(ctrl);
    ctrl.start().wrap_err("start controller")?;

    let listener = TcpListener::bind((opts.host.as_str(), opts.port))
        .wrap_err_with(|| format!("bind {}:{}", opts.host, opts.port))?;
    let server = Server::new(ctrl.clone(), listener)?;
    let pumps: Vec<&str> = ctrl.pump_names().collect();
    let modules: Vec<&str> = ctrl.module_names().collect();
    tracing::info!(
        addr = %server.local_addr()?,
        simulate = opts.simulate,
        ?pumps,
        ?modules,
        "listening"
    );

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || shutdown.trigger()).wrap_err("install Ctrl-C handler")?;

    server.run();
    ctrl.stop();
    Ok(())
}
