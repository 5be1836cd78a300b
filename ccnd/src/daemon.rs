//! Daemon assembly: sockets, forwarder, event loop, and shutdown.

use log::{error, info};
use tokio::signal::unix::{signal, SignalKind};

use ccn_transport::{udp, unix};

use crate::config::Config;
use crate::forwarder::{Forwarder, ForwarderOptions};
use crate::io::EventLoop;

pub struct Daemon {
    config: Config,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run to completion and return the process exit code: 0 for a
    /// normal exit, the signal number on a fatal signal.
    pub async fn run(self) -> anyhow::Result<i32> {
        ccn_core::init();
        ccn_transport::init();

        let port = unix::local_port_or(&self.config.network.port);
        let socket_path = match &self.config.network.socket_path {
            Some(path) => path.into(),
            None => unix::socket_path(&port),
        };
        let listener = unix::bind_listener(&socket_path).await?;

        let dgram_port: u16 = port
            .parse()
            .map_err(|_| anyhow::anyhow!("bad port {port:?}"))?;
        let udp_sockets = udp::bind_datagram_sockets(dgram_port).await?;

        let options = ForwarderOptions {
            short_term_blocking: self.config.forwarder.short_term_blocking,
            max_faces: self.config.forwarder.max_faces,
            datagram_idle_sweeps: self.config.forwarder.datagram_idle_sweeps,
        };
        let forwarder = Forwarder::new(rand::random(), options);
        let event_loop = EventLoop::new(forwarder, listener, socket_path.clone(), udp_sockets);

        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut hup = signal(SignalKind::hangup())?;

        info!("ccnd running");
        let code = tokio::select! {
            res = event_loop.run() => match res {
                Ok(()) => 0,
                Err(e) => {
                    error!("event loop failed: {e}");
                    1
                }
            },
            _ = term.recv() => SignalKind::terminate().as_raw_value(),
            _ = int.recv() => SignalKind::interrupt().as_raw_value(),
            _ = hup.recv() => SignalKind::hangup().as_raw_value(),
        };

        unix::remove_socket(&socket_path);
        info!("ccnd exiting with code {code}");
        Ok(code)
    }
}
