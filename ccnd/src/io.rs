//! The event loop.
//!
//! Socket tasks do nothing but move bytes: readers forward received
//! data into one channel, writers drain per-face channels. Every
//! mutation of forwarder state happens here, in a single task, between
//! waits bounded by the scheduler's next deadline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UdpSocket, UnixListener};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::face::flags;
use crate::forwarder::Forwarder;

const READ_CHUNK: usize = 8192;

#[derive(Debug)]
enum IoEvent {
    StreamBytes { face_id: u32, data: Vec<u8> },
    StreamClosed { face_id: u32 },
    Datagram { from: std::net::SocketAddr, data: Vec<u8> },
}

pub struct EventLoop {
    forwarder: Forwarder,
    listener: UnixListener,
    socket_path: PathBuf,
    udp_sockets: Vec<Arc<UdpSocket>>,
    tx: mpsc::UnboundedSender<IoEvent>,
    rx: mpsc::UnboundedReceiver<IoEvent>,
    writers: HashMap<u32, mpsc::UnboundedSender<Vec<u8>>>,
    epoch: Instant,
}

impl EventLoop {
    pub fn new(
        forwarder: Forwarder,
        listener: UnixListener,
        socket_path: PathBuf,
        udp_sockets: Vec<UdpSocket>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            forwarder,
            listener,
            socket_path,
            udp_sockets: udp_sockets.into_iter().map(Arc::new).collect(),
            tx,
            rx,
            writers: HashMap::new(),
            epoch: Instant::now(),
        }
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Run until the listener path disappears (a successor asked us to
    /// leave) or the channel machinery fails.
    pub async fn run(mut self) -> anyhow::Result<()> {
        for sock in &self.udp_sockets {
            tokio::spawn(datagram_reader(sock.clone(), self.tx.clone()));
        }
        self.forwarder.start(self.now());
        let mut path_check = tokio::time::interval(Duration::from_secs(15));
        path_check.reset();

        loop {
            self.flush_output();
            let sleep_for = self
                .forwarder
                .next_deadline()
                .map(|due| due.saturating_sub(self.now()))
                .unwrap_or(1_000_000);

            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => self.accept_stream(stream),
                    Err(e) => warn!("accept failed: {e}"),
                },
                event = self.rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => anyhow::bail!("event channel closed"),
                },
                _ = tokio::time::sleep(Duration::from_micros(sleep_for)) => {},
                _ = path_check.tick() => {
                    if !self.socket_path.exists() {
                        info!("listener socket removed; exiting");
                        return Ok(());
                    }
                }
            }
            let now = self.now();
            self.forwarder.run_due(now);
        }
    }

    fn accept_stream(&mut self, stream: tokio::net::UnixStream) {
        let now = self.now();
        match self.forwarder.create_face(flags::LOCAL, None, now) {
            Ok(face_id) => {
                let (read, write) = stream.into_split();
                let (wtx, wrx) = mpsc::unbounded_channel();
                self.writers.insert(face_id, wtx);
                tokio::spawn(stream_reader(face_id, read, self.tx.clone()));
                tokio::spawn(stream_writer(face_id, write, wrx, self.tx.clone()));
            }
            Err(e) => warn!("refusing new connection: {e}"),
        }
    }

    fn handle_event(&mut self, event: IoEvent) {
        let now = self.now();
        match event {
            IoEvent::StreamBytes { face_id, data } => {
                if self.forwarder.handle_input(face_id, &data, now).is_err() {
                    self.teardown_stream(face_id);
                }
            }
            IoEvent::StreamClosed { face_id } => self.teardown_stream(face_id),
            IoEvent::Datagram { from, data } => match self.forwarder.datagram_face(from, now) {
                Ok(face_id) => {
                    // Datagram framing errors are absorbed per-face.
                    let _ = self.forwarder.handle_input(face_id, &data, now);
                }
                Err(e) => warn!("no face for datagram peer {from}: {e}"),
            },
        }
    }

    fn teardown_stream(&mut self, face_id: u32) {
        self.writers.remove(&face_id);
        self.forwarder.destroy_face(face_id);
    }

    /// Hand queued output to the writer tasks and datagram sockets.
    /// Stream writes that fall behind sit in the writer's channel;
    /// datagram sends that fail are dropped.
    fn flush_output(&mut self) {
        let mut dead = Vec::new();
        for face_id in self.forwarder.faces_with_output() {
            let frames = self.forwarder.take_sendq(face_id);
            let addr = self
                .forwarder
                .faces
                .lookup(face_id)
                .and_then(|f| f.addr);
            match addr {
                Some(peer) => {
                    for frame in frames {
                        if let Some(sock) = self.socket_for(&peer) {
                            if let Err(e) = sock.try_send_to(&frame, peer) {
                                debug!("datagram send to {peer} dropped: {e}");
                            }
                        }
                    }
                }
                None => {
                    let writer = self.writers.get(&face_id);
                    match writer {
                        Some(writer) => {
                            for frame in frames {
                                if writer.send(frame).is_err() {
                                    dead.push(face_id);
                                    break;
                                }
                            }
                        }
                        None => dead.push(face_id),
                    }
                }
            }
        }
        for face_id in dead {
            self.teardown_stream(face_id);
        }
    }

    fn socket_for(&self, peer: &std::net::SocketAddr) -> Option<&Arc<UdpSocket>> {
        self.udp_sockets
            .iter()
            .find(|s| match s.local_addr() {
                Ok(local) => local.is_ipv4() == peer.is_ipv4(),
                Err(_) => false,
            })
    }
}

async fn stream_reader(face_id: u32, mut read: OwnedReadHalf, tx: mpsc::UnboundedSender<IoEvent>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match read.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = tx.send(IoEvent::StreamClosed { face_id });
                break;
            }
            Ok(n) => {
                if tx
                    .send(IoEvent::StreamBytes {
                        face_id,
                        data: buf[..n].to_vec(),
                    })
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

async fn stream_writer(
    face_id: u32,
    mut write: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    tx: mpsc::UnboundedSender<IoEvent>,
) {
    while let Some(frame) = frames.recv().await {
        if write.write_all(&frame).await.is_err() {
            let _ = tx.send(IoEvent::StreamClosed { face_id });
            break;
        }
    }
}

async fn datagram_reader(sock: Arc<UdpSocket>, tx: mpsc::UnboundedSender<IoEvent>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match sock.recv_from(&mut buf).await {
            Ok((n, from)) => {
                if tx
                    .send(IoEvent::Datagram {
                        from,
                        data: buf[..n].to_vec(),
                    })
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                debug!("datagram receive error: {e}");
            }
        }
    }
}
