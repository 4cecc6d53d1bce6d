//! Fair-Loss Link: best-effort delivery of single messages over TCP.
//!
//! Every message travels on its own connection: the sender connects, writes
//! one frame and closes its side; the receiver reads until end of stream and
//! decodes the whole buffer. Anything that goes wrong on the way (refused
//! connection, timeout, reset, undecodable frame, unknown sender, full
//! outbound queue) loses the message. Nothing is ever delivered that was not
//! sent, but the same message may be delivered more than once if it is sent
//! more than once.
//!
//! Workers:
//! - one accept worker owning the listener, reopening it after errors, and
//!   reading each accepted connection in its own task (at most
//!   `max_connections` at once)
//! - `send_workers` workers draining the bounded queue of fresh sends
//! - `send_workers` workers draining the bounded queue of retransmissions
//!
//! Fresh sends never wait: a full queue drops the frame. Retransmissions
//! wait for room instead, on a queue of their own, so a large backlog never
//! delays a fresh send.

use crate::config::FairLossConfig;
use crate::dispatch::{DeliveryReceiver, Link, Subscriber};
use crate::error::{LinkError, Result};
use crate::message::{FrameError, MAX_FRAME_SIZE, WireFrame};
use crate::tasks::TaskGroup;
use crate::{AddressTable, Message, ProcessId};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, info_span, trace, warn};

/// A frame waiting for a send worker.
struct Outbound {
    destination: ProcessId,
    addr: SocketAddr,
    frame: Vec<u8>,
}

type OutboundQueue = Arc<Mutex<mpsc::Receiver<Outbound>>>;

struct Inner {
    pid: ProcessId,
    addresses: AddressTable,
    config: FairLossConfig,
    local_addr: SocketAddr,
    outbound: mpsc::Sender<Outbound>,
    resend: mpsc::Sender<Outbound>,
    subscriber: Subscriber,
}

/// Handle to a running Fair-Loss Link. Clones share the same link.
#[derive(Clone)]
pub struct FairLossLink {
    inner: Arc<Inner>,
}

impl FairLossLink {
    /// Bind `listen` and start the link.
    ///
    /// A bind failure (port in use, no permission) is returned to the caller
    /// and should be treated as fatal; it is not retried here.
    pub async fn bind(
        pid: ProcessId,
        addresses: AddressTable,
        listen: SocketAddr,
        config: FairLossConfig,
        tasks: &TaskGroup,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|source| LinkError::Bind {
                addr: listen,
                source,
            })?;
        Self::start(pid, addresses, listener, config, tasks)
    }

    /// Start the link on an already-bound listener.
    pub fn start(
        pid: ProcessId,
        addresses: AddressTable,
        listener: TcpListener,
        config: FairLossConfig,
        tasks: &TaskGroup,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
        let (resend_tx, resend_rx) = mpsc::channel(config.outbound_queue.max(1));

        let inner = Arc::new(Inner {
            pid: pid.clone(),
            addresses,
            config,
            local_addr,
            outbound: outbound_tx,
            resend: resend_tx,
            subscriber: Subscriber::default(),
        });

        tasks.spawn(
            info_span!("fair_loss", %pid, worker = "accept"),
            accept_loop(Arc::clone(&inner), listener, tasks.token()),
        );

        spawn_send_pool(&inner, "send", outbound_rx, tasks);
        spawn_send_pool(&inner, "resend", resend_rx, tasks);

        info!("Fair-loss link for {} listening on {}", pid, local_addr);
        Ok(Self { inner })
    }

    /// Our process ID.
    pub fn pid(&self) -> &ProcessId {
        &self.inner.pid
    }

    /// The address table this link sends with.
    pub fn addresses(&self) -> &AddressTable {
        &self.inner.addresses
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Queue a retransmission, waiting until the resend queue has room.
    ///
    /// Returns once the frame is queued, or at once if the destination is
    /// unknown or the link has stopped. Delivery is as best-effort as
    /// [`Link::send`].
    pub async fn resend(&self, destination: &ProcessId, message: Message) {
        let Some(outbound) = self.inner.outbound(destination, message) else {
            return;
        };
        if self.inner.resend.send(outbound).await.is_err() {
            debug!("Link stopped, dropping retransmission to {}", destination);
        }
    }
}

impl Link for FairLossLink {
    fn send(&self, destination: &ProcessId, message: Message) {
        let Some(outbound) = self.inner.outbound(destination, message) else {
            return;
        };

        match self.inner.outbound.try_send(outbound) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(outbound)) => {
                warn!(
                    "Outbound queue full, dropping frame to {}",
                    outbound.destination
                );
            }
            Err(mpsc::error::TrySendError::Closed(outbound)) => {
                debug!("Link stopped, dropping frame to {}", outbound.destination);
            }
        }
    }

    fn deliver_events(&self) -> Result<DeliveryReceiver> {
        self.inner.subscriber.subscribe()
    }
}

impl Inner {
    /// Encode `message` for `destination`, or `None` if we have no address.
    fn outbound(&self, destination: &ProcessId, message: Message) -> Option<Outbound> {
        let Some(addr) = self.addresses.get(destination) else {
            warn!("Unknown destination {}, dropping message", destination);
            return None;
        };

        if self.config.log_traffic {
            info!("fll_send: sending {} to {}", message, destination);
        }

        Some(Outbound {
            destination: destination.clone(),
            addr,
            frame: WireFrame::outbound(&self.pid, message).to_json(),
        })
    }

    /// Read one frame from an accepted connection and deliver it.
    async fn receive(&self, stream: TcpStream, remote: SocketAddr) {
        let (sender, message) = match self.decode(stream, remote).await {
            Ok(delivery) => delivery,
            Err(e) => {
                debug!("Dropped frame from {}: {}", remote, e);
                return;
            }
        };

        if self.config.log_traffic {
            info!("fll_deliver: delivered {} from {}", message, sender);
        }

        if !self.subscriber.publish((sender.clone(), message)) {
            trace!("No subscriber, dropped delivery from {}", sender);
        }
    }

    async fn decode(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> std::result::Result<(ProcessId, Message), FrameError> {
        let data = read_frame(stream, self.config.read_timeout()).await?;
        let (claimed, message) = WireFrame::from_json(&data)?.into_message();
        let sender = self.resolve_sender(claimed, remote)?;
        Ok((sender, message))
    }

    /// Attribute a frame to a process. Frames naming a process we do not know,
    /// or carrying no name and coming from an ambiguous address, are rejected.
    fn resolve_sender(
        &self,
        claimed: Option<ProcessId>,
        remote: SocketAddr,
    ) -> std::result::Result<ProcessId, FrameError> {
        match claimed {
            Some(pid) if pid == self.pid || self.addresses.contains(&pid) => Ok(pid),
            Some(pid) => Err(FrameError::UnknownSender(pid.to_string())),
            None => self
                .addresses
                .resolve_ip(remote.ip())
                .cloned()
                .ok_or_else(|| FrameError::UnknownSender(remote.to_string())),
        }
    }

    /// Open a fresh connection, write one frame, close.
    async fn transmit(&self, outbound: Outbound) {
        let result = async {
            let mut stream =
                tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(outbound.addr))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
            stream.write_all(&outbound.frame).await?;
            stream.shutdown().await?;
            Ok::<_, io::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                if self.config.log_traffic {
                    info!(
                        "fll_send: sent {} bytes to {}",
                        outbound.frame.len(),
                        outbound.destination
                    );
                }
            }
            Err(e) => {
                debug!(
                    "Send to {} ({}) failed: {}",
                    outbound.destination, outbound.addr, e
                );
            }
        }
    }
}

/// Read until the peer closes its side, bounded by [`MAX_FRAME_SIZE`].
async fn read_frame(
    stream: TcpStream,
    read_timeout: Option<Duration>,
) -> std::result::Result<Vec<u8>, FrameError> {
    let mut data = Vec::new();
    let mut reader = stream.take(MAX_FRAME_SIZE as u64 + 1);
    match read_timeout {
        Some(limit) => {
            tokio::time::timeout(limit, reader.read_to_end(&mut data))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))??;
        }
        None => {
            reader.read_to_end(&mut data).await?;
        }
    }

    if data.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(data)
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, cancel: CancellationToken) {
    let local_addr = inner.local_addr;
    let permits = Arc::new(Semaphore::new(inner.config.max_connections.max(1)));
    let mut connections = JoinSet::new();
    let mut current = Some(listener);

    loop {
        let listener = match current.take() {
            Some(listener) => listener,
            None => match rebind(local_addr, inner.config.rebind_delay(), &cancel).await {
                Some(listener) => listener,
                None => break,
            },
        };

        let failure = loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                Some(_) = connections.join_next() => continue,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote)) => spawn_receive(&inner, &permits, &mut connections, stream, remote),
                Err(e) => break Some(e),
            }
        };

        let Some(error) = failure else {
            break;
        };
        warn!("Accept failed on {}: {}, reopening listener", local_addr, error);
        drop(listener);
    }

    connections.shutdown().await;
    debug!("Accept worker stopped");
}

/// Read `stream` in its own task, or drop it if too many are already open.
fn spawn_receive(
    inner: &Arc<Inner>,
    permits: &Arc<Semaphore>,
    connections: &mut JoinSet<()>,
    stream: TcpStream,
    remote: SocketAddr,
) {
    let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
        warn!(
            "Inbound connection limit ({}) reached, dropping connection from {}",
            inner.config.max_connections, remote
        );
        return;
    };

    let inner = Arc::clone(inner);
    connections.spawn(
        async move {
            inner.receive(stream, remote).await;
            drop(permit);
        }
        .instrument(debug_span!("connection", %remote)),
    );
}

/// Reopen the listener, retrying until it binds or the link shuts down.
async fn rebind(
    addr: SocketAddr,
    delay: Duration,
    cancel: &CancellationToken,
) -> Option<TcpListener> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        match TcpListener::bind(addr).await {
            Ok(listener) => {
                info!("Listener reopened on {}", addr);
                return Some(listener);
            }
            Err(e) => warn!("Failed to reopen listener on {}: {}", addr, e),
        }
    }
}

fn spawn_send_pool(
    inner: &Arc<Inner>,
    worker: &'static str,
    queue: mpsc::Receiver<Outbound>,
    tasks: &TaskGroup,
) {
    let queue: OutboundQueue = Arc::new(Mutex::new(queue));
    for n in 0..inner.config.send_workers.max(1) {
        tasks.spawn(
            info_span!("fair_loss", pid = %inner.pid, worker, n),
            send_loop(Arc::clone(inner), Arc::clone(&queue), tasks.token()),
        );
    }
}

async fn send_loop(inner: Arc<Inner>, outbound: OutboundQueue, cancel: CancellationToken) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = async { outbound.lock().await.recv().await } => next,
        };
        let Some(frame) = next else {
            break;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = inner.transmit(frame) => {}
        }
    }
    debug!("Send worker stopped");
}
