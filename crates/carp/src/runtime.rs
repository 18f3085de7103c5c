//! Async driver around the engine.
//!
//! The engine lives behind one `tokio::sync::Mutex`. Timer expirations and
//! received packets arrive over channels and are applied one at a time under
//! that lock, as are administrative calls made through [`CarpRuntime::engine`].

use crate::engine::CarpEngine;
use crate::socket::CarpSocket;
use crate::timer::{TimerHandle, TokioScheduler};
use crate::transport::Transport;
use crate::types::{CarpOptions, Family};
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

const INBOUND_QUEUE: usize = 1024;

pub type SharedEngine<T> = Arc<Mutex<CarpEngine<TokioScheduler, T>>>;

/// A received packet on its way to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Full IPv4 datagram
    V4 { ifname: String, packet: Vec<u8> },
    /// IPv6 CARP payload with the hop limit it arrived with
    V6 {
        ifname: String,
        hop_limit: u8,
        payload: Vec<u8>,
    },
}

pub struct CarpRuntime<T: Transport> {
    engine: SharedEngine<T>,
    timers: mpsc::UnboundedReceiver<TimerHandle>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound: mpsc::Receiver<Inbound>,
}

impl<T: Transport + 'static> CarpRuntime<T> {
    /// Build an engine wired to a tokio scheduler.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(options: CarpOptions, transport: T) -> Self {
        let (timer_tx, timers) = mpsc::unbounded_channel();
        let engine = CarpEngine::new(options, TokioScheduler::new(timer_tx), transport);
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        Self {
            engine: Arc::new(Mutex::new(engine)),
            timers,
            inbound_tx,
            inbound,
        }
    }

    pub fn engine(&self) -> SharedEngine<T> {
        self.engine.clone()
    }

    /// Sender for received packets
    pub fn inbound(&self) -> mpsc::Sender<Inbound> {
        self.inbound_tx.clone()
    }

    /// Process events until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!("CARP runtime started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("CARP runtime stopping");
                    break;
                }
                Some(handle) = self.timers.recv() => {
                    self.engine.lock().await.on_expire(handle);
                }
                Some(msg) = self.inbound.recv() => {
                    let mut engine = self.engine.lock().await;
                    match msg {
                        Inbound::V4 { ifname, packet } => engine.input_v4(&ifname, &packet),
                        Inbound::V6 { ifname, hop_limit, payload } => {
                            // IPv6 advertisements belong to the carp interface, not the link
                            let target = engine
                                .coordinator_on(&ifname)
                                .map(str::to_string)
                                .unwrap_or(ifname);
                            engine.input_v6(&target, hop_limit, &payload);
                        }
                    }
                }
            }
        }
    }
}

/// Read advertisements from a socket and forward them until the runtime
/// goes away.
pub async fn pump(socket: CarpSocket, tx: mpsc::Sender<Inbound>) -> io::Result<()> {
    let ifname = socket.interface().to_string();
    let family = socket.family();
    let fd = AsyncFd::new(socket)?;
    debug!(iface = %ifname, %family, "receiving advertisements");

    loop {
        let mut guard = fd.readable().await?;
        let received = guard.try_io(|inner| match family {
            Family::V4 => inner.get_ref().recv_v4().map(|packet| Inbound::V4 {
                ifname: ifname.clone(),
                packet,
            }),
            Family::V6 => inner
                .get_ref()
                .recv_v6()
                .map(|(hop_limit, payload)| Inbound::V6 {
                    ifname: ifname.clone(),
                    hop_limit,
                    payload,
                }),
        });

        let msg = match received {
            Ok(Ok(msg)) => msg,
            Ok(Err(err)) => {
                warn!(iface = %ifname, error = %err, "receive failed");
                continue;
            }
            Err(_would_block) => continue,
        };
        if tx.send(msg).await.is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{CarpRequest, Privilege};
    use crate::engine::ParentInterface;
    use crate::transport::RecordingTransport;
    use crate::types::VhostState;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_runtime_promotes_and_processes_input() {
        let runtime = CarpRuntime::new(CarpOptions::default(), RecordingTransport::new());
        let engine = runtime.engine();
        let inbound = runtime.inbound();

        {
            let mut engine = engine.lock().await;
            engine
                .register_interface(ParentInterface::ethernet("eth0", 2, [2, 0, 0, 0, 0, 1]))
                .unwrap();
            engine.create_coordinator("carp0").unwrap();
            // zero base interval: master-down after 3/256 s
            let req = CarpRequest::new().carpdev("eth0").vhid(1, 0).advbase(0).passphrase("k");
            engine.set_request("carp0", &req, Privilege::Privileged).unwrap();
            engine.add_address("carp0", "192.0.2.1".parse().unwrap()).unwrap();
            assert_eq!(engine.state_of("carp0", 1), Some(VhostState::Backup));
        }

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(runtime.run(async {
            let _ = stop_rx.await;
        }));

        inbound
            .send(Inbound::V4 {
                ifname: "carp0".to_string(),
                packet: vec![0x45, 0, 0],
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        {
            let engine = engine.lock().await;
            assert_eq!(engine.state_of("carp0", 1), Some(VhostState::Master));
            let snap = engine.stats().snapshot();
            assert!(snap.opackets >= 1);
            assert_eq!(snap.hdrops, 1);
        }

        stop_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
