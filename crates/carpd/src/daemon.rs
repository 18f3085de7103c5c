//! Composition of engine, sockets and metrics.

use crate::config::{Config, CoordinatorSettings, parse_mac};
use crate::metrics_server::MetricsServer;
use carp::runtime::pump;
use carp::{
    CarpEngine, CarpError, CarpRequest, CarpRuntime, MacAddr, ParentInterface, Privilege, Scheduler, SocketTransport,
    Transport,
};
use common::{Error, Result};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct Daemon {
    config: Config,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Open sockets, configure the engine and run until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let config = self.config;
        let mut transport = SocketTransport::new();
        let mut parents = Vec::new();
        let mut receivers = Vec::new();

        for iface in &config.interfaces {
            let (index, sockets) = transport
                .open(&iface.name)
                .map_err(|e| Error::transport(format!("opening CARP sockets on {}: {e}", iface.name)))?;
            let lladdr = match iface.lladdr.as_deref().and_then(parse_mac) {
                Some(mac) => mac,
                None => read_lladdr(&iface.name)?,
            };
            let mut parent = ParentInterface::ethernet(&iface.name, index, lladdr);
            parent.simplex = iface.simplex;
            parents.push(parent);
            receivers.extend(sockets);
        }

        let runtime = CarpRuntime::new(config.options, transport);
        let engine = runtime.engine();
        apply_config(&mut *engine.lock().await, &config, parents)?;

        let inbound = runtime.inbound();
        for socket in receivers {
            let tx = inbound.clone();
            let ifname = socket.interface().to_string();
            tokio::spawn(async move {
                if let Err(e) = pump(socket, tx).await {
                    error!(iface = %ifname, error = %e, "receive loop failed");
                }
            });
        }

        if config.metrics.enabled {
            let mut registry = Registry::default();
            engine.lock().await.stats().register(&mut registry);
            let server = MetricsServer::new(Arc::new(registry), config.metrics.listen.clone());
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!(error = %e, "metrics server failed");
                }
            });
        }

        runtime.run(shutdown_signal()).await;

        // hand mastership over before the sockets close
        let mut engine = engine.lock().await;
        for sc in &config.coordinators {
            if let Err(e) = engine.set_down(&sc.name) {
                warn!(iface = %sc.name, error = %e, "bow-out failed");
            }
        }
        Ok(())
    }
}

/// Register parents and build every configured coordinator.
pub fn apply_config<S: Scheduler, T: Transport>(
    engine: &mut CarpEngine<S, T>,
    config: &Config,
    parents: Vec<ParentInterface>,
) -> Result<()> {
    for parent in parents {
        let name = parent.name.clone();
        engine
            .register_interface(parent)
            .map_err(|e| Error::carp(format!("registering {name}: {e}")))?;
    }

    for sc in &config.coordinators {
        configure_coordinator(engine, sc).map_err(|e| Error::carp(format!("configuring {}: {e}", sc.name)))?;
        info!(
            iface = %sc.name,
            carpdev = %sc.carpdev,
            vhids = sc.vhids.len(),
            addresses = sc.addresses.len(),
            "coordinator configured"
        );
    }
    Ok(())
}

fn configure_coordinator<S: Scheduler, T: Transport>(
    engine: &mut CarpEngine<S, T>,
    sc: &CoordinatorSettings,
) -> std::result::Result<(), CarpError> {
    engine.create_coordinator(&sc.name)?;
    for group in &sc.groups {
        engine.join_group(&sc.name, group)?;
    }

    let mut req = CarpRequest::new()
        .carpdev(&sc.carpdev)
        .vhids(&sc.vhids)
        .advbase(sc.advbase);
    if let Some(passphrase) = &sc.passphrase {
        req = req.passphrase(passphrase);
    }
    if let Some(peer) = sc.peer {
        req = req.peer(peer);
    }
    if let Some(balancing) = sc.balancing {
        req = req.balancing(balancing);
    }
    engine.set_request(&sc.name, &req, Privilege::Privileged)?;

    for addr in &sc.addresses {
        engine.add_address(&sc.name, *addr)?;
    }
    Ok(())
}

fn read_lladdr(ifname: &str) -> Result<MacAddr> {
    let text = std::fs::read_to_string(format!("/sys/class/net/{ifname}/address"))?;
    parse_mac(&text).ok_or_else(|| Error::config(format!("{ifname} has no Ethernet address, set lladdr")))
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable");
            let _ = ctrl_c.await;
        }
    }
    info!("shutdown requested");
}
