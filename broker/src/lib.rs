// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

mod builtin;
pub mod conf;
pub mod events;
pub mod handle;
pub mod modules;
pub mod overlay;
pub mod router;
pub mod services;

use std::sync::Arc;

use anyhow::anyhow;
use tracing::{error, info};

use crate::conf::Params;
use crate::handle::Handle;
use crate::modules::ModuleLoader;
use crate::overlay::Overlay;
use crate::router::Router;

/// One per-node broker. Construction wires the collaborators together;
/// `run` drives the router until shutdown.
pub struct Broker<O: Overlay> {
    conf: Params,
    overlay: Arc<O>,
    loader: Box<dyn ModuleLoader>,
    handle: Arc<Handle>,
    subscriptions: Vec<String>,
}

impl<O: Overlay> Broker<O> {
    pub fn new(conf: Params, overlay: O, loader: Box<dyn ModuleLoader>) -> Self {
        Self {
            conf,
            overlay: Arc::new(overlay),
            loader,
            handle: Arc::new(Handle::new()),
            subscriptions: Vec::new(),
        }
    }

    /// The broker's in-process handle: rpc, event stream, online/shutdown
    /// control. Clones stay valid for the broker's lifetime.
    pub fn handle(&self) -> Arc<Handle> {
        self.handle.clone()
    }

    /// Adds a broker-resident topic subscription before startup.
    pub fn subscribe(&mut self, topic: impl Into<String>) {
        self.subscriptions.push(topic.into());
    }

    /// Runs the broker to completion: registers built-in services, loads
    /// preconfigured modules, then routes until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        let Broker {
            conf,
            overlay,
            loader,
            handle,
            subscriptions,
        } = self;
        info!("starting broker with conf: {}", conf);

        let mut router = Router::new(
            conf.clone(),
            overlay,
            loader,
            handle.clone(),
            subscriptions,
        )
        .map_err(|errno| anyhow!("service registration failed: {errno}"))?;

        for name in &conf.preload {
            router
                .load_module_byname(name, vec![])
                .map_err(|errno| anyhow!("preload {name}: {errno}"))?;
        }

        if conf.start_online {
            router.set_online(true);
        }

        #[cfg(unix)]
        spawn_signal_watchers(handle.clone());

        router.run().await
    }
}

/// Fatal-ish signals feed the broker a kill event; the router never sees
/// them directly.
#[cfg(unix)]
fn spawn_signal_watchers(handle: Arc<Handle>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let watch = || -> std::io::Result<_> {
            Ok((
                signal(SignalKind::hangup())?,
                signal(SignalKind::interrupt())?,
                signal(SignalKind::quit())?,
                signal(SignalKind::terminate())?,
                signal(SignalKind::alarm())?,
            ))
        };
        let (mut hup, mut int, mut quit, mut term, mut alrm) = match watch() {
            Ok(streams) => streams,
            Err(e) => {
                error!("signal watcher setup: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = hup.recv() => {}
            _ = int.recv() => {}
            _ = quit.recv() => {}
            _ = term.recv() => {}
            _ = alrm.recv() => {}
        }
        info!("signal received, shutting down");
        handle.shutdown();
    });
}
