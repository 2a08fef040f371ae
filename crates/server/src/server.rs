// Copyright 2024 tison <wander4096@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Result;
use error_stack::ResultExt;
use laser_protos::config::ServerConfig;
use laser_replication::FsSnapshotTransport;
use mea::latch::Latch;
use mea::waitgroup::WaitGroup;
use poem::listener::Acceptor;
use poem::listener::Listener;

use crate::database_manager::DatabaseManager;
use crate::error::ServerError;
use crate::http::make_router;
use crate::registry::LocalRegistry;
use crate::registry::ShardRegistry;
use crate::replicator_manager::HttpReplicatorClient;

type ServerFuture<T> = laser_runtime::JoinHandle<Result<T, ServerError>>;

#[derive(Debug)]
pub struct ServerState {
    advertise_addr: SocketAddr,
    server_fut: ServerFuture<()>,
    shutdown: Arc<Latch>,
    manager: Arc<DatabaseManager>,
}

impl ServerState {
    pub fn advertise_addr(&self) -> SocketAddr {
        self.advertise_addr
    }

    pub fn manager(&self) -> &Arc<DatabaseManager> {
        &self.manager
    }

    pub fn shutdown_handle(&self) -> impl Fn() {
        let shutdown = self.shutdown.clone();
        move || shutdown.count_down()
    }

    pub fn shutdown(&self) {
        self.shutdown_handle()();
    }

    pub async fn await_shutdown(self) {
        self.shutdown.wait().await;
        self.manager.shutdown();

        match self.server_fut.await {
            Ok(Ok(())) => log::info!("Laser server stopped."),
            Ok(Err(err)) => log::error!(err:?; "Laser server failed."),
            Err(err) => log::error!(err:?; "Laser server task canceled."),
        }
    }
}

pub async fn start(config: ServerConfig) -> Result<ServerState, ServerError> {
    start_with_registry(config, Arc::new(LocalRegistry::new())).await
}

/// Starts one node against an externally provided registry, which is how
/// multiple in-process nodes discover each other in tests.
pub async fn start_with_registry(
    config: ServerConfig,
    registry: Arc<dyn ShardRegistry>,
) -> Result<ServerState, ServerError> {
    let make_error = || ServerError("failed to start server".to_string());
    let shutdown = Arc::new(Latch::new(1));
    let wg = WaitGroup::new();

    let client = HttpReplicatorClient::new(registry.clone(), &config.replication)
        .map_err(|err| ServerError(format!("failed to build replicator client: {err}")))?;
    let transport = Arc::new(FsSnapshotTransport);

    let addr = config.addr.clone();
    let acceptor = poem::listener::TcpListener::bind(&addr)
        .into_acceptor()
        .await
        .change_context_lazy(|| ServerError(format!("failed to listen on {addr}")))?;
    let advertise_addr = acceptor.local_addr()[0]
        .as_socket_addr()
        .cloned()
        .ok_or_else(|| ServerError("failed to get local address".to_string()))?;

    let manager = DatabaseManager::new(config, registry, Arc::new(client), transport);
    manager.set_advertise_addr(advertise_addr.to_string());
    manager.start();

    let server_fut = {
        let shutdown_clone = shutdown.clone();
        let wg_clone = wg.clone();
        let route = make_router(manager.clone());
        let signal = async move {
            log::info!("Laser node has started on [{advertise_addr}]");
            drop(wg_clone);

            shutdown_clone.wait().await;
            log::info!("Laser node is closing");
        };
        laser_runtime::server_runtime().spawn(async move {
            poem::Server::new_with_acceptor(acceptor)
                .run_with_graceful_shutdown(route, signal, Some(Duration::from_secs(10)))
                .await
                .change_context_lazy(make_error)
        })
    };

    wg.await;
    Ok(ServerState {
        advertise_addr,
        server_fut,
        shutdown,
        manager,
    })
}
