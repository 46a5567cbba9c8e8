use std::{future::Future, net::SocketAddr};

use tokio::net::TcpListener;

use super::{create_router, ServerState};
use crate::{host::NodeHost, NexusResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The management API server of a node.
pub struct NodeServer {
    host: NodeHost,
    addr: SocketAddr,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NodeServer {
    /// Creates a server for `host` listening on `addr`.
    pub fn new(host: NodeHost, addr: SocketAddr) -> Self {
        Self { host, addr }
    }

    /// Serves the API until `shutdown` resolves, then stops every sandbox.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> NexusResult<()> {
        let listener = TcpListener::bind(self.addr).await?;
        let router = create_router(ServerState::new(self.host.clone()));

        tracing::info!(addr = %listener.local_addr()?, "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        self.host.shutdown().await;
        Ok(())
    }
}
