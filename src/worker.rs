//! Worker runtime: the child side of the handshake.
//!
//! A worker adopts the transport named in its punch payload, exchanges
//! hellos with its parent and then serves as an ordinary [`Node`] until the
//! parent channel closes or the shutdown handle fires.

use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::Node;
use crate::dispatch::FactoryRegistry;
use crate::ipc::message::Envelope;
use crate::ipc::Channel;
use crate::launcher::transport::{connect_child, shutdown_signal};
use crate::launcher::{InProcessHost, PunchPayload};
use crate::types::{Config, Error, Result};

/// Run a worker process from its punch payload.
pub async fn run_worker(config: Config, punch: PunchPayload, factories: FactoryRegistry) -> Result<()> {
    tracing::debug!(
        "Worker {} connecting (kind={}, integrity={}, parent os_pid={})",
        punch.process_id,
        punch.kind,
        punch.integrity,
        punch.parent_pid
    );
    let (reader, writer) = connect_child(&punch).await?;
    let shutdown = shutdown_signal(&punch.shutdown_handle)?;
    serve_child(config, punch, reader, writer, factories, shutdown).await
}

/// Complete the handshake over an already connected transport and serve.
pub async fn serve_child<R, W, S>(
    mut config: Config,
    punch: PunchPayload,
    reader: R,
    writer: W,
    factories: FactoryRegistry,
    shutdown: S,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = ()> + Send,
{
    // Addresses of the whole tree share the root's host authority.
    config.node.host_authority = punch.host.clone();
    let node = Node::new(punch.process_id.clone(), config.clone(), factories);

    let (channel, mut inbound) =
        Channel::open(reader, writer, &config.channel, config.node.wire_format);
    channel.send(&Envelope::Hello(node.hello().clone())).await?;
    let parent = match tokio::time::timeout(config.launcher.handshake_timeout, inbound.recv()).await {
        Ok(Some(Envelope::Hello(hello))) => hello,
        Ok(Some(other)) => {
            return Err(Error::handshake(format!(
                "expected hello from parent, got {}",
                other.kind()
            )))
        }
        Ok(None) => return Err(Error::handshake("parent closed the channel during handshake")),
        Err(_) => return Err(Error::handshake("parent sent no hello")),
    };
    node.attach_parent(&parent, channel, inbound)?;
    tracing::info!("Worker {} serving", node.address());

    tokio::select! {
        _ = node.closed() => {}
        _ = shutdown => {
            tracing::info!("Worker {} asked to shut down", node.address());
        }
    }
    node.shutdown().await;
    Ok(())
}

/// Hosts in-process children on tasks of the current runtime.
#[derive(Debug, Clone)]
pub struct InProcessWorkerHost {
    config: Config,
    factories: FactoryRegistry,
}

impl InProcessWorkerHost {
    pub fn new(config: Config, factories: FactoryRegistry) -> Self {
        Self { config, factories }
    }
}

impl InProcessHost for InProcessWorkerHost {
    fn start(
        &self,
        punch: PunchPayload,
        stream: DuplexStream,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let config = self.config.clone();
        let factories = self.factories.clone();
        tokio::spawn(async move {
            let process_id = punch.process_id.clone();
            let (reader, writer) = tokio::io::split(stream);
            let stopped = async move { shutdown.cancelled().await };
            if let Err(e) = serve_child(config, punch, reader, writer, factories, stopped).await {
                tracing::error!("In-process worker {} failed: {}", process_id, e);
            }
        })
    }
}
