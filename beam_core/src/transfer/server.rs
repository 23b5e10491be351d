use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::receiver::{ReceiveContext, ServerConfig, handle_connection};
use crate::error::{Result, TransferError};
use crate::events::{AppEvent, EventBus};

/// TCP listener accepting one frame per connection.
pub struct TransferServer {
    listener: TcpListener,
    ctx: ReceiveContext,
}

impl TransferServer {
    /// Bind the listener. Failing to bind is fatal for the caller.
    pub async fn bind(addr: SocketAddr, config: ServerConfig, events: EventBus) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            TransferError::Io(io::Error::new(
                e.kind(),
                format!("cannot listen on {}: {}", addr, e),
            ))
        })?;
        Ok(Self {
            listener,
            ctx: ReceiveContext::new(config, events),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires. Each connection runs on its
    /// own task; a failed transfer never stops the loop.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        let TransferServer { listener, ctx } = self;
        let ctx = Arc::new(ctx);

        tokio::fs::create_dir_all(&ctx.config.download_dir).await?;
        ctx.events.emit(AppEvent::ServerStatus {
            running: true,
            port: addr.port(),
        });
        tracing::info!(
            "Receiving on {} into {}",
            addr,
            ctx.config.download_dir.display()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    tracing::debug!("Connection from {}", peer);
                    let ctx = ctx.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, &ctx, &cancel).await {
                            tracing::warn!("Transfer from {} failed: {}", peer, e);
                        }
                    });
                }
            }
        }

        ctx.events.emit(AppEvent::ServerStatus {
            running: false,
            port: addr.port(),
        });
        tracing::info!("Receiver on {} stopped", addr);
        Ok(())
    }
}

/// Bind on every interface at `port` and serve until cancelled.
pub async fn start(
    config: ServerConfig,
    port: u16,
    events: EventBus,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    TransferServer::bind(addr, config, events)
        .await?
        .run(cancel)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_events_bracket_run() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new();
        let mut rx = events.subscribe();

        let server = TransferServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            ServerConfig::new(dir.path()),
            events,
        )
        .await
        .unwrap();
        let port = server.local_addr().unwrap().port();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(cancel.clone()));

        assert_eq!(
            rx.recv().await.unwrap(),
            AppEvent::ServerStatus {
                running: true,
                port
            }
        );
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            AppEvent::ServerStatus {
                running: false,
                port
            }
        );
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let first = TransferServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            ServerConfig::new(dir.path()),
            EventBus::new(),
        )
        .await
        .unwrap();
        let taken = first.local_addr().unwrap();

        let second =
            TransferServer::bind(taken, ServerConfig::new(dir.path()), EventBus::new()).await;
        assert!(matches!(second, Err(TransferError::Io(_))));
    }
}
