//! [`ReverseServer`] – accept loop for connections opened by the uploaded
//! program. Each connection gets its own [`CommandChannel`] task.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use urlink_types::UrError;

use crate::command_channel::{ChannelContext, CommandChannel};

pub struct ReverseServer {
    listener: TcpListener,
    ctx: ChannelContext,
}

impl ReverseServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`UrError::Io`] if `addr` cannot be bound.
    pub async fn bind(addr: SocketAddr, ctx: ChannelContext) -> Result<Self, UrError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| UrError::Io(format!("reverse server bind error on {addr}: {e}")))?;
        info!(addr = %listener.local_addr()?, "Reverse server listening");
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, UrError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` turns `true`, then abort every
    /// handler still running.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = self.ctx.clone();
                        handlers.spawn(async move {
                            let _ = CommandChannel::serve(stream, ctx).await;
                            debug!(%peer, "reverse handler finished");
                        });
                    }
                    Err(e) => error!(error = %e, "reverse accept error"),
                },
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }
        handlers.shutdown().await;
        info!("Reverse server stopped");
    }
}

/// Resolves once `signal` is `true` or its sender is gone.
pub(crate) async fn stopped(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|set| *set).await;
}
