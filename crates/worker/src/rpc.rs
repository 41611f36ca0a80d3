// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker RPC listener.
//!
//! Serves framed-JSON requests from the control plane over persistent
//! TCP connections. Each connection handles requests sequentially; the
//! control plane's pool keeps one connection per worker and pings it
//! as keepalive.

use std::sync::Arc;
use std::time::Duration;

use sbx_core::{Clock, Fault, SandboxId, SessionStatus};
use sbx_runtime::{RuntimeAdapter, SandboxSpec};
use sbx_store::SessionStore;
use sbx_wire::{read_request, write_response, ProtocolError, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::router::Router;

/// Idle window before a silent connection is dropped. The pool pings
/// every 10 s, so a healthy connection never gets closed.
const CONNECTION_IDLE: Duration = Duration::from_secs(120);

pub(crate) struct RpcCtx<C: Clock> {
    pub config: WorkerConfig,
    pub router: Router<C>,
    pub store: Arc<dyn SessionStore>,
    pub runtime: Arc<dyn RuntimeAdapter>,
}

/// Accept loop for worker RPC.
pub struct RpcListener<C: Clock> {
    listener: TcpListener,
    ctx: Arc<RpcCtx<C>>,
    cancel: CancellationToken,
}

impl<C: Clock> RpcListener<C> {
    pub(crate) fn new(
        listener: TcpListener,
        ctx: Arc<RpcCtx<C>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { listener, ctx, cancel }
    }

    /// Run until cancelled, spawning a task per connection.
    pub async fn run(self) {
        info!(addr = %self.ctx.config.rpc_addr, "worker RPC listening");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.listener.accept() => match result {
                    Ok((stream, addr)) => {
                        debug!(%addr, "RPC connection");
                        let ctx = Arc::clone(&self.ctx);
                        tokio::spawn(async move {
                            let (reader, writer) = stream.into_split();
                            handle_connection(reader, writer, &ctx).await;
                        });
                    }
                    Err(e) => error!("RPC accept error: {}", e),
                },
            }
        }
    }
}

async fn handle_connection<C, R, W>(mut reader: R, mut writer: W, ctx: &RpcCtx<C>)
where
    C: Clock,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let request = match read_request(&mut reader, CONNECTION_IDLE).await {
            Ok(request) => request,
            Err(ProtocolError::ConnectionClosed) => break,
            Err(ProtocolError::Timeout) => {
                debug!("RPC connection idle, closing");
                break;
            }
            Err(e) => {
                warn!(error = %e, "RPC read error");
                break;
            }
        };
        let response = dispatch(ctx, request).await;
        if let Err(e) = write_response(&mut writer, &response).await {
            warn!(error = %e, "RPC write error");
            break;
        }
    }
}

async fn dispatch<C: Clock>(ctx: &RpcCtx<C>, request: Request) -> Response {
    match request {
        Request::Hello { .. } => Response::Hello {
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        Request::Ping => Response::Pong,
        Request::Heartbeat { .. } => Response::Error {
            fault: Fault::invalid("heartbeats go to the control plane ingest"),
        },
        Request::CreateSandbox { sandbox_id, config } => {
            match create_sandbox(ctx, sandbox_id, config).await {
                Ok(()) => Response::SandboxCreated {
                    sandbox_id,
                    status: SessionStatus::Running,
                },
                Err(fault) => Response::Error { fault },
            }
        }
        Request::DestroySandbox { sandbox_id } => {
            match destroy_sandbox(ctx, sandbox_id).await {
                Ok(()) => Response::Ok,
                Err(fault) => Response::Error { fault },
            }
        }
        Request::HibernateSandbox { sandbox_id } => {
            match ctx.router.hibernate(&sandbox_id).await {
                Ok(result) => Response::Hibernated {
                    checkpoint_key: result.checkpoint_key,
                    size_bytes: result.size_bytes,
                },
                Err(fault) => Response::Error { fault },
            }
        }
        Request::WakeSandbox { sandbox_id, checkpoint, timeout_secs } => {
            let timeout = Duration::from_secs(timeout_secs.max(90));
            match ctx.router.wake(&sandbox_id, &checkpoint, timeout).await {
                Ok(()) => Response::Woken { status: SessionStatus::Running },
                Err(fault) => Response::Error { fault },
            }
        }
        Request::IsTapAvailable { sandbox_id } => Response::TapAvailability {
            available: ctx.router.taps().is_available(&sandbox_id),
        },
    }
}

async fn create_sandbox<C: Clock>(
    ctx: &RpcCtx<C>,
    sandbox_id: SandboxId,
    config: sbx_core::SandboxConfig,
) -> Result<(), Fault> {
    if ctx.router.slot_count() as u32 >= ctx.config.capacity {
        return Err(Fault::no_capacity(format!(
            "worker {} is at capacity",
            ctx.config.worker_id
        )));
    }
    if ctx.router.taps().claim(&sandbox_id).is_none() {
        return Err(Fault::no_capacity(format!(
            "TAP slot for {sandbox_id} is occupied"
        )));
    }

    let spec = SandboxSpec {
        sandbox_id,
        image: ctx.config.image_for(&config.template),
        limits: config.limits,
        env: config.env.clone(),
    };

    let boot = async {
        ctx.runtime.create(&spec).await.map_err(Fault::from)?;
        ctx.runtime.start(&sandbox_id).await.map_err(Fault::from)?;
        Ok::<(), Fault>(())
    }
    .await;

    if let Err(fault) = boot {
        ctx.router.taps().release(&sandbox_id);
        let _ = ctx.runtime.remove(&sandbox_id).await;
        return Err(fault);
    }

    ctx.router.register_slot(
        sandbox_id,
        config.idle_timeout(),
        config.max_lifetime(),
        config.on_timeout,
    );
    ctx.store
        .update_status(&sandbox_id, SessionStatus::Running, None)
        .await
        .map_err(Fault::from)?;
    info!(sandbox_id = %sandbox_id, template = %config.template, "sandbox created");
    Ok(())
}

async fn destroy_sandbox<C: Clock>(ctx: &RpcCtx<C>, sandbox_id: SandboxId) -> Result<(), Fault> {
    ctx.router.destroy(&sandbox_id).await?;
    match ctx
        .store
        .update_status(&sandbox_id, SessionStatus::Stopped, None)
        .await
    {
        Ok(()) => Ok(()),
        // Destroy of an unknown or already-stopped sandbox is a no-op.
        Err(sbx_store::StoreError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
