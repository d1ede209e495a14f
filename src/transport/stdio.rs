//! Stdio transport for the MCP server.
//!
//! Reads JSON-RPC messages from stdin and writes responses to stdout. The
//! connection pool is closed before returning, whichever way the session
//! ends.

use crate::error::{DbError, DbResult};
use crate::mcp::DbService;
use crate::transport::Transport;
use rmcp::{ServiceExt, transport::stdio};
use tokio::signal;
use tracing::{info, warn};

pub struct StdioTransport {
    service: DbService,
}

impl StdioTransport {
    pub fn new(service: DbService) -> Self {
        Self { service }
    }
}

impl Transport for StdioTransport {
    async fn run(&self) -> DbResult<()> {
        info!("Starting MCP server with stdio transport");

        let running_service = self
            .service
            .clone()
            .serve(stdio())
            .await
            .map_err(|e| DbError::internal(format!("Failed to start stdio transport: {}", e)))?;

        let (shutdown_requested, outcome) = tokio::select! {
            result = running_service.waiting() => {
                let outcome = match result {
                    Ok(_quit_reason) => {
                        info!("Stdio transport completed normally");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(error = %e, "Stdio transport error");
                        Err(DbError::internal(format!("Stdio transport error: {}", e)))
                    }
                };
                (false, outcome)
            }
            _ = wait_for_signal() => {
                info!("Shutdown signal received (send again to force exit)");
                (true, Ok(()))
            }
        };

        if shutdown_requested {
            tokio::spawn(async {
                wait_for_signal().await;
                warn!("Received second signal, forcing immediate exit");
                std::process::exit(1);
            });
        }

        info!("Closing connection pool");
        self.service.dispatcher().pool().close().await;

        if shutdown_requested {
            // A blocking stdin read cannot be interrupted from here.
            info!("Exiting process");
            std::process::exit(0);
        }

        outcome
    }

    fn name(&self) -> &'static str {
        "stdio"
    }
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
