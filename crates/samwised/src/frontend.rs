// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The client-facing front door (spec §6): one `tokio::net::TcpListener`
//! accepting connections that speak the length-prefixed `Msg` wire
//! protocol, each handled on its own task and routed into the dispatcher
//! reactor via [`DispCommand`].

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{error, info, warn};

use samwise_core::dispatch::DispCommand;
use samwise_core::error::CoreError;
use samwise_wire::codec;
use samwise_wire::protocol::{decode_request, Request, Response};

use crate::error::DaemonError;
use crate::EXIT_FATAL;

/// Accept connections on `addr` until `shutdown` is notified.
pub async fn run(
    addr: &str,
    disp_commands: mpsc::Sender<DispCommand>,
    shutdown: Arc<Notify>,
) -> Result<(), DaemonError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| DaemonError::Bind(addr.to_string(), err))?;
    info!(addr, "client front door listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let disp_commands = disp_commands.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, disp_commands).await {
                                warn!(%peer, error = %err, "client connection closed with an error");
                            }
                        });
                    }
                    Err(err) => error!(error = %err, "accept failed"),
                }
            }
            _ = shutdown.notified() => {
                info!("front door shutting down");
                return Ok(());
            }
        }
    }
}

/// One client connection: request/response pairs until the peer closes, or
/// a fatal buffer error takes the whole process down.
async fn handle_connection(
    mut stream: TcpStream,
    disp_commands: mpsc::Sender<DispCommand>,
) -> Result<(), DaemonError> {
    loop {
        let msg = match codec::read_msg(&mut stream).await {
            Ok(Some(msg)) => msg,
            Ok(None) => return Ok(()),
            Err(err) => return Err(DaemonError::Wire(err)),
        };

        let response = match decode_request(msg) {
            Ok(Request::Ping) => Response::ok("pong"),
            Ok(Request::Publish(request)) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if disp_commands
                    .send(DispCommand::Accept { request, reply: reply_tx })
                    .await
                    .is_err()
                {
                    fatal_shutdown("dispatcher command channel closed");
                }
                match reply_rx.await {
                    Ok(Ok(key)) => Response::ok_key(key),
                    Ok(Err(err)) => respond_to_core_error(err),
                    Err(_) => fatal_shutdown("dispatcher reply channel dropped"),
                }
            }
            Ok(Request::Rpc(request)) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if disp_commands
                    .send(DispCommand::Rpc { request, reply: reply_tx })
                    .await
                    .is_err()
                {
                    fatal_shutdown("dispatcher command channel closed");
                }
                match reply_rx.await {
                    Ok(Ok(())) => Response::ok(""),
                    Ok(Err(err)) => respond_to_core_error(err),
                    Err(_) => fatal_shutdown("dispatcher reply channel dropped"),
                }
            }
            Err(err) => Response::error(-1, err.to_string()),
        };

        codec::write_msg(&mut stream, &response.encode())
            .await
            .map_err(DaemonError::Wire)?;
    }
}

/// `CoreError::Fatal`/`CorruptRecord` are never reported to a client (spec
/// §4.3.5/§7): the process exits for a supervisor restart instead.
fn respond_to_core_error(err: CoreError) -> Response {
    if err.is_fatal() {
        fatal_shutdown(&err.to_string());
    }
    match err {
        CoreError::NoBrokerAvailable => Response::error(-2, err.to_string()),
        CoreError::Protocol(_) => Response::error(-1, err.to_string()),
        CoreError::Fatal(_) | CoreError::CorruptRecord(_) => unreachable!("handled above"),
    }
}

fn fatal_shutdown(reason: &str) -> ! {
    error!(reason, "fatal error, exiting for supervisor restart");
    std::process::exit(EXIT_FATAL);
}
