use tokio::net::UnixStream;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

use std::process;
use std::sync::Arc;

use tunnelguard_lib::engine::Engine;
use tunnelguard_lib::ipc;
use tunnelguard_lib::logging;

mod cli;

#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

enum SignalMessage {
    Shutdown,
    RotateLogs,
}

async fn signal_channel() -> Result<mpsc::Receiver<SignalMessage>, exitcode::ExitCode> {
    let (sender, receiver) = mpsc::channel(8);
    let mut sigint = signal(SignalKind::interrupt()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGINT handler");
        exitcode::IOERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGTERM handler");
        exitcode::IOERR
    })?;
    let mut sighup = signal(SignalKind::hangup()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGHUP handler");
        exitcode::IOERR
    })?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(_) = sigint.recv() => {
                    tracing::debug!("received SIGINT");
                    if sender.send(SignalMessage::Shutdown).await.is_err() { break; }
                }
                Some(_) = sigterm.recv() => {
                    tracing::debug!("received SIGTERM");
                    if sender.send(SignalMessage::Shutdown).await.is_err() { break; }
                }
                Some(_) = sighup.recv() => {
                    tracing::debug!("received SIGHUP");
                    if sender.send(SignalMessage::RotateLogs).await.is_err() { break; }
                }
                else => break,
            }
        }
    });

    Ok(receiver)
}

async fn handle_connection(stream: UnixStream, engine: Arc<Engine>) {
    let (command, write_half) = match ipc::accept_request(stream).await {
        Ok(accepted) => accepted,
        Err(error) => {
            tracing::error!(%error, "failed decoding command on control socket");
            return;
        }
    };

    tracing::debug!(%command, "incoming command");
    let response = engine.handle_cmd(command).await;

    if let Err(error) = ipc::respond(write_half, &response).await {
        tracing::error!(%error, "failed sending response on control socket");
    }
}

async fn daemon(args: cli::Cli, log_reload: Option<(logging::LogReloadHandle, String)>) -> Result<(), exitcode::ExitCode> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting {}", env!("CARGO_PKG_NAME"));

    let listener = ipc::bind(&args.socket_path).map_err(|error| {
        tracing::error!(%error, "error binding control socket");
        exitcode::OSFILE
    })?;

    let mut signal_receiver = signal_channel().await?;

    let engine = Engine::init(&args.config_path, &args.root_socket_path, args.vpn_socks_addr).await.map_err(|error| {
        tracing::error!(%error, "failed to initialize engine");
        exitcode::OSERR
    })?;

    tracing::info!(socket_path = %args.socket_path.display(), "entering main loop");

    loop {
        tokio::select! {
            Some(signal) = signal_receiver.recv() => match signal {
                SignalMessage::Shutdown => {
                    tracing::info!("shutting down");
                    if let Err(error) = engine.stop().await {
                        tracing::debug!(%error, "stop on shutdown (already stopped is fine)");
                    }
                    break;
                }
                SignalMessage::RotateLogs => {
                    if let Some((handle, log_path)) = &log_reload {
                        if let Err(error) = handle.reload(logging::make_file_fmt_layer(log_path)) {
                            tracing::error!(%error, "failed reopening log file on SIGHUP");
                        } else {
                            tracing::info!("reopened log file after SIGHUP");
                        }
                    } else {
                        tracing::debug!("SIGHUP received, logging to stdout has nothing to rotate");
                    }
                }
            },
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, engine).await;
                        });
                    }
                    Err(error) => {
                        tracing::error!(%error, "error accepting control connection");
                    }
                }
            }
        }
    }

    let _ = std::fs::remove_file(&args.socket_path);
    Ok(())
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() {
    let args = cli::parse();

    let log_reload = if args.log_file {
        Some(logging::init())
    } else {
        logging::init_stdout();
        None
    };

    match daemon(args, log_reload).await {
        Ok(()) => (),
        Err(code) => {
            tracing::warn!(code, "abnormal exit");
            process::exit(code);
        }
    }
}
