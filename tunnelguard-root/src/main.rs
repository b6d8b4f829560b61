use tokio::net::UnixStream;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

use std::process;
use std::sync::Arc;

use tunnelguard_lib::ipc;
use tunnelguard_lib::logging;
use tunnelguard_lib::privileged::{Request, Response, SystemDnsRequest, SystemDnsResponse, VpnRequest, VpnResponse};
use tunnelguard_lib::system_dns::SystemDnsAdapter;
use tunnelguard_lib::vpn::VpnAdapter;

mod cli;
mod system_dns;
mod wg;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
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

async fn handle_vpn_request(vpn: &wg::WgAdapter, request: VpnRequest) -> VpnResponse {
    match request {
        VpnRequest::ListInterfaces => match vpn.list_interfaces().await {
            Ok(interfaces) => VpnResponse::Interfaces(interfaces),
            Err(error) => {
                tracing::warn!(%error, "list_interfaces failed");
                VpnResponse::Interfaces(Vec::new())
            }
        },
        VpnRequest::GetInterface { name } => match vpn.get_interface(&name).await {
            Ok(interface) => VpnResponse::Interface(interface),
            Err(error) => {
                tracing::warn!(%error, "get_interface failed");
                VpnResponse::Interface(None)
            }
        },
        VpnRequest::SetConfig { config } => VpnResponse::Configured(vpn.set_config(config).await.map_err(|e| e.to_string())),
        VpnRequest::GetAllowedIps => match vpn.get_allowed_ips().await {
            Ok(ips) => VpnResponse::AllowedIps(ips),
            Err(error) => {
                tracing::warn!(%error, "get_allowed_ips failed");
                VpnResponse::AllowedIps(Vec::new())
            }
        },
        VpnRequest::AddAllowedIps { ips } => VpnResponse::Added(vpn.add_allowed_ips(&ips).await.map_err(|e| e.to_string())),
        VpnRequest::RemoveAllowedIps { ips } => {
            VpnResponse::Removed(vpn.remove_allowed_ips(&ips).await.map_err(|e| e.to_string()))
        }
        VpnRequest::IsAvailable => VpnResponse::Available(vpn.is_available().await),
        VpnRequest::IsActive => VpnResponse::Active(vpn.is_active().await),
        VpnRequest::DetectTunnels => VpnResponse::Tunnels(vpn.detect_tunnels().await),
    }
}

async fn handle_system_dns_request(dns: &system_dns::PlatformDns, request: SystemDnsRequest) -> SystemDnsResponse {
    match request {
        SystemDnsRequest::Configure { proxy_port } => {
            SystemDnsResponse::Configured(dns.configure(proxy_port).await.map_err(|e| e.to_string()))
        }
        SystemDnsRequest::Restore { backup } => SystemDnsResponse::Restored(dns.restore(&backup).await.map_err(|e| e.to_string())),
        SystemDnsRequest::CheckForStaleConfig { backup } => {
            SystemDnsResponse::Stale(dns.check_for_stale_config(&backup).await.map_err(|e| e.to_string()))
        }
    }
}

async fn handle_connection(stream: UnixStream, vpn: Arc<wg::WgAdapter>, dns: Arc<system_dns::PlatformDns>) {
    let (request, write_half): (Request, _) = match ipc::accept_request(stream).await {
        Ok(accepted) => accepted,
        Err(error) => {
            tracing::error!(%error, "failed decoding request on privileged socket");
            return;
        }
    };

    let response = match request {
        Request::Vpn(request) => Response::Vpn(handle_vpn_request(&vpn, request).await),
        Request::SystemDns(request) => Response::SystemDns(handle_system_dns_request(&dns, request).await),
    };

    if let Err(error) = ipc::respond(write_half, &response).await {
        tracing::error!(%error, "failed sending response on privileged socket");
    }
}

async fn daemon(args: cli::Cli, log_reload: Option<(logging::LogReloadHandle, String)>) -> Result<(), exitcode::ExitCode> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting {}", env!("CARGO_PKG_NAME"));

    let listener = ipc::bind(&args.socket_path).map_err(|error| {
        tracing::error!(%error, "error binding privileged socket");
        exitcode::OSFILE
    })?;

    let mut signal_receiver = signal_channel().await?;
    let vpn = Arc::new(wg::WgAdapter::new());
    let dns = Arc::new(system_dns::PlatformDns::new());

    tracing::info!(socket_path = %args.socket_path.display(), "entering main loop");

    loop {
        tokio::select! {
            Some(signal) = signal_receiver.recv() => match signal {
                SignalMessage::Shutdown => {
                    tracing::info!("shutting down");
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
                        let vpn = vpn.clone();
                        let dns = dns.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, vpn, dns).await;
                        });
                    }
                    Err(error) => {
                        tracing::error!(%error, "error accepting privileged connection");
                    }
                }
            }
        }
    }

    let _ = std::fs::remove_file(&args.socket_path);
    Ok(())
}

/// One thread is enough: the privileged socket is low-traffic control
/// plane, not a data-plane proxy.
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
