use std::process;

use tunnelguard_lib::command::{self, Command, Response};
use tunnelguard_lib::ipc;

mod cli;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    let args = cli::parse();

    let cmd = match args.command.into_lib_command() {
        Ok(cmd) => cmd,
        Err(error) => {
            eprintln!("{error}");
            process::exit(exitcode::DATAERR);
        }
    };

    let resp: Response = match ipc::send(&args.socket_path, &cmd).await {
        Ok(resp) => resp,
        Err(error) => {
            eprintln!("Error processing {cmd}: {error}");
            process::exit(exitcode::UNAVAILABLE);
        }
    };

    if args.json {
        json_print(&resp)
    } else {
        pretty_print(&resp)
    }

    process::exit(determine_exitcode(&resp));
}

fn json_print(resp: &Response) {
    match serde_json::to_string_pretty(resp) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Error serializing response to JSON: {e}"),
    }
}

fn pretty_print(resp: &Response) {
    match resp {
        Response::Pong => println!("Pong"),
        Response::Status(command::StatusResponse { running, rule_count, active_route_count, conflict_stats }) => {
            println!("running: {running}");
            println!("rules: {rule_count}");
            println!("active routes: {active_route_count}");
            println!(
                "conflicts: {} ({} ips tracked across {} domains)",
                conflict_stats.active_conflicts, conflict_stats.tracked_ips, conflict_stats.tracked_domains
            );
        }
        Response::Rules(rules) => {
            if rules.is_empty() {
                println!("no rules configured");
            }
            for rule in rules {
                println!("{} -> {}", rule.pattern, if rule.tunnel { "tunnel" } else { "direct" });
            }
        }
        Response::Routes(routes) => {
            if routes.is_empty() {
                println!("no routes injected");
            }
            for route in routes {
                println!("{} ({}) ttl={}s", route.ip_cidr, route.domain, route.ttl_secs);
            }
        }
        Response::Conflicts(conflicts) => {
            if conflicts.is_empty() {
                println!("no conflicts detected");
            }
            for conflict in conflicts {
                println!(
                    "{}: tunnel={:?} direct={:?}",
                    conflict.ip, conflict.tunnel_domains, conflict.direct_domains
                );
            }
        }
        Response::Ack => println!("ok"),
        Response::Error(error) => eprintln!("Error: {error}"),
    }
}

fn determine_exitcode(resp: &Response) -> i32 {
    match resp {
        Response::Error(_) => exitcode::SOFTWARE,
        _ => exitcode::OK,
    }
}
