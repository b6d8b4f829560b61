//! Wire types exchanged over the daemon's control socket
//! (`tunnelguard-ctl` <-> `tunnelguard`).

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::conflict::{Conflict, Stats as ConflictStats};
use crate::domain::Rule;
use crate::route::InjectedRoute;

pub const DEFAULT_PATH: &str = "/var/run/tunnelguard/tunnelguard.sock";
pub const ENV_VAR: &str = "TUNNELGUARD_SOCKET_PATH";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command {
    /// Liveness probe; also used to detect an already-running instance.
    Ping,
    Status,
    AddRule { pattern: String, tunnel: bool },
    RemoveRule { pattern: String },
    LoadRules { rules: Vec<Rule> },
    GetRules,
    GetRoutes,
    GetConflicts,
    Start,
    Stop,
}

impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Ping => write!(f, "Ping"),
            Command::Status => write!(f, "Status"),
            Command::AddRule { pattern, tunnel } => write!(f, "AddRule({pattern}, tunnel={tunnel})"),
            Command::RemoveRule { pattern } => write!(f, "RemoveRule({pattern})"),
            Command::LoadRules { rules } => write!(f, "LoadRules({} rules)", rules.len()),
            Command::GetRules => write!(f, "GetRules"),
            Command::GetRoutes => write!(f, "GetRoutes"),
            Command::GetConflicts => write!(f, "GetConflicts"),
            Command::Start => write!(f, "Start"),
            Command::Stop => write!(f, "Stop"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub running: bool,
    pub rule_count: usize,
    pub active_route_count: usize,
    pub conflict_stats: ConflictStats,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Pong,
    Status(StatusResponse),
    Rules(Vec<Rule>),
    Routes(Vec<InjectedRoute>),
    Conflicts(Vec<Conflict>),
    Ack,
    Error(String),
}

impl Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Response::Pong => write!(f, "Pong"),
            Response::Status(_) => write!(f, "Status"),
            Response::Rules(rules) => write!(f, "Rules({} entries)", rules.len()),
            Response::Routes(routes) => write!(f, "Routes({} entries)", routes.len()),
            Response::Conflicts(conflicts) => write!(f, "Conflicts({} entries)", conflicts.len()),
            Response::Ack => write!(f, "Ack"),
            Response::Error(err) => write!(f, "Error({err})"),
        }
    }
}
