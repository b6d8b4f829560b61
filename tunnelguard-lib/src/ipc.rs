//! Newline-delimited JSON over a Unix domain socket.
//!
//! Both the daemon's control socket (`tunnelguard-ctl` <-> `tunnelguard`) and
//! the privileged socket (`tunnelguard` <-> `tunnelguard-root`) speak the same
//! shape: the client connects, writes one JSON value terminated by a newline,
//! shuts down the write half to signal end-of-request, then reads the full
//! response as one JSON value.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Error)]
pub enum Error {
    #[error("error accessing socket at `{socket_path}`: {error}")]
    SocketPathIO { socket_path: PathBuf, error: io::Error },
    #[error("error connecting socket at `{socket_path}`: {error}")]
    ConnectSocketIO { socket_path: PathBuf, error: io::Error },
    #[error("failed serializing message: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("error writing to socket: {0}")]
    WriteSocketIO(io::Error),
    #[error("error reading from socket: {0}")]
    ReadSocketIO(io::Error),
}

/// Connects to `socket_path`, sends `request` as a single JSON message, shuts
/// down the write half, then reads and decodes the full response.
pub async fn send<Req, Resp>(socket_path: &Path, request: &Req) -> Result<Resp, Error>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|error| Error::ConnectSocketIO { socket_path: socket_path.to_path_buf(), error })?;
    let (read_half, write_half) = stream.into_split();

    push_request(write_half, request).await?;
    pull_response(read_half).await
}

async fn push_request(mut write_half: tokio::net::unix::OwnedWriteHalf, request: &impl Serialize) -> Result<(), Error> {
    let payload = serde_json::to_vec(request)?;
    write_half.write_all(&payload).await.map_err(Error::WriteSocketIO)?;
    write_half.write_all(b"\n").await.map_err(Error::WriteSocketIO)?;
    write_half.flush().await.map_err(Error::WriteSocketIO)?;
    write_half.shutdown().await.map_err(Error::WriteSocketIO)?;
    Ok(())
}

async fn pull_response<Resp: DeserializeOwned>(mut read_half: tokio::net::unix::OwnedReadHalf) -> Result<Resp, Error> {
    let mut buf = String::new();
    read_half.read_to_string(&mut buf).await.map_err(Error::ReadSocketIO)?;
    Ok(serde_json::from_str(buf.trim())?)
}

/// Binds a Unix listener at `socket_path`, removing a stale socket file left
/// behind by a prior run first. Sets world read/write permissions on the
/// socket so an unprivileged client can connect to a privileged server.
pub fn bind(socket_path: &Path) -> Result<UnixListener, Error> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .map_err(|error| Error::SocketPathIO { socket_path: socket_path.to_path_buf(), error })?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).map_err(|error| Error::SocketPathIO { socket_path: socket_path.to_path_buf(), error })?;
    }
    let listener = UnixListener::bind(socket_path)
        .map_err(|error| Error::SocketPathIO { socket_path: socket_path.to_path_buf(), error })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o666);
        let _ = std::fs::set_permissions(socket_path, perms);
    }

    Ok(listener)
}

/// Reads a single JSON request off an accepted connection and returns a
/// writer half the server can use to send the response with [`respond`].
pub async fn accept_request<Req: DeserializeOwned>(
    stream: UnixStream,
) -> Result<(Req, tokio::net::unix::OwnedWriteHalf), Error> {
    let (mut read_half, write_half) = stream.into_split();
    let mut buf = String::new();
    read_half.read_to_string(&mut buf).await.map_err(Error::ReadSocketIO)?;
    let request = serde_json::from_str(buf.trim())?;
    Ok((request, write_half))
}

pub async fn respond(mut write_half: tokio::net::unix::OwnedWriteHalf, response: &impl Serialize) -> Result<(), Error> {
    let payload = serde_json::to_vec(response)?;
    write_half.write_all(&payload).await.map_err(Error::WriteSocketIO)?;
    write_half.write_all(b"\n").await.map_err(Error::WriteSocketIO)?;
    write_half.flush().await.map_err(Error::WriteSocketIO)?;
    write_half.shutdown().await.map_err(Error::WriteSocketIO)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        nonce: u32,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Pong {
        nonce: u32,
    }

    #[tokio::test]
    async fn round_trips_a_request_and_response_over_a_socket_pair() {
        let (client, server) = UnixStream::pair().expect("socket pair");

        let server_task = tokio::spawn(async move {
            let (request, writer): (Ping, _) = accept_request(server).await.expect("accept request");
            respond(writer, &Pong { nonce: request.nonce }).await.expect("respond");
        });

        let (read_half, write_half) = client.into_split();
        push_request(write_half, &Ping { nonce: 7 }).await.expect("push request");
        let pong: Pong = pull_response(read_half).await.expect("pull response");

        server_task.await.expect("server task");
        assert_eq!(pong, Pong { nonce: 7 });
    }

    #[tokio::test]
    async fn send_reports_connect_error_for_missing_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("does-not-exist.sock");

        let result = send::<Ping, Pong>(&missing, &Ping { nonce: 1 }).await;
        assert!(matches!(result, Err(Error::ConnectSocketIO { .. })));
    }
}
