//! Skips socket-bound tests in sandboxes that forbid binding loopback ports.

use std::net::TcpListener;

use wiremock::MockServer;

/// Returns whether a loopback TCP port can be bound.
pub fn loopback_available() -> bool {
    match TcpListener::bind("127.0.0.1:0") {
        Ok(_) => true,
        Err(err) => {
            eprintln!("skipping socket-bound test: cannot bind loopback: {err}");
            false
        }
    }
}

/// Starts a mock server, or returns `None` when sockets are unavailable.
pub async fn start_mock_server_or_skip() -> Option<MockServer> {
    if !loopback_available() {
        return None;
    }
    Some(MockServer::start().await)
}

/// Early-return value for skipped tests.
pub fn socket_skip_return() {}
