//! Server side of the handshake

use super::{read_head, Credentials, HandshakeMessage, ProtocolError, Response, STATUS_PROBE};
use crate::admission::{AdmissionController, AdmissionGuard};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Immutable handshake parameters
#[derive(Debug, Clone)]
pub struct HandshakeSettings {
    pub credentials: Credentials,
    /// Largest accepted request head
    pub header_limit: usize,
    /// Deadline for reading the whole request head
    pub timeout: Duration,
    /// `Server:` header on crafted responses
    pub server_name: String,
}

impl HandshakeSettings {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            header_limit: super::DEFAULT_HEADER_LIMIT,
            timeout: Duration::from_secs(5),
            server_name: super::DEFAULT_SERVER_NAME.to_string(),
        }
    }
}

/// Successful end of a server handshake
#[derive(Debug)]
pub enum Outcome {
    /// The status probe was answered; the connection is done
    Status,
    /// `101` was sent; the slot is held until the guard drops
    Upgraded(AdmissionGuard),
}

/// Per-listener handshake state machine
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    settings: Arc<HandshakeSettings>,
    admission: Arc<AdmissionController>,
}

impl ServerHandshake {
    pub fn new(settings: HandshakeSettings, admission: Arc<AdmissionController>) -> Self {
        Self {
            settings: Arc::new(settings),
            admission,
        }
    }

    pub fn settings(&self) -> &HandshakeSettings {
        &self.settings
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Run the handshake on a fresh connection.
    ///
    /// Every failure has already been answered with a crafted response when
    /// this returns. On `Upgraded` the remaining bytes in `io` belong to the
    /// multiplexed session.
    pub async fn run<S>(&self, io: &mut S) -> Result<Outcome, ProtocolError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin,
    {
        let head = tokio::time::timeout(
            self.settings.timeout,
            read_head(io, self.settings.header_limit),
        )
        .await
        .unwrap_or_else(|_| Err(ProtocolError::timed_out()));

        let result = match head {
            Ok(head) => self.decide(&head),
            Err(e) => Err(e),
        };

        match result {
            Ok(None) => {
                let status = self.admission.status();
                debug!("Answering status probe with {}/{}", status.current, status.max);
                Response::status(status, &self.settings.server_name)
                    .write_to(io)
                    .await?;
                let _ = io.shutdown().await;
                Ok(Outcome::Status)
            }
            Ok(Some(guard)) => {
                // The guard drops, and frees the slot, if the reply can't be sent
                Response::switching_protocols().write_to(io).await?;
                Ok(Outcome::Upgraded(guard))
            }
            Err(e) => {
                self.reject(io, &e).await;
                Err(e)
            }
        }
    }

    /// Fast path, validation, authentication and admission, in that order.
    /// `None` means the status probe.
    fn decide(&self, head: &HandshakeMessage) -> Result<Option<AdmissionGuard>, ProtocolError> {
        if head.contains(STATUS_PROBE) {
            return Ok(None);
        }

        let upgrade = head.header("upgrade").unwrap_or_default();
        if !upgrade.to_ascii_lowercase().contains("websocket") {
            return Err(ProtocolError::InvalidPayload);
        }

        match (head.header("user"), head.header("password")) {
            (Some(user), Some(password)) if self.settings.credentials.matches(user, password) => {}
            _ => return Err(ProtocolError::AuthFailed),
        }

        self.admission
            .try_admit()
            .map(Some)
            .ok_or_else(|| {
                let status = self.admission.status();
                ProtocolError::AdmissionDenied {
                    current: status.current,
                    max: status.max,
                }
            })
    }

    /// Best-effort rejection, bounded by the handshake timeout
    async fn reject<S>(&self, io: &mut S, err: &ProtocolError)
    where
        S: AsyncWrite + Unpin,
    {
        let Some(response) = Response::for_error(err, &self.settings.server_name) else {
            return;
        };

        let write = async {
            response.write_to(io).await?;
            io.shutdown().await
        };
        if let Ok(Err(e)) = tokio::time::timeout(self.settings.timeout, write).await {
            debug!("Failed to send {} rejection: {}", response.status_code(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, BufReader, DuplexStream};

    const UPGRADE: &str = "GET / HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\n";

    fn handshake(max: usize) -> ServerHandshake {
        let mut settings = HandshakeSettings::new(Credentials::new("sung", "Pass.123"));
        settings.timeout = Duration::from_millis(300);
        ServerHandshake::new(settings, AdmissionController::new(max))
    }

    /// Send `request`, run the handshake, return its result and the raw reply
    async fn exchange(
        handshake: &ServerHandshake,
        request: &str,
    ) -> (Result<Outcome, ProtocolError>, String, DuplexStream) {
        let (mut client, server) = duplex(64 * 1024);
        client.write_all(request.as_bytes()).await.unwrap();

        let mut io = BufReader::new(server);
        let result = handshake.run(&mut io).await;

        let mut reply = vec![0u8; 4096];
        let n = client.read(&mut reply).await.unwrap();
        reply.truncate(n);
        (result, String::from_utf8(reply).unwrap(), client)
    }

    #[tokio::test]
    async fn test_upgrade_succeeds() {
        let hs = handshake(2);
        let request = format!("{}User: sung\r\nPassword: Pass.123\r\n\r\n", UPGRADE);

        let (result, reply, _client) = exchange(&hs, &request).await;

        assert!(matches!(result, Ok(Outcome::Upgraded(_))));
        assert!(reply.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(reply.contains("Upgrade: websocket\r\n"));
        assert_eq!(hs.admission().active(), 1);

        drop(result);
        assert_eq!(hs.admission().active(), 0);
    }

    #[tokio::test]
    async fn test_header_names_ignore_case() {
        let hs = handshake(1);
        let request = "GET / HTTP/1.1\r\nUPGRADE: WebSocket\r\nuSeR: sung\r\nPASSWORD: Pass.123\r\n\r\n";

        let (result, reply, _client) = exchange(&hs, request).await;
        assert!(matches!(result, Ok(Outcome::Upgraded(_))), "{}", reply);
    }

    #[tokio::test]
    async fn test_password_is_case_sensitive() {
        let hs = handshake(1);
        let request = format!("{}User: sung\r\nPassword: pass.123\r\n\r\n", UPGRADE);

        let (result, reply, _client) = exchange(&hs, &request).await;
        assert!(matches!(result, Err(ProtocolError::AuthFailed)));
        assert!(reply.starts_with("HTTP/1.1 403 Invalid Credentials\r\n"));
        assert_eq!(hs.admission().active(), 0);
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let hs = handshake(1);
        let (result, _, _client) = exchange(&hs, &format!("{}User: sung\r\n\r\n", UPGRADE)).await;
        assert!(matches!(result, Err(ProtocolError::AuthFailed)));
    }

    #[tokio::test]
    async fn test_missing_upgrade_is_invalid_payload() {
        let hs = handshake(1);
        let request = "GET / HTTP/1.1\r\nUser: sung\r\nPassword: Pass.123\r\n\r\n";

        let (result, reply, _client) = exchange(&hs, request).await;
        assert!(matches!(result, Err(ProtocolError::InvalidPayload)));
        assert!(reply.starts_with("HTTP/1.1 403 Invalid Payload\r\n"));
        let server_header = format!("Server: {}\r\n", hs.settings().server_name);
        assert!(reply.contains(&server_header));
    }

    #[tokio::test]
    async fn test_status_probe_skips_validation() {
        let hs = handshake(4);
        let _held = hs.admission().try_admit().unwrap();

        let (result, reply, _client) = exchange(&hs, "GET /users HTTP/1.1\r\n\r\n").await;
        assert!(matches!(result, Ok(Outcome::Status)));
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.ends_with("{\"data\": \"1/4\"}"));

        // Wrong credentials do not matter either
        let request = "GET /users HTTP/1.1\r\nUpgrade: nope\r\nPassword: wrong\r\n\r\n";
        let (result, _, _client) = exchange(&hs, request).await;
        assert!(matches!(result, Ok(Outcome::Status)));
    }

    #[tokio::test]
    async fn test_status_probe_reachable_when_full() {
        let hs = handshake(1);
        let _held = hs.admission().try_admit().unwrap();

        let (result, reply, _client) = exchange(&hs, "GET /users HTTP/1.1\r\n\r\n").await;
        assert!(matches!(result, Ok(Outcome::Status)));
        assert!(reply.ends_with("{\"data\": \"1/1\"}"));
    }

    #[tokio::test]
    async fn test_server_full() {
        let hs = handshake(1);
        let _held = hs.admission().try_admit().unwrap();
        let request = format!("{}User: sung\r\nPassword: Pass.123\r\n\r\n", UPGRADE);

        let (result, reply, _client) = exchange(&hs, &request).await;
        assert!(matches!(
            result,
            Err(ProtocolError::AdmissionDenied { current: 1, max: 1 })
        ));
        assert!(reply.starts_with("HTTP/1.1 503 Server Full\r\n"));
        assert_eq!(hs.admission().active(), 1);
    }

    #[tokio::test]
    async fn test_oversized_head() {
        let mut settings = HandshakeSettings::new(Credentials::new("u", "p"));
        settings.header_limit = 32;
        let hs = ServerHandshake::new(settings, AdmissionController::new(1));

        let (result, reply, _client) = exchange(&hs, &format!("{}\r\n", UPGRADE)).await;
        assert!(matches!(result, Err(ProtocolError::HeaderTooLarge(32))));
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_slow_loris_times_out() {
        let hs = handshake(1);
        let (mut client, server) = duplex(1024);
        // Head never finishes
        client.write_all(b"GET / HTTP/1.1\r\nUpgr").await.unwrap();

        let mut io = BufReader::new(server);
        let started = tokio::time::Instant::now();
        let result = hs.run(&mut io).await;

        assert!(matches!(&result, Err(e) if e.is_timeout()));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(hs.admission().active(), 0);

        let mut reply = String::new();
        drop(io);
        client.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_session_bytes_survive_handshake() {
        let hs = handshake(1);
        let (mut client, server) = duplex(1024);
        let request = format!("{}User: sung\r\nPassword: Pass.123\r\n\r\nFRAME", UPGRADE);
        client.write_all(request.as_bytes()).await.unwrap();

        let mut io = BufReader::new(server);
        let outcome = hs.run(&mut io).await.unwrap();
        assert!(matches!(outcome, Outcome::Upgraded(_)));

        let mut rest = [0u8; 5];
        io.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"FRAME");
    }
}
