//! One SMTP connection, plaintext or TLS, with per-command timeouts.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::ClientConnection;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::reply::{is_continuation, Reply, MAX_REPLY_LINES};
use crate::error::{ErrorKind, InspectError};

/// RFC 5321 §4.5.3.1.5 allows 512 octets; leave room for sloppy servers.
const MAX_LINE_LEN: u64 = 4096;

pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

fn io_error(what: &str, e: io::Error) -> InspectError {
    let kind = match e.kind() {
        io::ErrorKind::TimedOut => ErrorKind::Timeout,
        _ => ErrorKind::ProtocolViolation,
    };
    InspectError::new(kind, format!("{what}: {e}"))
}

fn timed_out(what: &str, after: Duration) -> InspectError {
    InspectError::new(ErrorKind::Timeout, format!("{what} timed out after {}ms", after.as_millis()))
}

/// An open session. Dropping it closes the socket.
pub struct Connection {
    stream: BufReader<Transport>,
    command_timeout: Duration,
}

impl Connection {
    /// Open a TCP connection to `host:port`.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self, InspectError> {
        let tcp = match timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Err(_) => return Err(timed_out(&format!("connect to {host}:{port}"), connect_timeout)),
            Ok(Err(e)) => {
                let kind = match e.kind() {
                    io::ErrorKind::TimedOut => ErrorKind::Timeout,
                    _ => ErrorKind::ConnectionRefused,
                };
                return Err(InspectError::new(kind, format!("cannot connect to {host}:{port}: {e}")));
            }
            Ok(Ok(tcp)) => tcp,
        };
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(%host, port, error = %e, "TCP_NODELAY not set");
        }
        debug!(%host, port, "connected");
        Ok(Self {
            stream: BufReader::new(Transport::Plain(tcp)),
            command_timeout,
        })
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream.get_ref(), Transport::Tls(_))
    }

    /// The rustls session once TLS is up.
    pub fn tls_session(&self) -> Option<&ClientConnection> {
        match self.stream.get_ref() {
            Transport::Tls(s) => Some(s.get_ref().1),
            Transport::Plain(_) => None,
        }
    }

    async fn read_line(&mut self) -> Result<String, InspectError> {
        let mut line = String::new();
        let mut limited = (&mut self.stream).take(MAX_LINE_LEN);
        let read = limited.read_line(&mut line);
        let n = timeout(self.command_timeout, read)
            .await
            .map_err(|_| timed_out("waiting for server reply", self.command_timeout))?
            .map_err(|e| io_error("reading reply", e))?;
        if n == 0 {
            return Err(InspectError::new(
                ErrorKind::ProtocolViolation,
                "connection closed by server",
            ));
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        trace!(%line, "S:");
        Ok(line)
    }

    /// Raw lines of the next reply. Stops at the first line that is not a
    /// continuation, so a malformed line ends the reply.
    pub async fn read_lines(&mut self) -> Result<Vec<String>, InspectError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            let more = is_continuation(&line);
            lines.push(line);
            if !more {
                return Ok(lines);
            }
            if lines.len() >= MAX_REPLY_LINES {
                return Err(InspectError::new(
                    ErrorKind::ProtocolViolation,
                    format!("reply longer than {MAX_REPLY_LINES} lines"),
                ));
            }
        }
    }

    pub async fn read_reply(&mut self) -> Result<Reply, InspectError> {
        let lines = self.read_lines().await?;
        Ok(Reply::parse(&lines)?)
    }

    async fn write_line(&mut self, line: &str) -> Result<(), InspectError> {
        let stream = self.stream.get_mut();
        let write = async {
            stream.write_all(line.as_bytes()).await?;
            stream.write_all(b"\r\n").await?;
            stream.flush().await
        };
        timeout(self.command_timeout, write)
            .await
            .map_err(|_| timed_out("sending command", self.command_timeout))?
            .map_err(|e| io_error("sending command", e))
    }

    /// Send a command line (without CRLF).
    pub async fn send(&mut self, line: &str) -> Result<(), InspectError> {
        trace!(%line, "C:");
        self.write_line(line).await
    }

    /// Send a line carrying credentials. Its content is never logged.
    pub async fn send_secret(&mut self, line: &str) -> Result<(), InspectError> {
        trace!("C: <credentials>");
        self.write_line(line).await
    }

    pub async fn command(&mut self, line: &str) -> Result<Reply, InspectError> {
        self.send(line).await?;
        self.read_reply().await
    }

    /// Run the TLS handshake over this connection.
    pub async fn upgrade(self, connector: &TlsConnector, server_name: ServerName<'static>) -> Result<Self, InspectError> {
        // anything already buffered arrived before TLS and could be injected
        if !self.stream.buffer().is_empty() {
            return Err(InspectError::new(
                ErrorKind::ProtocolViolation,
                "server sent data after the STARTTLS reply",
            ));
        }
        let command_timeout = self.command_timeout;
        let tcp = match self.stream.into_inner() {
            Transport::Plain(tcp) => tcp,
            Transport::Tls(_) => {
                return Err(InspectError::new(ErrorKind::ProtocolViolation, "TLS is already active"));
            }
        };
        let tls = timeout(command_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| {
                InspectError::new(
                    ErrorKind::TlsNegotiationFailed,
                    format!("TLS handshake timed out after {}ms", command_timeout.as_millis()),
                )
            })?
            .map_err(|e| InspectError::new(ErrorKind::TlsNegotiationFailed, format!("TLS handshake failed: {e}")))?;
        debug!("TLS established");
        Ok(Self {
            stream: BufReader::new(Transport::Tls(Box::new(tls))),
            command_timeout,
        })
    }

    /// Send QUIT, wait briefly for the reply, then shut the socket down.
    pub async fn quit(mut self) {
        if self.send("QUIT").await.is_ok() {
            let _ = self.read_reply().await;
        }
        let _ = timeout(self.command_timeout, self.stream.get_mut().shutdown()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reads_multiline_and_reports_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"220-first\r\n220 second\r\n").await.unwrap();
        });
        let mut conn = Connection::connect("127.0.0.1", port, Duration::from_secs(2), Duration::from_secs(2))
            .await
            .unwrap();
        let reply = conn.read_reply().await.unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.lines, vec!["first", "second"]);
        let err = conn.read_reply().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProtocolViolation);
        assert!(!conn.is_tls());
    }

    #[tokio::test]
    async fn plain_connection_disables_nagle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });
        let conn = Connection::connect("127.0.0.1", port, Duration::from_secs(2), Duration::from_secs(2))
            .await
            .unwrap();
        match conn.stream.get_ref() {
            Transport::Plain(tcp) => assert!(tcp.nodelay().unwrap()),
            Transport::Tls(_) => panic!("expected a plain stream"),
        }
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (s, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(s);
        });
        let mut conn = Connection::connect("127.0.0.1", port, Duration::from_secs(2), Duration::from_millis(100))
            .await
            .unwrap();
        let err = conn.read_reply().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        server.abort();
    }
}
