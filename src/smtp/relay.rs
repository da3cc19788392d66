//! Outbound SMTP client used by the delivery pipeline to hand messages to
//! remote mail exchangers.

use crate::error::{MailError, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Ports probed on each exchanger, in order.
pub const SUBMISSION_PORTS: [u16; 3] = [25, 2525, 587];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One outbound SMTP connection to a remote exchanger.
pub struct RelayClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: String,
}

impl RelayClient {
    /// Try every host/port combination in order and return the first
    /// connection that succeeds.
    pub async fn connect(hosts: &[String], ports: &[u16]) -> Result<Self> {
        for host in hosts {
            for port in ports {
                let addr = format!("{}:{}", host, port);
                match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
                    Ok(Ok(stream)) => {
                        debug!("Connected to exchanger {}", addr);
                        let (reader, writer) = stream.into_split();
                        return Ok(Self {
                            reader: BufReader::new(reader),
                            writer,
                            peer: addr,
                        });
                    }
                    Ok(Err(e)) => debug!("Exchanger {} refused: {}", addr, e),
                    Err(_) => debug!("Exchanger {} timed out", addr),
                }
            }
        }

        Err(MailError::Relay(format!(
            "no reachable exchanger among {:?}",
            hosts
        )))
    }

    /// Run one full submission dialogue and close the connection.
    pub async fn send(mut self, from: &str, to: &str, data: &str) -> Result<()> {
        info!("Relaying mail from <{}> to <{}> via {}", from, to, self.peer);

        let greeting = self.read_reply().await?;
        if !greeting.starts_with("220") {
            return Err(MailError::Relay(format!(
                "unexpected greeting from {}: {}",
                self.peer,
                greeting.trim()
            )));
        }

        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        self.exchange(&format!("EHLO {}", hostname), "250").await?;
        self.exchange(&format!("MAIL FROM:<{}>", from), "250").await?;
        self.exchange(&format!("RCPT TO:<{}>", to), "250").await?;
        self.exchange("DATA", "354").await?;

        self.writer.write_all(data.as_bytes()).await?;
        if !data.ends_with("\r\n.\r\n") {
            if !data.ends_with("\r\n") {
                self.writer.write_all(b"\r\n").await?;
            }
            self.writer.write_all(b".\r\n").await?;
        }

        let reply = self.read_reply().await?;
        if !reply.starts_with("250") {
            return Err(MailError::Relay(format!(
                "{} rejected message: {}",
                self.peer,
                reply.trim()
            )));
        }

        self.write_line("QUIT").await?;
        let _ = self.read_reply().await;

        info!("Relayed mail to <{}>", to);
        Ok(())
    }

    async fn exchange(&mut self, line: &str, expected: &str) -> Result<String> {
        self.write_line(line).await?;
        let reply = self.read_reply().await?;
        if !reply.starts_with(expected) {
            error!("Unexpected reply from {}: {}", self.peer, reply.trim());
            return Err(MailError::Relay(format!(
                "expected {}, got: {}",
                expected,
                reply.trim()
            )));
        }
        Ok(reply)
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        debug!("> {}", line);
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await?;
        Ok(())
    }

    /// Read a full (possibly multi-line) reply. The last line of a reply has
    /// a space after the code instead of a dash.
    async fn read_reply(&mut self) -> Result<String> {
        let mut reply = String::new();

        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(MailError::Relay(format!(
                    "{} closed the connection mid-reply",
                    self.peer
                )));
            }
            debug!("< {}", line.trim());
            reply.push_str(&line);

            if line.len() >= 4 && &line[3..4] == " " {
                break;
            }
        }

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    async fn fake_exchanger(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        writer.write_all(b"220 mx.example.net ESMTP\r\n").await.unwrap();

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                return;
            }
            let reply: &[u8] = if line.starts_with("EHLO") {
                b"250-mx.example.net\r\n250 PIPELINING\r\n"
            } else if line.starts_with("MAIL") || line.starts_with("RCPT") {
                b"250 Ok\r\n"
            } else if line.starts_with("DATA") {
                b"354 Go ahead\r\n"
            } else if line.trim_end() == "." {
                b"250 Ok: queued\r\n"
            } else if line.starts_with("QUIT") {
                writer.write_all(b"221 Bye\r\n").await.unwrap();
                return;
            } else {
                continue;
            };
            writer.write_all(reply).await.unwrap();
        }
    }

    #[tokio::test]
    async fn relays_a_message_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(fake_exchanger(listener));

        let client = RelayClient::connect(&["127.0.0.1".to_string()], &[port])
            .await
            .unwrap();
        client
            .send(
                "sender@example.org",
                "user@example.net",
                "Subject: hi\r\n\r\nhello\r\n",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unreachable_hosts_fall_through() {
        // Bind-then-drop leaves the port closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = listener.local_addr().unwrap().port();
        drop(listener);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_port = listener.local_addr().unwrap().port();
        tokio::spawn(fake_exchanger(listener));

        let client = RelayClient::connect(&["127.0.0.1".to_string()], &[dead_port, live_port])
            .await
            .unwrap();
        assert!(client.peer.ends_with(&live_port.to_string()));
    }
}
