#![allow(dead_code)]

use mta_rs::config::Config;
use mta_rs::delivery::{DeliveryNotice, Mailer};
use mta_rs::pop3::Pop3Server;
use mta_rs::smtp::SmtpServer;
use mta_rs::storage::MemoryStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub struct TestSmtp {
    pub addr: SocketAddr,
    pub store: Arc<MemoryStore>,
    pub server: Arc<SmtpServer>,
    pub events: mpsc::UnboundedReceiver<DeliveryNotice>,
}

/// Boot an SMTP server on an ephemeral port with sane test defaults;
/// `mutate` adjusts the config before startup.
pub async fn start_smtp(mutate: impl FnOnce(&mut Config)) -> TestSmtp {
    let mut config = Config::default();
    config.server.domain = "example.com".to_string();
    config.smtp.max_idle_secs = 5;
    config.smtp.spam_regex = String::new();
    mutate(&mut config);

    let store = Arc::new(MemoryStore::new());
    let (notices, events) = mpsc::unbounded_channel();
    let mailer = Mailer::start(store.clone(), config.server.domain.clone(), notices.clone());

    let server = Arc::new(SmtpServer::new(
        &config.server,
        &config.smtp,
        store.clone(),
        mailer,
        notices,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task_server = server.clone();
    tokio::spawn(async move { task_server.serve(listener).await });

    TestSmtp {
        addr,
        store,
        server,
        events,
    }
}

/// Boot a POP3 server over an existing store.
pub async fn start_pop3(store: Arc<MemoryStore>) -> (SocketAddr, Arc<Pop3Server>) {
    let mut config = Config::default();
    config.server.domain = "example.com".to_string();
    config.pop3.max_idle_secs = 5;

    let server = Arc::new(Pop3Server::new(&config.server, &config.pop3, store));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task_server = server.clone();
    tokio::spawn(async move { task_server.serve(listener).await });

    (addr, server)
}

/// Line-oriented test client for both protocols.
pub struct Client {
    stream: BufReader<TcpStream>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Read one reply line, CRLF stripped. Empty string means the server
    /// closed the connection.
    pub async fn line(&mut self) -> String {
        let mut line = String::new();
        self.stream.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    pub async fn send(&mut self, line: &str) {
        self.stream
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    /// Send a command and read its single-line reply.
    pub async fn cmd(&mut self, line: &str) -> String {
        self.send(line).await;
        self.line().await
    }

    /// Read an SMTP multi-line reply; the last line has a space after the
    /// code instead of a dash.
    pub async fn smtp_reply(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.line().await;
            let done = line.len() < 4 || &line[3..4] == " ";
            lines.push(line);
            if done {
                break;
            }
        }
        lines
    }

    /// Read POP3 lines until the lone-dot terminator, inclusive.
    pub async fn pop3_reply(&mut self) -> Vec<String> {
        let mut lines = vec![self.line().await];
        if lines[0].starts_with("-ERR") {
            return lines;
        }
        loop {
            let line = self.line().await;
            let done = line == ".";
            lines.push(line);
            if done {
                break;
            }
        }
        lines
    }

    /// Run a full submission dialogue (greeting must already be consumed)
    /// and return the post-DATA reply.
    pub async fn submit(&mut self, from: &str, recipients: &[&str], body: &str) -> String {
        let helo = self.cmd("HELO client.example.org").await;
        assert!(helo.starts_with("250"), "unexpected HELO reply: {}", helo);

        let mail = self.cmd(&format!("MAIL FROM:<{}>", from)).await;
        assert!(mail.starts_with("250"), "unexpected MAIL reply: {}", mail);

        for recipient in recipients {
            let rcpt = self.cmd(&format!("RCPT TO:<{}>", recipient)).await;
            assert!(rcpt.starts_with("250"), "unexpected RCPT reply: {}", rcpt);
        }

        let data = self.cmd("DATA").await;
        assert!(data.starts_with("354"), "unexpected DATA reply: {}", data);

        self.send(body).await;
        self.cmd(".").await
    }
}
