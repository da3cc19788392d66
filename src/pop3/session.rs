use crate::error::Result;
use crate::pop3::commands::Pop3Command;
use crate::pop3::server::Pop3ServerState;
use crate::storage::{list_mailbox, mailbox_stats, StoredMessage};
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pop3State {
    /// Connected, not yet authenticated.
    Unauthorized,
    /// Authenticated; mailbox snapshot loaded.
    Transaction,
    /// QUIT received from Transaction. Deletions would be applied here if
    /// DELE did anything.
    Update,
}

/// One POP3 retrieval session. The mailbox is snapshotted at PASS time;
/// ordinals are stable for the life of the session.
pub struct Pop3Session {
    ctx: Arc<Pop3ServerState>,
    id: u64,
    state: Pop3State,
    username: Option<String>,
    messages: Vec<StoredMessage>,
}

impl Pop3Session {
    pub fn new(ctx: Arc<Pop3ServerState>, id: u64) -> Self {
        Self {
            ctx,
            id,
            state: Pop3State::Unauthorized,
            username: None,
            messages: Vec::new(),
        }
    }

    pub async fn handle(mut self, stream: TcpStream) -> Result<()> {
        let mut reader = BufReader::new(stream);

        let occupancy = self.ctx.max_clients - self.ctx.gate.available_permits();
        let greeting = format!(
            "+OK {} mta-rs POP3 #{} ({}) {}",
            self.ctx.domain,
            self.id,
            occupancy,
            Utc::now().to_rfc2822()
        );
        say(&mut reader, &greeting).await?;

        let mut line = String::new();
        loop {
            line.clear();

            let n = match timeout(self.ctx.max_idle, reader.read_line(&mut line)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!("POP3 session #{} read error: {}", self.id, e);
                    let _ = reader.write_all(b"Connection error, sorry\r\n").await;
                    break;
                }
                Err(_) => {
                    info!("POP3 session #{} idle too long", self.id);
                    let _ = reader.write_all(b"Idle timeout, bye bye\r\n").await;
                    break;
                }
            };
            if n == 0 {
                debug!("POP3 session #{} client disconnected", self.id);
                break;
            }

            debug!("POP3 session #{} <- {}", self.id, line.trim_end());

            let cmd = Pop3Command::parse(&line);
            if self.dispatch(cmd, &mut reader).await? {
                break;
            }
        }

        debug!("POP3 session #{} closed", self.id);
        Ok(())
    }

    /// Handle one command; returns true when the session should end.
    async fn dispatch<W>(&mut self, cmd: Pop3Command, w: &mut W) -> Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        match (self.state, cmd) {
            // QUIT gets no farewell; the connection just closes.
            (Pop3State::Unauthorized, Pop3Command::Quit) => return Ok(true),
            (Pop3State::Transaction, Pop3Command::Quit) => {
                self.state = Pop3State::Update;
                return Ok(true);
            }

            (_, Pop3Command::Capa) => {
                say(w, "+OK Capability list follows\r\nTOP\r\nUIDL\r\n.").await?
            }

            (Pop3State::Unauthorized, Pop3Command::User(arg)) => {
                let Some(name) = arg else {
                    say(w, "-ERR missing username").await?;
                    return Ok(false);
                };
                // A directory lookup failure must not lock users out; the
                // password check still gates access.
                let known = self.ctx.store.mailbox_exists(&name).await.unwrap_or_else(|e| {
                    warn!("Mailbox lookup for {} failed: {}", name, e);
                    true
                });
                if known {
                    say(w, &format!("+OK {} is a valid mailbox", name)).await?;
                    self.username = Some(name);
                } else {
                    say(w, &format!("-ERR never heard of mailbox name {}", name)).await?;
                }
            }

            (Pop3State::Unauthorized, Pop3Command::Pass(arg)) => {
                let (Some(name), Some(secret)) = (self.username.clone(), arg) else {
                    say(w, "-ERR invalid password").await?;
                    return Ok(false);
                };
                match self.ctx.store.authenticate(&name, &secret).await {
                    Ok(true) => {
                        self.messages = self.ctx.store.fetch_all(&name).await.unwrap_or_default();
                        self.state = Pop3State::Transaction;
                        info!(
                            "POP3 session #{} opened mailbox {} ({} messages)",
                            self.id,
                            name,
                            self.messages.len()
                        );
                        say(w, "+OK mailbox ready").await?;
                    }
                    Ok(false) => say(w, "-ERR invalid password").await?,
                    Err(e) => {
                        warn!("Authentication for {} failed: {}", name, e);
                        say(w, "-ERR invalid password").await?;
                    }
                }
            }

            (Pop3State::Transaction, Pop3Command::Stat) => {
                let (count, size) = mailbox_stats(&self.messages);
                say(w, &format!("+OK {} {}", count, size)).await?;
            }

            (Pop3State::Transaction, Pop3Command::List) => {
                let mut lines = vec![self.summary_line()];
                for head in list_mailbox(&self.messages) {
                    lines.push(format!("{} {}", head.ordinal, head.size));
                }
                lines.push(".".to_string());
                say(w, &lines.join("\r\n")).await?;
            }

            (Pop3State::Transaction, Pop3Command::Uidl) => {
                let mut lines = vec![self.summary_line()];
                for head in list_mailbox(&self.messages) {
                    lines.push(format!("{} {}", head.ordinal, head.uid));
                }
                lines.push(".".to_string());
                say(w, &lines.join("\r\n")).await?;
            }

            (Pop3State::Transaction, Pop3Command::Retr(arg)) => {
                let Some(msg) = self.lookup(arg) else {
                    say(w, "-ERR no such message").await?;
                    return Ok(false);
                };
                let reply = format!("+OK {} octets\r\n{}\r\n.", msg.octet_size(), msg.body);
                say(w, &reply).await?;
            }

            (Pop3State::Transaction, Pop3Command::Dele(arg)) => {
                if self.lookup(arg).is_none() {
                    say(w, "-ERR no such message").await?;
                } else {
                    // Accepted but never applied; messages stay retrievable.
                    say(w, "+OK message deleted").await?;
                }
            }

            (Pop3State::Transaction, Pop3Command::Top(arg)) => {
                let Some(msg) = self.lookup(arg) else {
                    say(w, "-ERR no such message").await?;
                    return Ok(false);
                };
                let headers = header_json(msg);
                let reply = format!("+OK top of message follows\r\n{}\r\n\r\n.", headers);
                say(w, &reply).await?;
            }

            (_, other) => {
                debug!("POP3 session #{} rejected {:?}", self.id, other);
                say(w, "-ERR not implemented").await?;
            }
        }

        Ok(false)
    }

    fn summary_line(&self) -> String {
        let (count, size) = mailbox_stats(&self.messages);
        format!("+OK {} messages ({} octets)", count, size)
    }

    /// Resolve a 1-based ordinal argument against the session snapshot.
    fn lookup(&self, arg: Option<String>) -> Option<&StoredMessage> {
        let ordinal: usize = arg?.parse().ok()?;
        if ordinal == 0 {
            return None;
        }
        self.messages.get(ordinal - 1)
    }
}

/// Headers as a JSON object, name to list of values, preserving duplicates.
fn header_json(msg: &StoredMessage) -> String {
    let mut map = Map::new();
    for (name, value) in &msg.headers {
        match map.entry(name.clone()).or_insert_with(|| Value::Array(Vec::new())) {
            Value::Array(values) => values.push(Value::String(value.clone())),
            _ => {}
        }
    }
    Value::Object(map).to_string()
}

async fn say<W>(writer: &mut W, reply: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug!("-> {}", reply);
    writer.write_all(format!("{}\r\n", reply).as_bytes()).await?;
    Ok(())
}
