use crate::delivery::{DeliveryJob, DeliveryNotice, DeliveryStatus};
use crate::error::Result;
use crate::smtp::commands::{parse_esmtp_args, parse_hello_argument, SmtpCommand, FROM_RE};
use crate::smtp::server::SmtpServerState;
use crate::utils::email::parse_email_address;
use chrono::Utc;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tracing::{debug, info, warn};

/// Unrecognized or empty commands tolerated before the session is cut off.
const MAX_UNRECOGNIZED: usize = 3;

/// How long a session waits on the delivery pipeline before giving up and
/// reporting a transaction failure.
const DELIVERY_WAIT: Duration = Duration::from_secs(60);

/// Unified stream type for plain and TLS connections, so a session can be
/// upgraded by STARTTLS without changing its read/write paths.
enum MailStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
    /// Transient placeholder while STARTTLS swaps the transport; never
    /// observable by I/O.
    Upgrading,
}

impl AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MailStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            MailStream::Upgrading => panic!("I/O on stream during STARTTLS upgrade"),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MailStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MailStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            MailStream::Upgrading => panic!("I/O on stream during STARTTLS upgrade"),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MailStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            MailStream::Upgrading => panic!("I/O on stream during STARTTLS upgrade"),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MailStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            MailStream::Upgrading => panic!("I/O on stream during STARTTLS upgrade"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SmtpState {
    /// Connected, no valid HELO/EHLO yet.
    Greeting,
    /// Introduced, waiting for MAIL.
    Ready,
    /// Envelope open, collecting recipients.
    Sending,
    /// Between DATA's go-ahead and the terminator line.
    InData,
    /// Terminal; set on QUIT or forced termination.
    Closing,
}

enum LoopAction {
    /// Restart command processing on the (possibly upgraded) stream.
    Continue,
    Quit,
}

/// One SMTP submission session.
pub struct SmtpSession {
    ctx: Arc<SmtpServerState>,
    id: u64,
    remote_host: String,
    state: SmtpState,
    helo: Option<String>,
    from: Option<String>,
    recipients: Vec<String>,
    unrecognized: usize,
    tls_on: bool,
    kill: bool,
}

impl SmtpSession {
    pub fn new(ctx: Arc<SmtpServerState>, id: u64, remote_host: String) -> Self {
        Self {
            ctx,
            id,
            remote_host,
            state: SmtpState::Greeting,
            helo: None,
            from: None,
            recipients: Vec::new(),
            unrecognized: 0,
            tls_on: false,
            kill: false,
        }
    }

    /// Drive the whole session: banner, command loop, possible STARTTLS
    /// restarts, until the client quits or is cut off.
    pub async fn handle(mut self, stream: TcpStream) -> Result<()> {
        let mut stream = MailStream::Plain(stream);

        let occupancy = self.ctx.max_clients - self.ctx.gate.available_permits();
        let banner = format!(
            "220 {} mta-rs SMTP #{} ({}) {}\r\n",
            self.ctx.domain,
            self.id,
            occupancy,
            Utc::now().to_rfc2822()
        );
        stream.write_all(banner.as_bytes()).await?;

        loop {
            match self.serve(&mut stream).await? {
                LoopAction::Continue => continue,
                LoopAction::Quit => break,
            }
        }

        debug!("SMTP session #{} closed", self.id);
        Ok(())
    }

    /// Command loop over the current transport. Returns `Continue` after a
    /// STARTTLS attempt so the caller restarts with a fresh reader.
    async fn serve(&mut self, stream: &mut MailStream) -> Result<LoopAction> {
        // Reborrow so the reader can be dropped for STARTTLS.
        let mut reader = BufReader::new(&mut *stream);
        let mut line = String::new();

        loop {
            line.clear();

            let n = match timeout(self.ctx.max_idle, reader.read_line(&mut line)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!("SMTP session #{} read error: {}", self.id, e);
                    let _ = reader.write_all(b"221 Connection error, sorry\r\n").await;
                    return Ok(LoopAction::Quit);
                }
                Err(_) => {
                    info!("SMTP session #{} idle too long", self.id);
                    let _ = reader.write_all(b"221 Idle timeout, bye bye\r\n").await;
                    return Ok(LoopAction::Quit);
                }
            };
            if n == 0 {
                debug!("SMTP session #{} client disconnected", self.id);
                return Ok(LoopAction::Quit);
            }

            debug!("SMTP session #{} <- {}", self.id, line.trim_end());

            let Some(cmd) = SmtpCommand::parse(&line) else {
                // Too mangled to answer.
                continue;
            };

            if matches!(cmd, SmtpCommand::StartTls) {
                drop(reader);
                self.upgrade_tls(stream).await?;
                return Ok(LoopAction::Continue);
            }

            let reply = self.dispatch(cmd);
            say(&mut reader, &reply).await?;

            if self.state == SmtpState::InData {
                match self.read_body(&mut reader).await? {
                    Some(data) => self.finish_message(data, &mut reader).await?,
                    None => return Ok(LoopAction::Quit),
                }
            }

            if self.unrecognized >= MAX_UNRECOGNIZED {
                say(&mut reader, "500 Too many unrecognized commands").await?;
                return Ok(LoopAction::Quit);
            }
            if self.kill {
                return Ok(LoopAction::Quit);
            }
        }
    }

    /// Map one command (in the current state) to its reply. Recognized
    /// commands clear the unrecognized-command counter; the rest feed it.
    fn dispatch(&mut self, cmd: SmtpCommand) -> String {
        match cmd {
            SmtpCommand::Empty => {
                self.unrecognized += 1;
                "500 Speak up".to_string()
            }
            SmtpCommand::Unknown(verb) => {
                self.unrecognized += 1;
                format!("500 Syntax error, {} command unrecognized", verb)
            }
            recognized => {
                self.unrecognized = 0;
                self.dispatch_recognized(recognized)
            }
        }
    }

    fn dispatch_recognized(&mut self, cmd: SmtpCommand) -> String {
        match cmd {
            SmtpCommand::Helo(arg) => self.hello(&arg, false),
            SmtpCommand::Ehlo(arg) => self.hello(&arg, true),
            SmtpCommand::Mail(arg) => self.mail(&arg),
            SmtpCommand::Rcpt(arg) => self.rcpt(&arg),
            SmtpCommand::Data(arg) => self.data(&arg),
            SmtpCommand::Auth(arg) => self.auth(&arg),
            SmtpCommand::Rset => {
                self.reset();
                "250 Session reset".to_string()
            }
            SmtpCommand::Vrfy => "252 Cannot VRFY user, but will accept message".to_string(),
            SmtpCommand::Noop => "250 I have successfully done nothing".to_string(),
            SmtpCommand::Quit => {
                self.state = SmtpState::Closing;
                self.kill = true;
                "221 Goodnight and good luck".to_string()
            }
            SmtpCommand::NotImplemented(verb) => {
                format!("502 {} command not implemented", verb)
            }
            // Handled before dispatch.
            SmtpCommand::StartTls => "503 Command is out of sequence".to_string(),
            SmtpCommand::Empty | SmtpCommand::Unknown(_) => unreachable!(),
        }
    }

    fn hello(&mut self, arg: &str, extended: bool) -> String {
        let Some(client_domain) = parse_hello_argument(arg) else {
            return "501 Domain name required".to_string();
        };

        info!(
            "SMTP session #{} introduced as {} ({})",
            self.id,
            client_domain,
            if extended { "EHLO" } else { "HELO" }
        );
        self.helo = Some(client_domain.clone());
        self.state = SmtpState::Ready;

        if !extended {
            return format!("250 {} Hello", self.ctx.domain);
        }

        let mut lines = vec![
            format!(
                "250-{} Hello {} [{}]",
                self.ctx.domain, client_domain, self.remote_host
            ),
            "250-PIPELINING".to_string(),
            "250-8BITMIME".to_string(),
        ];
        if self.ctx.tls.is_some() && !self.tls_on {
            lines.push("250-STARTTLS".to_string());
        }
        lines.push("250-AUTH EXTERNAL CRAM-MD5 LOGIN PLAIN".to_string());
        lines.push(format!("250 SIZE {}", self.ctx.max_message_bytes));
        lines.join("\r\n")
    }

    fn mail(&mut self, arg: &str) -> String {
        match self.state {
            SmtpState::Greeting => return "502 Please introduce yourself first".to_string(),
            SmtpState::Sending | SmtpState::InData | SmtpState::Closing => {
                return "503 Command MAIL is out of sequence".to_string()
            }
            SmtpState::Ready => {}
        }

        let Some(caps) = FROM_RE.captures(arg) else {
            return "501 Bad sender address syntax".to_string();
        };
        if parse_email_address(&caps[1]).is_err() {
            return "501 Bad sender address syntax".to_string();
        }

        if let Some(params) = caps.get(2).and_then(|m| parse_esmtp_args(m.as_str())) {
            if let Some(size) = params.get("SIZE") {
                match size.parse::<usize>() {
                    Ok(declared) if declared > self.ctx.max_message_bytes => {
                        return format!(
                            "552 Message size exceeds maximum of {} bytes",
                            self.ctx.max_message_bytes
                        );
                    }
                    Ok(_) => {}
                    Err(_) => return "501 Unable to parse SIZE argument".to_string(),
                }
            }
        }

        let from = caps[1].to_string();
        info!("SMTP session #{} mail from <{}>", self.id, from);
        self.state = SmtpState::Sending;
        let reply = format!("250 Roger, accepting mail from <{}>", from);
        self.from = Some(from);
        reply
    }

    fn rcpt(&mut self, arg: &str) -> String {
        match self.state {
            SmtpState::Sending => {}
            _ => return "502 Missing MAIL FROM command".to_string(),
        }

        if arg.len() < 3 || !arg[..3].eq_ignore_ascii_case("TO:") {
            return "501 Syntax error in parameters or arguments".to_string();
        }
        let recipient = arg[3..].trim_matches(['<', '>', ' ']).to_string();
        if parse_email_address(&recipient).is_err() {
            return "501 Bad recipient address syntax".to_string();
        }

        if self.recipients.len() >= self.ctx.max_recipients {
            return format!(
                "552 Maximum limit of {} recipients reached",
                self.ctx.max_recipients
            );
        }

        let reply = format!("250 I'll make sure <{}> gets this", recipient);
        self.recipients.push(recipient);
        reply
    }

    fn data(&mut self, arg: &str) -> String {
        if !arg.is_empty() {
            return "501 Syntax error in parameters or arguments".to_string();
        }
        match self.state {
            SmtpState::Greeting => return "502 Please introduce yourself first".to_string(),
            SmtpState::Ready => return "502 Missing MAIL FROM command".to_string(),
            SmtpState::Sending if self.recipients.is_empty() => {
                return "502 Missing RCPT TO command.".to_string()
            }
            SmtpState::Sending => {}
            SmtpState::InData | SmtpState::Closing => {
                return "503 Command DATA is out of sequence".to_string()
            }
        }

        self.state = SmtpState::InData;
        "354 Go ahead, end your data with <CR><LF>.<CR><LF>".to_string()
    }

    /// AUTH is a compatibility facade: mechanisms are acknowledged so clients
    /// that insist on authenticating can proceed, but no credentials are
    /// checked.
    fn auth(&mut self, arg: &str) -> String {
        if self.helo.is_none() {
            return "502 Please introduce yourself first".to_string();
        }
        let mechanism = arg.split(' ').next().unwrap_or("");
        if mechanism.is_empty() {
            return "502 Missing parameter".to_string();
        }

        match mechanism.to_uppercase().as_str() {
            "LOGIN" => "334 VXNlcm5hbWU6".to_string(),
            "CRAM-MD5" => {
                "334 PDQxOTI5NDIzNDEuMTI4Mjg0NzJAc291cmNlZm91ci5hbmRyZXcuY211LmVkdT4=".to_string()
            }
            "PLAIN" | "EXTERNAL" => "235 Authentication successful".to_string(),
            other => {
                warn!("SMTP session #{} asked for AUTH {}", self.id, other);
                "504 Unsupported authentication mechanism".to_string()
            }
        }
    }

    /// Collect message text until the CRLF.CRLF terminator. Returns `None`
    /// when the client vanished mid-transfer.
    async fn read_body(
        &mut self,
        reader: &mut BufReader<&mut MailStream>,
    ) -> Result<Option<String>> {
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let n = match timeout(self.ctx.max_idle, reader.read_until(b'\n', &mut buffer)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!("SMTP session #{} read error in DATA: {}", self.id, e);
                    let _ = reader.write_all(b"221 Connection error, sorry\r\n").await;
                    return Ok(None);
                }
                Err(_) => {
                    info!("SMTP session #{} idle too long in DATA", self.id);
                    let _ = reader.write_all(b"221 Idle timeout, bye bye\r\n").await;
                    return Ok(None);
                }
            };
            if n == 0 {
                debug!("SMTP session #{} disconnected in DATA", self.id);
                return Ok(None);
            }

            if buffer.len() > self.ctx.max_message_bytes {
                warn!(
                    "SMTP session #{} message over {} bytes, dropped",
                    self.id, self.ctx.max_message_bytes
                );
                say(reader, "552 Maximum message size exceeded").await?;
                self.reset();
                return Ok(Some(String::new()));
            }

            if let Some(data) = strip_terminator(&buffer) {
                return Ok(Some(String::from_utf8_lossy(data).into_owned()));
            }
        }
    }

    /// Route an accepted message: spam reporting, the delivery pipeline, or
    /// a bare acceptance notice, then reset for the next envelope.
    async fn finish_message(
        &mut self,
        data: String,
        reader: &mut BufReader<&mut MailStream>,
    ) -> Result<()> {
        // Oversized transfers already replied and reset.
        if self.state != SmtpState::InData {
            return Ok(());
        }

        let from = self.from.clone().unwrap_or_default();

        if let Some(re) = &self.ctx.spam_re {
            if re.is_match(&data) {
                warn!(
                    "SMTP session #{} spam from <{}> at {}",
                    self.id, from, self.remote_host
                );
                say(reader, "250 Ok").await?;

                let store = self.ctx.store.clone();
                let host = self.remote_host.clone();
                tokio::spawn(async move {
                    if let Err(e) = store.save_abuse_report(&host, &from).await {
                        warn!("Cannot record abuse report: {}", e);
                    }
                });

                self.reset();
                self.state = SmtpState::Closing;
                self.kill = true;
                return Ok(());
            }
        }

        if !self.ctx.store_messages {
            info!("SMTP session #{} accepted mail, storage disabled", self.id);
            let _ = self
                .ctx
                .notices
                .send(DeliveryNotice::Received(Utc::now().timestamp()));
            say(reader, "250 Mail accepted").await?;
            self.reset();
            return Ok(());
        }

        let (done_tx, done_rx) = oneshot::channel();
        let job = DeliveryJob {
            helo: self.helo.clone().unwrap_or_default(),
            from,
            to: self.recipients.clone(),
            data,
            host: self.remote_host.clone(),
            domain: self.ctx.domain.clone(),
            done: done_tx,
        };
        self.ctx.mailer.submit(job).await?;

        let reply = match timeout(DELIVERY_WAIT, done_rx).await {
            Ok(Ok(DeliveryStatus::Stored { id })) => format!("250 Ok: queued as {}", id),
            Ok(Ok(DeliveryStatus::Failed)) | Ok(Err(_)) => {
                "554 Error: transaction failed, blame it on the weather".to_string()
            }
            Err(_) => {
                warn!("SMTP session #{} delivery took too long", self.id);
                "554 Error: transaction failed, blame it on the weather".to_string()
            }
        };
        say(reader, &reply).await?;

        self.reset();
        Ok(())
    }

    /// Upgrade the transport to TLS. A failed handshake restores the plain
    /// stream and keeps the session alive.
    async fn upgrade_tls(&mut self, stream: &mut MailStream) -> Result<()> {
        if self.tls_on {
            stream.write_all(b"502 Already running in TLS\r\n").await?;
            return Ok(());
        }
        let Some(tls) = &self.ctx.tls else {
            stream.write_all(b"502 TLS not supported\r\n").await?;
            return Ok(());
        };
        let acceptor = tls.acceptor();

        stream.write_all(b"220 Ready to start TLS\r\n").await?;
        stream.flush().await?;

        let tcp = match std::mem::replace(stream, MailStream::Upgrading) {
            MailStream::Plain(tcp) => tcp,
            other => {
                // tls_on guards against this.
                *stream = other;
                stream.write_all(b"502 Already running in TLS\r\n").await?;
                return Ok(());
            }
        };

        match acceptor.accept(tcp).into_fallible().await {
            Ok(tls_stream) => {
                info!("SMTP session #{} upgraded to TLS", self.id);
                *stream = MailStream::Tls(tls_stream);
                self.tls_on = true;
                self.reset();
            }
            Err((e, tcp)) => {
                warn!("SMTP session #{} TLS handshake failed: {}", self.id, e);
                *stream = MailStream::Plain(tcp);
                stream.write_all(b"550 Handshake error\r\n").await?;
                self.state = SmtpState::Greeting;
            }
        }
        Ok(())
    }

    /// Back to a clean slate; the client must introduce itself again before
    /// the next envelope.
    fn reset(&mut self) {
        self.state = SmtpState::Greeting;
        self.helo = None;
        self.from = None;
        self.recipients.clear();
    }
}

/// Detect the end-of-data marker and return the message text without it.
/// The whole `CRLF.CRLF` sequence belongs to the marker; leaving the
/// preceding CRLF attached would change the message content.
fn strip_terminator(buffer: &[u8]) -> Option<&[u8]> {
    if buffer == b".\r\n" {
        Some(&[])
    } else if buffer.ends_with(b"\r\n.\r\n") {
        Some(&buffer[..buffer.len() - b"\r\n.\r\n".len()])
    } else {
        None
    }
}

async fn say<W>(writer: &mut W, reply: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug!("-> {}", reply);
    writer.write_all(format!("{}\r\n", reply).as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_terminator_takes_its_leading_crlf() {
        assert_eq!(
            strip_terminator(b"Subject: hi\r\n\r\nHello\r\n.\r\n"),
            Some(&b"Subject: hi\r\n\r\nHello"[..])
        );
    }

    #[test]
    fn empty_message_is_just_the_terminator() {
        assert_eq!(strip_terminator(b".\r\n"), Some(&b""[..]));
    }

    #[test]
    fn dotted_lines_inside_the_body_do_not_terminate() {
        assert_eq!(strip_terminator(b"not done yet\r\n"), None);
        assert_eq!(strip_terminator(b"a\r\n.b\r\n"), None);
    }
}
