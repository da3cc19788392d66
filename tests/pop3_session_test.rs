mod common;

use common::{start_pop3, Client};
use mta_rs::storage::{IncomingMessage, MailStore, MemoryStore};
use std::sync::Arc;

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.add_user("u@example.com", "secret");
    store
}

async fn deliver(store: &MemoryStore, to: &str, data: &str) -> String {
    store
        .write(&IncomingMessage {
            helo: "client.example.org".to_string(),
            from: "sender@example.org".to_string(),
            to: vec![to.to_string()],
            data: data.to_string(),
            host: "10.0.0.1".to_string(),
            domain: "example.com".to_string(),
        })
        .await
        .unwrap()
}

/// Connect and log in as the seeded user, consuming the greeting.
async fn login(addr: std::net::SocketAddr) -> Client {
    let mut client = Client::connect(addr).await;
    let greeting = client.line().await;
    assert!(greeting.starts_with("+OK example.com mta-rs POP3 #"), "{}", greeting);

    assert_eq!(
        client.cmd("USER u@example.com").await,
        "+OK u@example.com is a valid mailbox"
    );
    assert_eq!(client.cmd("PASS secret").await, "+OK mailbox ready");
    client
}

#[tokio::test]
async fn rejects_unknown_mailbox_and_bad_password() {
    let store = seeded_store().await;
    let (addr, _server) = start_pop3(store).await;

    let mut client = Client::connect(addr).await;
    client.line().await;

    assert_eq!(
        client.cmd("USER nobody@example.com").await,
        "-ERR never heard of mailbox name nobody@example.com"
    );
    assert_eq!(
        client.cmd("USER u@example.com").await,
        "+OK u@example.com is a valid mailbox"
    );
    assert_eq!(client.cmd("PASS wrong").await, "-ERR invalid password");
}

#[tokio::test]
async fn transaction_commands_require_authentication() {
    let store = seeded_store().await;
    let (addr, _server) = start_pop3(store).await;

    let mut client = Client::connect(addr).await;
    client.line().await;

    assert_eq!(client.cmd("STAT").await, "-ERR not implemented");
    assert_eq!(client.cmd("RETR 1").await, "-ERR not implemented");
}

#[tokio::test]
async fn stat_reports_scaled_octet_totals() {
    let store = seeded_store().await;
    // One 10-char header value and a 100-char body: (10 + 100) * 8 = 880.
    deliver(
        &store,
        "u@example.com",
        &format!("Subject: abcdefghij\r\n\r\n{}", "x".repeat(100)),
    )
    .await;
    let (addr, _server) = start_pop3(store).await;

    let mut client = login(addr).await;
    assert_eq!(client.cmd("STAT").await, "+OK 1 880");
}

#[tokio::test]
async fn list_and_uidl_enumerate_newest_first() {
    let store = seeded_store().await;
    let first = deliver(&store, "u@example.com", "Subject: one\r\n\r\nfirst").await;
    let second = deliver(&store, "u@example.com", "Subject: two\r\n\r\nsecond").await;
    let (addr, _server) = start_pop3(store).await;

    let mut client = login(addr).await;

    client.send("LIST").await;
    let list = client.pop3_reply().await;
    assert!(list[0].starts_with("+OK 2 messages ("), "{}", list[0]);
    assert!(list[1].starts_with("1 "));
    assert!(list[2].starts_with("2 "));
    assert_eq!(list[3], ".");

    client.send("UIDL").await;
    let uidl = client.pop3_reply().await;
    // Ordinal 1 is the most recently delivered message.
    assert_eq!(uidl[1], format!("1 {}", second));
    assert_eq!(uidl[2], format!("2 {}", first));
}

#[tokio::test]
async fn retr_returns_the_body() {
    let store = seeded_store().await;
    deliver(&store, "u@example.com", "Subject: hello\r\n\r\nline one\nline two").await;
    let (addr, _server) = start_pop3(store).await;

    let mut client = login(addr).await;

    client.send("RETR 1").await;
    let reply = client.pop3_reply().await;
    assert!(reply[0].starts_with("+OK "), "{}", reply[0]);
    assert!(reply[0].ends_with(" octets"));
    assert_eq!(reply[1], "line one");
    assert_eq!(reply[2], "line two");
    assert_eq!(reply.last().unwrap(), ".");

    assert_eq!(client.cmd("RETR 9").await, "-ERR no such message");
    assert_eq!(client.cmd("RETR 0").await, "-ERR no such message");
}

#[tokio::test]
async fn top_returns_headers_as_json() {
    let store = seeded_store().await;
    deliver(&store, "u@example.com", "Subject: hello\r\nX-Tag: a\r\n\r\nbody").await;
    let (addr, _server) = start_pop3(store).await;

    let mut client = login(addr).await;

    client.send("TOP 1").await;
    let reply = client.pop3_reply().await;
    assert_eq!(reply[0], "+OK top of message follows");
    let json: serde_json::Value = serde_json::from_str(&reply[1]).unwrap();
    assert_eq!(json["Subject"][0], "hello");
    assert_eq!(json["X-Tag"][0], "a");
    assert_eq!(reply.last().unwrap(), ".");

    assert_eq!(client.cmd("TOP").await, "-ERR no such message");
}

#[tokio::test]
async fn dele_is_accepted_but_never_applied() {
    let store = seeded_store().await;
    deliver(&store, "u@example.com", "Subject: keep\r\n\r\nbody").await;
    let (addr, _server) = start_pop3(store).await;

    let mut client = login(addr).await;
    assert_eq!(client.cmd("DELE 1").await, "+OK message deleted");
    assert_eq!(client.cmd("DELE 2").await, "-ERR no such message");

    // Still there.
    let stat = client.cmd("STAT").await;
    assert!(stat.starts_with("+OK 1 "), "{}", stat);
}

#[tokio::test]
async fn capa_lists_optional_features() {
    let store = seeded_store().await;
    let (addr, _server) = start_pop3(store).await;

    let mut client = Client::connect(addr).await;
    client.line().await;

    client.send("CAPA").await;
    let reply = client.pop3_reply().await;
    assert_eq!(reply, vec!["+OK Capability list follows", "TOP", "UIDL", "."]);
}

#[tokio::test]
async fn quit_closes_without_a_farewell() {
    let store = seeded_store().await;
    let (addr, _server) = start_pop3(store).await;

    let mut client = login(addr).await;
    client.send("QUIT").await;
    assert_eq!(client.line().await, "");
}
