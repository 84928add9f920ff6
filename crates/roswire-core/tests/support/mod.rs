// A small behavioral mock router: accepts connections, answers the login
// handshake, and serves a canned command vocabulary. Where the proto-level
// tests script each byte by hand, these tests want a device that just
// works, so registry and supervisor behavior can be exercised end to end.

#![allow(dead_code)] // not every test file uses every knob

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Buf, BytesMut};
use secrecy::SecretString;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use roswire_proto::{auth, codec};

/// Fixed login challenge the mock hands out.
pub const CHALLENGE: &str = "00112233445566778899aabbccddeeff";

#[derive(Clone)]
pub struct MockOptions {
    pub version: String,
    pub password: String,
    /// Answer plain logins with a `!trap` carrying a challenge, the way
    /// firmware that predates plain login behaves.
    pub require_challenge: bool,
    /// Reject every login outright.
    pub reject_logins: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            version: "7.14.2".to_string(),
            password: "hunter2".to_string(),
            require_challenge: false,
            reject_logins: false,
        }
    }
}

impl MockOptions {
    pub fn legacy() -> Self {
        Self {
            version: "6.49.10".to_string(),
            require_challenge: true,
            ..Self::default()
        }
    }
}

/// A running mock device.
pub struct MockRouter {
    port: u16,
    accepted: Arc<AtomicUsize>,
    stop: CancellationToken,
    conn_kill: Arc<Mutex<CancellationToken>>,
}

impl MockRouter {
    pub async fn spawn(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let stop = CancellationToken::new();
        let conn_kill = Arc::new(Mutex::new(CancellationToken::new()));

        {
            let accepted = Arc::clone(&accepted);
            let stop = stop.clone();
            let conn_kill = Arc::clone(&conn_kill);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        incoming = listener.accept() => {
                            let Ok((stream, _)) = incoming else { break };
                            accepted.fetch_add(1, Ordering::SeqCst);
                            let kill = conn_kill.lock().await.clone();
                            tokio::spawn(serve(stream, options.clone(), kill));
                        }
                    }
                }
            });
        }

        Self { port, accepted, stop, conn_kill }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// How many connections the device has accepted so far.
    pub fn connections_accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Drop every established connection; new ones are still accepted.
    pub async fn kill_connections(&self) {
        let mut current = self.conn_kill.lock().await;
        let old = std::mem::replace(&mut *current, CancellationToken::new());
        old.cancel();
    }
}

impl Drop for MockRouter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

// ── Per-connection protocol handling ─────────────────────────────────

async fn serve(mut stream: TcpStream, options: MockOptions, kill: CancellationToken) {
    let mut buf = BytesMut::new();

    loop {
        let words = loop {
            match codec::decode_sentence(&buf, codec::DEFAULT_MAX_SENTENCE) {
                Ok(Some((words, consumed))) => {
                    buf.advance(consumed);
                    if words.is_empty() {
                        continue;
                    }
                    break words;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = kill.cancelled() => return,
                        read = stream.read_buf(&mut buf) => match read {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                    }
                }
                Err(_) => return,
            }
        };

        if !handle(&mut stream, &options, &words).await {
            return;
        }
    }
}

async fn handle(stream: &mut TcpStream, options: &MockOptions, words: &[String]) -> bool {
    let path = words.first().map(String::as_str).unwrap_or("");
    let tag = tag_of(words);

    match path {
        "/login" => handle_login(stream, options, words, &tag).await,

        "/system/resource/print" => {
            re(stream, &tag, &[
                ("uptime", "2w3d4h"),
                ("version", &options.version),
                ("cpu-load", "4"),
                ("free-memory", "182000000"),
                ("board-name", "RB5009"),
            ])
            .await;
            done(stream, &tag, &[]).await;
        }

        "/system/identity/print" => {
            re(stream, &tag, &[("name", "mock-router")]).await;
            done(stream, &tag, &[]).await;
        }

        "/interface/print" => {
            re(stream, &tag, &[(".id", "*1"), ("name", "ether1"), ("running", "true")]).await;
            re(stream, &tag, &[(".id", "*2"), ("name", "wlan1"), ("running", "false")]).await;
            done(stream, &tag, &[]).await;
        }

        "/container/print" => {
            re(stream, &tag, &[(".id", "*1"), ("name", "pihole"), ("status", "running")]).await;
            done(stream, &tag, &[]).await;
        }

        "/ip/address/add" => {
            done(stream, &tag, &[("ret", "*A")]).await;
        }

        "/log/print" if param_of(words, "follow").is_some() => {
            // emit a couple of rows, then leave the exchange open until
            // the client cancels or the connection drops
            re(stream, &tag, &[("time", "12:00:01"), ("message", "link up")]).await;
            re(stream, &tag, &[("time", "12:00:02"), ("message", "dhcp assigned")]).await;
        }

        "/log/print" => {
            re(stream, &tag, &[("time", "11:59:58"), ("message", "first")]).await;
            re(stream, &tag, &[("time", "11:59:59"), ("message", "second")]).await;
            re(stream, &tag, &[("time", "12:00:00"), ("message", "third")]).await;
            done(stream, &tag, &[]).await;
        }

        "/cancel" => {
            if let Some(target) = param_of(words, "tag") {
                let target = target.to_string();
                trap(stream, &target, "interrupted", &[("category", "2")]).await;
                done(stream, &target, &[]).await;
            }
            done(stream, &tag, &[]).await;
        }

        "/system/script/run" => {
            if param_of(words, "number") == Some("missing") {
                trap(stream, &tag, "no such item", &[]).await;
            } else {
                done(stream, &tag, &[]).await;
            }
        }

        _ => {
            trap(stream, &tag, "no such command", &[]).await;
        }
    }
    true
}

async fn handle_login(stream: &mut TcpStream, options: &MockOptions, words: &[String], tag: &str) {
    if options.reject_logins {
        trap(stream, tag, "invalid user name or password", &[]).await;
        return;
    }

    if let Some(response) = param_of(words, "response") {
        let secret = SecretString::from(options.password.clone());
        let expected = format!("00{}", auth::challenge_response(&secret, CHALLENGE).unwrap());
        if response == expected {
            done(stream, tag, &[]).await;
        } else {
            trap(stream, tag, "invalid user name or password", &[]).await;
        }
    } else if let Some(password) = param_of(words, "password") {
        if options.require_challenge {
            trap(stream, tag, "invalid user name or password", &[("ret", CHALLENGE)]).await;
        } else if password == options.password {
            done(stream, tag, &[]).await;
        } else {
            trap(stream, tag, "invalid user name or password", &[]).await;
        }
    } else {
        // name-only login: issue the challenge
        done(stream, tag, &[("ret", CHALLENGE)]).await;
    }
}

// ── Reply writers ────────────────────────────────────────────────────

async fn write_sentence(stream: &mut TcpStream, words: &[String]) {
    let mut frame = BytesMut::new();
    codec::encode_sentence(words, &mut frame);
    let _ = stream.write_all(&frame).await;
}

async fn re(stream: &mut TcpStream, tag: &str, attrs: &[(&str, &str)]) {
    let mut words = vec!["!re".to_string()];
    words.extend(attrs.iter().map(|(k, v)| format!("={k}={v}")));
    words.push(format!(".tag={tag}"));
    write_sentence(stream, &words).await;
}

async fn done(stream: &mut TcpStream, tag: &str, attrs: &[(&str, &str)]) {
    let mut words = vec!["!done".to_string()];
    words.extend(attrs.iter().map(|(k, v)| format!("={k}={v}")));
    words.push(format!(".tag={tag}"));
    write_sentence(stream, &words).await;
}

async fn trap(stream: &mut TcpStream, tag: &str, message: &str, attrs: &[(&str, &str)]) {
    let mut words = vec!["!trap".to_string(), format!("=message={message}")];
    words.extend(attrs.iter().map(|(k, v)| format!("={k}={v}")));
    words.push(format!(".tag={tag}"));
    write_sentence(stream, &words).await;
}

// ── Request inspection ───────────────────────────────────────────────

fn tag_of(words: &[String]) -> String {
    words
        .iter()
        .find_map(|w| w.strip_prefix(".tag="))
        .unwrap_or("0")
        .to_string()
}

fn param_of<'a>(words: &'a [String], key: &str) -> Option<&'a str> {
    let prefix = format!("={key}=");
    words.iter().find_map(|w| w.strip_prefix(prefix.as_str()))
}
