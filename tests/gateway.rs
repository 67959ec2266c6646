/// End-to-end tests for the gateway: a scripted IRC client talks to a real
/// session over an in-memory stream, with a fake Mastodon backend whose
/// feeds the test drives by hand.
///
/// Run with: `cargo test --test gateway`
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use tootbridge::config::Config;
use tootbridge::gateway::handshake::HandshakeError;
use tootbridge::gateway::outbound::CLOSE_TIMEOUT;
use tootbridge::gateway::server::accept_loop;
use tootbridge::gateway::session::{serve_connection, SessionError, PUMP_GRACE};
use tootbridge::irc::codec::IrcCodec;
use tootbridge::mastodon::{
    Account, AccountClient, Backend, BackendError, Credentials, Feed, Feeder, Status,
    StreamEvent, Subscription,
};

const WAIT: Duration = Duration::from_secs(3);

// ── Fake backend ────────────────────────────────────────────────────

#[derive(Default)]
struct FakeState {
    fail_auth: bool,
    fail_profile: bool,
    /// Feed keys whose subscription is refused.
    fail_feeds: HashSet<String>,
    /// Live feeders by feed key (`user`, `public`, `hashtag:golang`, ...).
    feeders: Mutex<HashMap<String, Feeder>>,
    /// Every stop token ever handed out, by feed key.
    stops: Mutex<HashMap<String, CancellationToken>>,
}

impl FakeState {
    fn sender(&self, key: &str) -> mpsc::Sender<StreamEvent> {
        let feeders = self.feeders.lock().unwrap();
        feeders
            .get(key)
            .unwrap_or_else(|| panic!("no subscription for {key}"))
            .tx
            .clone()
    }

    fn stop(&self, key: &str) -> CancellationToken {
        self.stops.lock().unwrap()[key].clone()
    }

    /// Drop the feeder, as the HTTP side does when its stream ends.
    fn end_feed(&self, key: &str) {
        self.feeders.lock().unwrap().remove(key);
    }

    fn subscriptions(&self) -> usize {
        self.stops.lock().unwrap().len()
    }
}

fn feed_key(feed: Feed, hashtag: Option<&str>) -> String {
    match hashtag {
        Some(tag) => format!("{feed}:{tag}"),
        None => feed.to_string(),
    }
}

#[derive(Clone, Default)]
struct FakeBackend {
    state: Arc<FakeState>,
}

#[async_trait]
impl Backend for FakeBackend {
    async fn authenticate(
        &self,
        _credentials: &Credentials,
    ) -> Result<Arc<dyn AccountClient>, BackendError> {
        if self.state.fail_auth {
            return Err(BackendError::MissingCredential("token"));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl AccountClient for FakeBackend {
    async fn current_account(&self) -> Result<Account, BackendError> {
        if self.state.fail_profile {
            return Err(BackendError::Status {
                endpoint: "/api/v1/accounts/verify_credentials".into(),
                status: reqwest::StatusCode::UNAUTHORIZED,
            });
        }
        Ok(Account {
            id: "1".into(),
            username: "alice".into(),
            acct: "alice".into(),
            display_name: "Alice".into(),
        })
    }

    async fn subscribe(
        &self,
        feed: Feed,
        hashtag: Option<&str>,
    ) -> Result<Subscription, BackendError> {
        let key = feed_key(feed, hashtag);
        if self.state.fail_feeds.contains(&key) {
            return Err(BackendError::Status {
                endpoint: format!("/api/v1/streaming/{feed}"),
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
            });
        }
        let (subscription, feeder) = Subscription::channel();
        self.state.stops.lock().unwrap().insert(key.clone(), feeder.stop.clone());
        self.state.feeders.lock().unwrap().insert(key, feeder);
        Ok(subscription)
    }
}

fn update(display_name: &str, content: &str, cw: &str) -> StreamEvent {
    StreamEvent::Update(Box::new(Status {
        id: "110".into(),
        content: content.into(),
        spoiler_text: cw.into(),
        account: Account {
            username: display_name.to_lowercase(),
            display_name: display_name.into(),
            ..Account::default()
        },
    }))
}

fn config() -> Arc<Config> {
    let env: HashMap<&str, &str> = [
        ("MASTODON_INSTANCE", "https://example.social"),
        ("MASTODON_CLIENT_ID", "id"),
        ("MASTODON_CLIENT_SECRET", "secret"),
        ("MASTODON_TOKEN", "token"),
    ]
    .into_iter()
    .collect();
    Arc::new(Config::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap())
}

// ── Test client ─────────────────────────────────────────────────────

/// Scripted IRC client on the far end of an in-memory connection.
struct TestClient {
    lines: FramedRead<ReadHalf<DuplexStream>, IrcCodec>,
    writer: WriteHalf<DuplexStream>,
    session: JoinHandle<Result<(), SessionError>>,
}

impl TestClient {
    fn connect(backend: &FakeBackend) -> Self {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let session = tokio::spawn(serve_connection(
            server,
            addr,
            config(),
            Arc::new(backend.clone()),
        ));
        let (reader, writer) = tokio::io::split(client);
        Self {
            lines: FramedRead::new(reader, IrcCodec::default()),
            writer,
            session,
        }
    }

    /// Connect, authenticate, and register as `alice`, consuming the
    /// welcome and both default JOINs.
    async fn registered(backend: &FakeBackend) -> Self {
        let mut client = Self::connect(backend);
        client.send("CAP LS 302").await;
        client.send("PASS hunter2").await;
        client.send("NICK alice").await;
        client.send("USER alice 0 * :Alice").await;
        client.expect(":to.ot 001 alice :Welcome to an IRC relay, alice!").await;
        client.expect(":alice JOIN &user").await;
        client.expect(":alice JOIN &public").await;
        client
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    /// Next line from the gateway, or `None` once it closed the connection.
    async fn recv(&mut self) -> Option<String> {
        tokio::time::timeout(WAIT, self.lines.next())
            .await
            .expect("timed out waiting for a line")
            .map(|msg| msg.unwrap().to_wire())
    }

    async fn expect(&mut self, line: &str) {
        assert_eq!(self.recv().await.as_deref(), Some(line));
    }

    async fn expect_closed(&mut self) {
        assert_eq!(self.recv().await, None);
    }

    /// Round-trip a PING to prove nothing else was queued before it.
    async fn sync(&mut self, token: &str) {
        self.send(&format!("PING {token}")).await;
        self.expect(&format!(":to.ot PONG {token}")).await;
    }

    async fn finish(self) -> Result<(), SessionError> {
        tokio::time::timeout(WAIT, self.session)
            .await
            .expect("session did not end")
            .unwrap()
    }
}

// ── Handshake ───────────────────────────────────────────────────────

#[tokio::test]
async fn wrong_password_is_rejected_once() {
    let backend = FakeBackend::default();
    let mut client = TestClient::connect(&backend);

    client.send("CAP LS 302").await;
    client.send("PASS letmein").await;
    client.expect(":to.ot ERROR :authentication failed").await;
    client.expect_closed().await;

    assert!(matches!(
        client.finish().await,
        Err(SessionError::Handshake(HandshakeError::WrongPassword))
    ));
    assert_eq!(backend.state.subscriptions(), 0);
}

#[tokio::test]
async fn first_command_must_be_pass() {
    let backend = FakeBackend::default();
    let mut client = TestClient::connect(&backend);

    client.send("NICK alice").await;
    client.expect(":to.ot ERROR :authentication failed").await;
    client.expect_closed().await;

    assert!(matches!(
        client.finish().await,
        Err(SessionError::Handshake(HandshakeError::NotPass(cmd))) if cmd == "NICK"
    ));
}

#[tokio::test]
async fn backend_authentication_failure() {
    let backend = FakeBackend {
        state: Arc::new(FakeState {
            fail_auth: true,
            ..FakeState::default()
        }),
    };
    let mut client = TestClient::connect(&backend);

    client.send("PASS hunter2").await;
    client.expect(":to.ot ERROR :authentication failed").await;
    client.expect_closed().await;
    assert!(matches!(
        client.finish().await,
        Err(SessionError::Handshake(HandshakeError::Backend(_)))
    ));
}

#[tokio::test]
async fn profile_failure_names_the_account() {
    let backend = FakeBackend {
        state: Arc::new(FakeState {
            fail_profile: true,
            ..FakeState::default()
        }),
    };
    let mut client = TestClient::connect(&backend);

    client.send("PASS hunter2").await;
    client
        .expect(":to.ot ERROR :could not get current Mastodon account")
        .await;
    client.expect_closed().await;
    assert!(matches!(
        client.finish().await,
        Err(SessionError::Handshake(HandshakeError::Profile(_)))
    ));
}

#[tokio::test]
async fn disconnect_before_pass() {
    let backend = FakeBackend::default();
    let client = TestClient::connect(&backend);
    let TestClient {
        lines,
        writer,
        session,
    } = client;
    drop((lines, writer));

    let result = tokio::time::timeout(WAIT, session).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(SessionError::Handshake(HandshakeError::Disconnected))
    ));
}

// ── Registration ────────────────────────────────────────────────────

#[tokio::test]
async fn registration_joins_default_channels() {
    let backend = FakeBackend::default();
    let mut client = TestClient::registered(&backend).await;

    // A second USER must not register again.
    client.send("USER alice 0 * :Alice").await;
    client.sync("once").await;
    assert_eq!(backend.state.subscriptions(), 2);
}

#[tokio::test]
async fn user_before_nick_registers_on_nick() {
    let backend = FakeBackend::default();
    let mut client = TestClient::connect(&backend);

    client.send("PASS hunter2").await;
    client.send("USER alice 0 * :Alice").await;
    client.sync("waiting").await;
    client.send("nick alice").await;
    client.expect(":to.ot 001 alice :Welcome to an IRC relay, alice!").await;
    client.expect(":alice JOIN &user").await;
    client.expect(":alice JOIN &public").await;
}

#[tokio::test]
async fn default_channel_joined_early_is_not_joined_twice() {
    let backend = FakeBackend::default();
    let mut client = TestClient::connect(&backend);

    client.send("PASS hunter2").await;
    client.send("NICK alice").await;
    client.send("JOIN &public").await;
    client.expect(":alice JOIN &public").await;
    client.send("USER alice 0 * :Alice").await;
    client.expect(":to.ot 001 alice :Welcome to an IRC relay, alice!").await;
    client.expect(":alice JOIN &user").await;
    client.sync("done").await;
    assert_eq!(backend.state.subscriptions(), 2);
}

#[tokio::test]
async fn default_channel_failure_ends_the_session() {
    let backend = FakeBackend {
        state: Arc::new(FakeState {
            fail_feeds: ["public".to_string()].into_iter().collect(),
            ..FakeState::default()
        }),
    };
    let mut client = TestClient::connect(&backend);

    client.send("PASS hunter2").await;
    client.send("NICK alice").await;
    client.send("USER alice 0 * :Alice").await;
    client.expect(":to.ot 001 alice :Welcome to an IRC relay, alice!").await;
    client.expect(":alice JOIN &user").await;
    client.expect_closed().await;

    let stop = backend.state.stop("user");
    assert!(matches!(
        client.finish().await,
        Err(SessionError::DefaultChannel { channel, .. }) if channel == "&public"
    ));
    assert!(stop.is_cancelled());
}

// ── Commands ────────────────────────────────────────────────────────

#[tokio::test]
async fn ping_mode_and_unknown_commands() {
    let backend = FakeBackend::default();
    let mut client = TestClient::registered(&backend).await;

    client.send("PING :abc123").await;
    client.expect(":to.ot PONG abc123").await;

    client.send("MODE alice +i").await;
    client.expect(":to.ot MODE alice +i").await;

    // A mode query has no reply.
    client.send("MODE alice").await;
    client.sync("after-mode").await;

    client.send("WHOIS bob").await;
    client.expect(":to.ot 421 alice WHOIS :Unknown command").await;

    client.send("CAP END").await;
    client.sync("after-cap").await;

    client.send("PING").await;
    client.expect(":to.ot 461 alice PING :Not enough parameters").await;

    // Authentication already happened; a repeated PASS is ignored.
    client.send("PASS hunter2").await;
    client.sync("after-pass").await;
}

#[tokio::test]
async fn join_list_handles_each_target() {
    let backend = FakeBackend {
        state: Arc::new(FakeState {
            fail_feeds: ["hashtag:broken".to_string()].into_iter().collect(),
            ..FakeState::default()
        }),
    };
    let mut client = TestClient::registered(&backend).await;

    client.send("JOIN #golang,&bogus,&user,#broken,&local").await;
    client.expect(":alice JOIN #golang").await;
    client.expect(":to.ot 403 alice &bogus :Unknown target").await;
    client.expect(":to.ot 405 alice &user :Channel already joined").await;
    client
        .expect(":to.ot 403 alice #broken :Could not subscribe to feed")
        .await;
    client.expect(":alice JOIN &local").await;

    client.send("JOIN").await;
    client.expect(":to.ot 461 alice JOIN :Not enough parameters").await;

    // user, public, golang, local
    assert_eq!(backend.state.subscriptions(), 4);
}

#[tokio::test]
async fn quit_ends_the_session() {
    let backend = FakeBackend::default();
    let mut client = TestClient::registered(&backend).await;

    client.send("QUIT :bye").await;
    client.expect_closed().await;
    assert!(client.finish().await.is_ok());
    assert!(backend.state.stop("user").is_cancelled());
    assert!(backend.state.stop("public").is_cancelled());
}

// ── Relaying ────────────────────────────────────────────────────────

#[tokio::test]
async fn posts_are_relayed_to_their_channel() {
    let backend = FakeBackend::default();
    let mut client = TestClient::registered(&backend).await;

    client.send("JOIN #golang").await;
    client.expect(":alice JOIN #golang").await;

    let golang = backend.state.sender("hashtag:golang");
    golang
        .send(update("Rob", "<p>generics are here</p>", ""))
        .await
        .unwrap();
    client
        .expect(":hashtag PRIVMSG #golang :Rob: generics are here")
        .await;

    let public = backend.state.sender("public");
    public
        .send(update("Ann", "<p>first line<br>second line</p><p>hidden</p>", "spoilers"))
        .await
        .unwrap();
    client.expect(":public PRIVMSG &public :Ann: CW: spoilers").await;
    client.expect(":public PRIVMSG &public :Ann: first line").await;
    client.expect(":public PRIVMSG &public :Ann: second line").await;

    // Non-update events are dropped.
    public.send(StreamEvent::Other("delete".into())).await.unwrap();
    client.sync("quiet").await;
}

#[tokio::test]
async fn ended_feed_leaves_the_session_running() {
    let backend = FakeBackend::default();
    let mut client = TestClient::registered(&backend).await;

    backend.state.end_feed("public");
    client.sync("still-here").await;

    let user = backend.state.sender("user");
    user.send(update("Bea", "<p>hello</p>", "")).await.unwrap();
    client.expect(":user PRIVMSG &user :Bea: hello").await;
}

#[tokio::test]
async fn disconnect_stops_every_feed() {
    let backend = FakeBackend::default();
    let mut client = TestClient::registered(&backend).await;
    client.send("JOIN #rust").await;
    client.expect(":alice JOIN #rust").await;

    let TestClient {
        lines,
        writer,
        session,
    } = client;
    drop((lines, writer));

    let result = tokio::time::timeout(WAIT, session).await.unwrap().unwrap();
    assert!(result.is_ok());
    for key in ["user", "public", "hashtag:rust"] {
        assert!(backend.state.stop(key).is_cancelled(), "{key} still running");
    }
}

#[tokio::test]
async fn teardown_does_not_wait_on_a_client_that_stopped_reading() {
    let backend = FakeBackend::default();
    let (client, server) = tokio::io::duplex(256);
    let addr: SocketAddr = "127.0.0.1:50001".parse().unwrap();
    let session = tokio::spawn(serve_connection(
        server,
        addr,
        config(),
        Arc::new(backend.clone()),
    ));
    // The read half is kept but never polled.
    let (_reader, mut writer) = tokio::io::split(client);
    writer
        .write_all(b"PASS hunter2\r\nNICK alice\r\nUSER alice 0 * :Alice\r\n")
        .await
        .unwrap();

    tokio::time::timeout(WAIT, async {
        while backend.state.subscriptions() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("default channels were never opened");

    let public = backend.state.sender("public");
    let body = format!("<p>{}</p>", "busy feed ".repeat(40));
    for _ in 0..5 {
        public.send(update("Ann", &body, "")).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    writer.shutdown().await.unwrap();

    let limit = PUMP_GRACE + CLOSE_TIMEOUT + Duration::from_secs(2);
    let result = tokio::time::timeout(limit, session)
        .await
        .expect("session hung on unflushed output")
        .unwrap();
    assert!(result.is_ok());
    assert!(backend.state.stop("public").is_cancelled());
}

// ── Listener ────────────────────────────────────────────────────────

#[tokio::test]
async fn accepts_clients_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let backend = FakeBackend::default();
    let acceptor = tokio::spawn(accept_loop(
        listener,
        config(),
        Arc::new(backend.clone()),
    ));

    for _ in 0..2 {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"PASS nope\r\n").await.unwrap();
        let mut lines = FramedRead::new(stream, IrcCodec::default());
        let reply = tokio::time::timeout(WAIT, lines.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply.to_wire(), ":to.ot ERROR :authentication failed");
    }

    acceptor.abort();
}
