/// Per-connection session: registration state machine, command dispatch,
/// channel joins, and teardown.
///
/// One task reads the client's lines and dispatches them. Each joined
/// channel adds a pump task. When the reading loop ends for any reason the
/// session cancels every pump, waits briefly for them, and closes the socket.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Span};

use crate::config::Config;
use crate::irc::codec::{CodecError, IrcCodec};
use crate::irc::message::Message;
use crate::mastodon::{Account, AccountClient, Backend};

use super::channel::{Channel, ChannelRegistry, JoinError};
use super::handshake::{handshake, Authenticated, HandshakeError};
use super::outbound::{Outbound, SendError};
use super::pump::Pump;

/// How long teardown waits for pumps before aborting them.
pub const PUMP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("read failed: {0}")]
    Read(#[from] CodecError),
    #[error("write failed: {0}")]
    Send(#[from] SendError),
    #[error("default channel {channel} failed: {source}")]
    DefaultChannel {
        channel: String,
        #[source]
        source: JoinError,
    },
}

/// Serve one accepted connection from handshake to teardown.
pub async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    config: Arc<Config>,
    backend: Arc<dyn Backend>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut lines = FramedRead::new(reader, IrcCodec::default());
    let out = Arc::new(Outbound::new(writer));

    let auth = handshake(&mut lines, &out, &config, backend.as_ref()).await?;
    info!(%addr, account = %auth.account.acct, "authenticated");

    Session::new(config, auth, lines, out).run().await
}

enum Flow {
    Continue,
    Quit,
}

pub struct Session<R, W> {
    config: Arc<Config>,
    client: Arc<dyn AccountClient>,
    account: Account,
    lines: FramedRead<R, IrcCodec>,
    out: Arc<Outbound<W>>,
    channels: ChannelRegistry,
    cancel: CancellationToken,
    nickname: String,
    nick_set: bool,
    user_set: bool,
    registered: bool,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        config: Arc<Config>,
        auth: Authenticated,
        lines: FramedRead<R, IrcCodec>,
        out: Arc<Outbound<W>>,
    ) -> Self {
        Self {
            config,
            client: auth.client,
            account: auth.account,
            lines,
            out,
            channels: ChannelRegistry::default(),
            cancel: CancellationToken::new(),
            nickname: "*".into(),
            nick_set: false,
            user_set: false,
            registered: false,
        }
    }

    /// Dispatch until the client goes away, then tear down.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let result = self.dispatch_loop().await;
        if let Err(ref e) = result {
            warn!(nick = %self.nickname, registered = self.registered, "session ending: {e}");
        }
        self.teardown().await;
        result
    }

    async fn dispatch_loop(&mut self) -> Result<(), SessionError> {
        loop {
            let msg = match self.lines.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    info!(nick = %self.nickname, "client closed the connection");
                    return Ok(());
                }
            };

            debug!(nick = %self.nickname, registered = self.registered, verb = %msg.command, "command");
            if let Flow::Quit = self.dispatch(msg).await? {
                return Ok(());
            }

            if self.nick_set && self.user_set && !self.registered {
                self.register().await?;
            }
        }
    }

    async fn dispatch(&mut self, msg: Message) -> Result<Flow, SessionError> {
        let verb = msg.verb();
        match verb.as_str() {
            "NICK" => match msg.param(0) {
                Some(nick) if !nick.is_empty() => {
                    self.nickname = nick.to_owned();
                    self.nick_set = true;
                    Span::current().record("nick", nick);
                }
                _ => self.need_more_params(&verb).await?,
            },
            "USER" => self.user_set = true,
            // No mode state is kept: a change is echoed back, a query ignored.
            "MODE" => match msg.params.len() {
                0 => self.need_more_params(&verb).await?,
                1 => {}
                _ => self.reply("MODE", msg.params).await?,
            },
            "PING" => match msg.param(0) {
                Some(token) => {
                    let token = token.to_owned();
                    self.reply("PONG", [token]).await?;
                }
                None => self.need_more_params(&verb).await?,
            },
            "JOIN" => match msg.param(0) {
                Some(targets) => {
                    let targets = targets.to_owned();
                    self.join_targets(&targets).await?;
                }
                None => self.need_more_params(&verb).await?,
            },
            // Already checked by the handshake.
            "PASS" => {
                if msg.params.is_empty() {
                    self.need_more_params(&verb).await?;
                }
            }
            // Late capability negotiation (`CAP END`) is harmless.
            "CAP" => {}
            "QUIT" => return Ok(Flow::Quit),
            _ => {
                let nick = self.nickname.clone();
                self.reply("421", [nick, msg.command, "Unknown command".into()])
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Fires once, the first time both NICK and USER have been seen.
    async fn register(&mut self) -> Result<(), SessionError> {
        self.registered = true;
        Span::current().record("registered", true);
        info!(nick = %self.nickname, account = %self.account.acct, "registered");

        let welcome = format!("Welcome to an IRC relay, {}!", self.account.acct);
        let nick = self.nickname.clone();
        self.reply("001", [nick, welcome]).await?;

        for channel in [Channel::user(), Channel::public()] {
            // Already joined by hand before registering.
            if self.channels.contains(&channel.name) {
                continue;
            }
            let name = channel.name.clone();
            match self.open_channel(channel).await {
                Ok(()) => {}
                Err(JoinError::Send(e)) => return Err(e.into()),
                Err(source) => {
                    error!(channel = %name, "default channel failed: {source}");
                    return Err(SessionError::DefaultChannel {
                        channel: name,
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    /// Handle each comma-separated JOIN target on its own.
    async fn join_targets(&mut self, targets: &str) -> Result<(), SessionError> {
        for target in targets.split(',').filter(|t| !t.is_empty()) {
            let result = match Channel::parse(target) {
                Ok(channel) => self.open_channel(channel).await,
                Err(e) => Err(e),
            };
            let Err(e) = result else { continue };

            warn!(nick = %self.nickname, target, "join failed: {e}");
            let (code, text) = match e {
                JoinError::Send(e) => return Err(e.into()),
                JoinError::UnknownTarget(_) => ("403", "Unknown target"),
                JoinError::AlreadyJoined => ("405", "Channel already joined"),
                JoinError::Subscribe(_) => ("403", "Could not subscribe to feed"),
            };
            let nick = self.nickname.clone();
            self.reply(code, [nick, target.to_owned(), text.to_owned()])
                .await?;
        }
        Ok(())
    }

    /// Subscribe to the channel's feed, confirm the JOIN, and start its pump.
    async fn open_channel(&mut self, channel: Channel) -> Result<(), JoinError> {
        self.channels.check_free(&channel.name)?;

        let subscription = self
            .client
            .subscribe(channel.feed, channel.hashtag.as_deref())
            .await?;

        let join = Message::new(Some(&self.nickname), "JOIN", [&channel.name]);
        if let Err(e) = self.out.send(join).await {
            subscription.stop.cancel();
            return Err(JoinError::Send(e));
        }

        info!(nick = %self.nickname, channel = %channel.name, feed = %channel.feed, "joined");
        let name = channel.name.clone();
        let pump = Pump {
            channel,
            subscription,
            out: Arc::clone(&self.out),
            cancel: self.cancel.child_token(),
        }
        .spawn();
        self.channels.insert(&name, pump)
    }

    async fn need_more_params(&self, verb: &str) -> Result<(), SessionError> {
        let params = [self.nickname.clone(), verb.to_owned(), "Not enough parameters".into()];
        self.reply("461", params).await
    }

    /// Send a line sourced from the gateway itself.
    async fn reply<I, S>(&self, command: &str, params: I) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let msg = Message::new(Some(&self.config.server_name), command, params);
        match self.out.send(msg).await {
            Err(SendError::Codec(CodecError::LineBreak)) => {
                warn!(nick = %self.nickname, command, "dropping reply that would split a line");
                Ok(())
            }
            result => Ok(result?),
        }
    }

    /// Cancel every pump, give them [`PUMP_GRACE`] to finish, then close the socket.
    async fn teardown(&mut self) {
        self.cancel.cancel();

        let pumps = self.channels.drain();
        let aborts: Vec<_> = pumps.iter().map(|p| p.abort_handle()).collect();
        let count = pumps.len();
        if tokio::time::timeout(PUMP_GRACE, futures::future::join_all(pumps))
            .await
            .is_err()
        {
            warn!(nick = %self.nickname, "pumps did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        self.out.close().await;
        debug!(nick = %self.nickname, pumps = count, "session torn down");
    }
}
