/// The IRC side of the bridge: accepting clients, the password gate,
/// per-connection sessions, and the pumps that relay feeds into channels.
pub mod channel;
pub mod handshake;
pub mod outbound;
pub mod pump;
pub mod server;
pub mod session;
pub mod translate;
