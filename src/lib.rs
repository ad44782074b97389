//! discord bot gateway toolkit
//!
//! The pieces stack bottom up: [`stream`] dials tcp and tls and hides
//! one transparent reconnect, [`http`] speaks enough http/1.1 for the
//! rest api and the upgrade (chunked bodies included), [`frame`] and
//! [`codec`] do rfc 6455 framing over fixed rings, [`protocol`] runs
//! the upgrade handshake and the frame loop, [`gateway`] is the
//! session state machine (heartbeat, identify/resume, dispatch) and
//! [`shard`] fans sessions out with the concurrent-start gate.
//!
//! ```no_run
//! use katachi::{login_sharded, Intents, ShardSpec};
//!
//! # async fn example() -> Result<(), katachi::Error> {
//! let intents = Intents::GUILDS | Intents::GUILD_MESSAGES;
//! login_sharded(
//!     std::env::var("DISCORD_TOKEN").unwrap(),
//!     intents,
//!     |_client, event| tracing::info!(name = event.name(), "event"),
//!     None,
//!     0, // take the server's shard recommendation
//!     ShardSpec::default(),
//! )
//! .await
//! # }
//! ```

pub mod codec;
pub mod errors;
pub mod frame;
pub mod gateway;
pub mod http;
pub mod protocol;
pub mod shard;
pub mod stream;

pub use errors::{Error, ProtocolError};
pub use gateway::{
    default_event_handler, Client, Event, GuildMembersRequest, IdentifyConfig, Intents,
    PresenceUpdate, VoiceStateUpdate, USER_AGENT,
};
pub use protocol::{ClientBuilder, ConnectionState, WebSocket, WsUri};
pub use shard::{gateway_bot, gateway_url, login, login_sharded, ClientSpec, GatewayBot, ShardSpec};
pub use stream::Socket;
