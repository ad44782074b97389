use std::time::Duration;

use bitflags::bitflags;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::errors::Error;
use crate::frame::{Frame, OpCode as FrameOp};
use crate::protocol::{WebSocket, WsEvent, CLOSE_ABNORMAL, CLOSE_GOING_AWAY, CLOSE_NORMAL};
use crate::stream::{Socket, Transport};

/// default user agent for rest and gateway requests
pub const USER_AGENT: &str = "Katachi";

/// the gateway refuses session ids longer than this
const MAX_SESSION_ID: usize = 1023;

bitflags! {
    /// gateway intents: which event categories the session subscribes to
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Intents: u64 {
        const GUILDS = 1 << 0;
        const GUILD_MEMBERS = 1 << 1;
        const GUILD_BANS = 1 << 2;
        const GUILD_EMOJIS_AND_STICKERS = 1 << 3;
        const GUILD_INTEGRATIONS = 1 << 4;
        const GUILD_WEBHOOKS = 1 << 5;
        const GUILD_INVITES = 1 << 6;
        const GUILD_VOICE_STATES = 1 << 7;
        const GUILD_PRESENCES = 1 << 8;
        const GUILD_MESSAGES = 1 << 9;
        const GUILD_MESSAGE_REACTIONS = 1 << 10;
        const GUILD_MESSAGE_TYPING = 1 << 11;
        const DIRECT_MESSAGES = 1 << 12;
        const DIRECT_MESSAGE_REACTIONS = 1 << 13;
        const DIRECT_MESSAGE_TYPING = 1 << 14;
        const MESSAGE_CONTENT = 1 << 15;
        const GUILD_SCHEDULED_EVENTS = 1 << 16;
    }
}

/// gateway opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    VoiceStateUpdate = 4,
    Resume = 6,
    Reconnect = 7,
    RequestGuildMembers = 8,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

/// the one payload envelope every gateway message uses
#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
    #[serde(default)]
    d: Value,
}

#[derive(Serialize)]
struct Command<D> {
    op: u8,
    d: D,
}

#[derive(Serialize)]
struct ConnectionProperties<'a> {
    #[serde(rename = "$os")]
    os: &'a str,
    #[serde(rename = "$browser")]
    browser: &'a str,
    #[serde(rename = "$device")]
    device: &'a str,
}

#[derive(Serialize)]
struct IdentifyPayload<'a> {
    token: &'a str,
    properties: ConnectionProperties<'a>,
    compress: bool,
    large_threshold: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    shard: Option<[u32; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence: Option<&'a PresenceUpdate>,
    intents: u64,
}

#[derive(Serialize)]
struct ResumePayload<'a> {
    token: &'a str,
    session_id: &'a str,
    seq: Option<u64>,
}

/// presence sent with identify or a presence update command
#[derive(Debug, Clone, Serialize, Default)]
pub struct PresenceUpdate {
    pub since: Option<u64>,
    pub activities: Vec<Value>,
    pub status: String,
    pub afk: bool,
}

/// request for guild member chunks
#[derive(Debug, Clone, Serialize, Default)]
pub struct GuildMembersRequest {
    pub guild_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presences: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// voice channel join/move/leave
#[derive(Debug, Clone, Serialize, Default)]
pub struct VoiceStateUpdate {
    pub guild_id: String,
    pub channel_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// everything identify needs, fixed for the lifetime of a session
#[derive(Debug, Clone)]
pub struct IdentifyConfig {
    pub token: String,
    pub intents: Intents,
    pub os: String,
    pub browser: String,
    pub device: String,
    pub compress: bool,
    /// clamped into 50..=250 when serialized
    pub large_threshold: u8,
    /// `[shard_id, shard_count]`; a count of zero means unsharded
    pub shard: [u32; 2],
    pub presence: Option<PresenceUpdate>,
}

impl IdentifyConfig {
    pub fn new(token: impl Into<String>, intents: Intents) -> Self {
        Self {
            token: token.into(),
            intents,
            os: std::env::consts::OS.to_string(),
            browser: USER_AGENT.to_string(),
            device: USER_AGENT.to_string(),
            compress: false,
            large_threshold: 50,
            shard: [0, 0],
            presence: None,
        }
    }
}

/// countdown driven by elapsed wall time per loop iteration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Heartbeat {
    /// ms between beats; zero until HELLO arrives
    pub interval: u64,
    /// ms until the next beat
    pub remaining: i64,
    pub sent: u32,
    pub acked: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTick {
    Idle,
    /// the countdown expired, a beat is owed
    Due,
}

impl Heartbeat {
    pub fn start(&mut self, interval: u64) {
        self.interval = interval;
        self.remaining = interval as i64;
    }

    pub fn reset(&mut self) {
        self.remaining = self.interval as i64;
    }

    pub fn tick(&mut self, elapsed_ms: u64) -> HeartbeatTick {
        if self.interval == 0 {
            return HeartbeatTick::Idle;
        }
        self.remaining -= elapsed_ms as i64;
        if self.remaining > 0 {
            HeartbeatTick::Idle
        } else {
            self.remaining = self.interval as i64;
            HeartbeatTick::Due
        }
    }
}

/// HELLO payload contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloEvent {
    pub heartbeat_interval: u64,
}

/// READY with the fields the session itself needs; the rest of the
/// payload stays available raw
#[derive(Debug, Clone)]
pub struct ReadyEvent {
    pub v: i64,
    pub session_id: String,
    pub shard: Option<[u32; 2]>,
    pub data: Value,
}

impl ReadyEvent {
    fn from_value(data: Value) -> Self {
        let v = data.get("v").and_then(Value::as_i64).unwrap_or(0);
        let session_id = data
            .get("session_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let shard = data.get("shard").and_then(Value::as_array).and_then(|arr| {
            match (arr.first()?.as_u64(), arr.get(1)?.as_u64()) {
                (Some(id), Some(count)) => Some([id as u32, count as u32]),
                _ => None,
            }
        });
        Self {
            v,
            session_id,
            shard,
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidSessionEvent {
    /// whether the interrupted session can still be resumed
    pub resumable: bool,
}

macro_rules! dispatch_events {
    ($(($variant:ident, $name:literal),)*) => {
        /// everything the gateway can push. payload-bearing dispatch
        /// variants carry the raw `d` value; copy out anything that
        /// must outlive the callback.
        #[derive(Debug, Clone)]
        pub enum Event {
            Hello(HelloEvent),
            Ready(ReadyEvent),
            Resumed,
            Reconnect,
            InvalidSession(InvalidSessionEvent),
            $( $variant(Value), )*
        }

        impl Event {
            /// wire name of the event
            pub fn name(&self) -> &'static str {
                match self {
                    Event::Hello(_) => "HELLO",
                    Event::Ready(_) => "READY",
                    Event::Resumed => "RESUMED",
                    Event::Reconnect => "RECONNECT",
                    Event::InvalidSession(_) => "INVALID_SESSION",
                    $( Event::$variant(_) => $name, )*
                }
            }

            /// map a DISPATCH `t` name to its variant
            pub fn from_dispatch(name: &str, data: Value) -> Option<Event> {
                match name {
                    "READY" => Some(Event::Ready(ReadyEvent::from_value(data))),
                    "RESUMED" => Some(Event::Resumed),
                    $( $name => Some(Event::$variant(data)), )*
                    _ => None,
                }
            }
        }
    };
}

dispatch_events! {
    (ApplicationCommandPermissionsUpdate, "APPLICATION_COMMAND_PERMISSIONS_UPDATE"),
    (ChannelCreate, "CHANNEL_CREATE"),
    (ChannelUpdate, "CHANNEL_UPDATE"),
    (ChannelDelete, "CHANNEL_DELETE"),
    (ChannelPinsUpdate, "CHANNEL_PINS_UPDATE"),
    (ThreadCreate, "THREAD_CREATE"),
    (ThreadUpdate, "THREAD_UPDATE"),
    (ThreadDelete, "THREAD_DELETE"),
    (ThreadListSync, "THREAD_LIST_SYNC"),
    (ThreadMemberUpdate, "THREAD_MEMBER_UPDATE"),
    (ThreadMembersUpdate, "THREAD_MEMBERS_UPDATE"),
    (GuildCreate, "GUILD_CREATE"),
    (GuildUpdate, "GUILD_UPDATE"),
    (GuildDelete, "GUILD_DELETE"),
    (GuildBanAdd, "GUILD_BAN_ADD"),
    (GuildBanRemove, "GUILD_BAN_REMOVE"),
    (GuildEmojisUpdate, "GUILD_EMOJIS_UPDATE"),
    (GuildStickersUpdate, "GUILD_STICKERS_UPDATE"),
    (GuildIntegrationsUpdate, "GUILD_INTEGRATIONS_UPDATE"),
    (GuildMemberAdd, "GUILD_MEMBER_ADD"),
    (GuildMemberRemove, "GUILD_MEMBER_REMOVE"),
    (GuildMemberUpdate, "GUILD_MEMBER_UPDATE"),
    (GuildMembersChunk, "GUILD_MEMBERS_CHUNK"),
    (GuildRoleCreate, "GUILD_ROLE_CREATE"),
    (GuildRoleUpdate, "GUILD_ROLE_UPDATE"),
    (GuildRoleDelete, "GUILD_ROLE_DELETE"),
    (GuildScheduledEventCreate, "GUILD_SCHEDULED_EVENT_CREATE"),
    (GuildScheduledEventUpdate, "GUILD_SCHEDULED_EVENT_UPDATE"),
    (GuildScheduledEventDelete, "GUILD_SCHEDULED_EVENT_DELETE"),
    (GuildScheduledEventUserAdd, "GUILD_SCHEDULED_EVENT_USER_ADD"),
    (GuildScheduledEventUserRemove, "GUILD_SCHEDULED_EVENT_USER_REMOVE"),
    (IntegrationCreate, "INTEGRATION_CREATE"),
    (IntegrationUpdate, "INTEGRATION_UPDATE"),
    (IntegrationDelete, "INTEGRATION_DELETE"),
    (InteractionCreate, "INTERACTION_CREATE"),
    (InviteCreate, "INVITE_CREATE"),
    (InviteDelete, "INVITE_DELETE"),
    (MessageCreate, "MESSAGE_CREATE"),
    (MessageUpdate, "MESSAGE_UPDATE"),
    (MessageDelete, "MESSAGE_DELETE"),
    (MessageDeleteBulk, "MESSAGE_DELETE_BULK"),
    (MessageReactionAdd, "MESSAGE_REACTION_ADD"),
    (MessageReactionRemove, "MESSAGE_REACTION_REMOVE"),
    (MessageReactionRemoveAll, "MESSAGE_REACTION_REMOVE_ALL"),
    (MessageReactionRemoveEmoji, "MESSAGE_REACTION_REMOVE_EMOJI"),
    (PresenceUpdate, "PRESENCE_UPDATE"),
    (StageInstanceCreate, "STAGE_INSTANCE_CREATE"),
    (StageInstanceUpdate, "STAGE_INSTANCE_UPDATE"),
    (StageInstanceDelete, "STAGE_INSTANCE_DELETE"),
    (TypingStart, "TYPING_START"),
    (UserUpdate, "USER_UPDATE"),
    (VoiceStateUpdate, "VOICE_STATE_UPDATE"),
    (VoiceServerUpdate, "VOICE_SERVER_UPDATE"),
    (WebhooksUpdate, "WEBHOOKS_UPDATE"),
}

/// callback contract: invoked on the shard's own task, in gateway
/// order. event payloads are dropped when the callback returns, so
/// copy anything that must live longer.
pub fn default_event_handler<T: Transport>(_client: &mut Client<T>, event: &Event) {
    tracing::debug!(name = event.name(), "event");
}

/// session state that survives reconnects within one login call
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub session_id: String,
    pub sequence: Option<u64>,
    pub login: bool,
}

impl SessionState {
    pub fn fresh() -> Self {
        Self {
            login: true,
            ..Default::default()
        }
    }
}

/// whether a peer close code leaves the session restartable within the
/// same login call. 4004 (authentication failed) is unrecoverable even
/// though it sits inside the resumable 4xxx band, as are 4010..=4014.
pub fn close_code_can_restart(code: u16) -> bool {
    (4000..=4009).contains(&code) && code != 4006 && code != 4004
}

/// one gateway session over an established websocket. owns the
/// per-connection protocol state and the command surface; the
/// supervising login loop owns reconnection.
pub struct Client<T: Transport = Socket> {
    ws: WebSocket<T>,
    config: IdentifyConfig,
    tick: Duration,
    session_id: String,
    sequence: Option<u64>,
    heartbeat: Heartbeat,
    login: bool,
    hello_received: bool,
}

impl<T: Transport> Client<T> {
    pub fn new(
        ws: WebSocket<T>,
        config: IdentifyConfig,
        tick: Duration,
        state: SessionState,
    ) -> Self {
        Self {
            ws,
            config,
            tick,
            session_id: state.session_id,
            sequence: state.sequence,
            heartbeat: Heartbeat::default(),
            login: state.login,
            hello_received: false,
        }
    }

    /// hand the cross-connection state back to the login loop
    pub fn into_state(self) -> SessionState {
        SessionState {
            session_id: self.session_id,
            sequence: self.sequence,
            login: self.login,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// `(shard_id, shard_count)`
    pub fn shard(&self) -> (u32, u32) {
        (self.config.shard[0], self.config.shard[1])
    }

    pub fn heartbeat_state(&self) -> &Heartbeat {
        &self.heartbeat
    }

    fn send_command<D: Serialize>(&mut self, op: Opcode, d: D) -> Result<(), Error> {
        let msg = serde_json::to_string(&Command { op: op as u8, d })?;
        self.ws.send(Frame::text(&msg))
    }

    /// send IDENTIFY for a brand new session
    pub fn identify(&mut self) -> Result<(), Error> {
        let payload = IdentifyPayload {
            token: &self.config.token,
            properties: ConnectionProperties {
                os: &self.config.os,
                browser: &self.config.browser,
                device: &self.config.device,
            },
            compress: self.config.compress,
            large_threshold: self.config.large_threshold.clamp(50, 250),
            shard: (self.config.shard[1] > 0).then_some(self.config.shard),
            presence: self.config.presence.as_ref(),
            intents: self.config.intents.bits(),
        };
        let msg = serde_json::to_string(&Command {
            op: Opcode::Identify as u8,
            d: payload,
        })?;
        self.ws.send(Frame::text(&msg))
    }

    /// send RESUME for the stored session
    pub fn resume(&mut self) -> Result<(), Error> {
        let token = self.config.token.clone();
        let session_id = self.session_id.clone();
        self.send_command(
            Opcode::Resume,
            ResumePayload {
                token: &token,
                session_id: &session_id,
                seq: self.sequence,
            },
        )
    }

    /// send one heartbeat, provided the previous one was acknowledged.
    /// a missing ack means the connection is dead: it is closed with
    /// 1006 so the session can be resumed, and nothing is sent.
    pub fn heartbeat(&mut self) -> Result<(), Error> {
        if self.heartbeat.sent != self.heartbeat.acked {
            tracing::warn!(
                sent = self.heartbeat.sent,
                acked = self.heartbeat.acked,
                "no heartbeat acknowledgement"
            );
            self.ws.start_close(CLOSE_ABNORMAL);
            return Ok(());
        }
        let seq = self.sequence;
        self.send_command(Opcode::Heartbeat, seq)?;
        self.heartbeat.sent += 1;
        Ok(())
    }

    pub fn presence_update(&mut self, presence: &PresenceUpdate) -> Result<(), Error> {
        self.send_command(Opcode::PresenceUpdate, presence)
    }

    pub fn guild_members_request(&mut self, request: &GuildMembersRequest) -> Result<(), Error> {
        self.send_command(Opcode::RequestGuildMembers, request)
    }

    pub fn voice_state_update(&mut self, update: &VoiceStateUpdate) -> Result<(), Error> {
        self.send_command(Opcode::VoiceStateUpdate, update)
    }

    /// clean shutdown: close 1000 and stop the login loop
    pub fn logout(&mut self) {
        if self.login {
            tracing::info!("logging out");
            self.ws.start_close(CLOSE_NORMAL);
            self.login = false;
        }
    }

    /// drive the session until the connection is over. the caller
    /// decides on reconnect from the state handed back by
    /// [`Client::into_state`].
    pub async fn run(
        &mut self,
        on_event: &mut (dyn FnMut(&mut Client<T>, &Event) + Send),
    ) -> Result<(), Error> {
        let mut last = Instant::now();
        loop {
            let received = self.ws.receive(Some(self.tick)).await;

            let now = Instant::now();
            let elapsed = now.duration_since(last).as_millis() as u64;
            last = now;

            match received {
                Ok(WsEvent::Tick) => {}
                Ok(WsEvent::Frame(frame)) => {
                    if let Err(e) = self.handle_frame(frame, on_event).await {
                        if matches!(e, Error::Gateway(_)) {
                            self.ws.shutdown().await;
                            return Err(e);
                        }
                        tracing::warn!(error = %e, "session error, dropping connection");
                        self.ws.shutdown().await;
                        return Ok(());
                    }
                }
                Ok(WsEvent::Close {
                    code,
                    reason,
                    by_peer,
                }) => {
                    self.ws.shutdown().await;
                    if !by_peer {
                        return Ok(());
                    }
                    self.login = close_code_can_restart(code);
                    if code == CLOSE_NORMAL || code == CLOSE_GOING_AWAY {
                        tracing::info!("shutting down");
                        return Ok(());
                    }
                    if self.login {
                        tracing::warn!(code, "gateway dropped the session");
                        return Ok(());
                    }
                    let reason = String::from_utf8_lossy(&reason).into_owned();
                    if reason.is_empty() {
                        tracing::error!(code, "abnormal shut down");
                    } else {
                        tracing::error!(code, reason = %reason, "shutting down");
                    }
                    return Err(Error::FatalClose { code, reason });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "connection failed");
                    self.ws.shutdown().await;
                    return Ok(());
                }
            }

            if self.heartbeat.tick(elapsed) == HeartbeatTick::Due {
                self.heartbeat()?;
                tracing::trace!(count = self.heartbeat.sent, "heartbeat");
            }
            self.ws.flush().await?;
        }
    }

    async fn handle_frame(
        &mut self,
        frame: Frame,
        on_event: &mut (dyn FnMut(&mut Client<T>, &Event) + Send),
    ) -> Result<(), Error> {
        if frame.opcode != FrameOp::Text {
            tracing::warn!(opcode = ?frame.opcode, "unexpected non-text frame from gateway");
            return Ok(());
        }
        let payload: GatewayPayload = match serde_json::from_slice(&frame.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "invalid frame received");
                return Ok(());
            }
        };

        if !self.hello_received && payload.op != Opcode::Hello as u8 {
            self.login = false;
            return Err(Error::Gateway(format!(
                "expected HELLO as the first payload, got opcode {}",
                payload.op
            )));
        }

        match payload.op {
            op if op == Opcode::Dispatch as u8 => {
                if let Some(s) = payload.s {
                    self.sequence = Some(s);
                }
                let name = payload.t.unwrap_or_default();
                self.dispatch(&name, payload.d, on_event);
                Ok(())
            }
            op if op == Opcode::Heartbeat as u8 => {
                // the gateway asked for an immediate beat
                self.heartbeat.reset();
                self.heartbeat()?;
                tracing::trace!(count = self.heartbeat.sent, "heartbeat on request");
                Ok(())
            }
            op if op == Opcode::Reconnect as u8 => {
                on_event(self, &Event::Reconnect);
                // abnormal closure so the session can be resumed
                self.ws.start_close(CLOSE_ABNORMAL);
                Ok(())
            }
            op if op == Opcode::InvalidSession as u8 => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                on_event(self, &Event::InvalidSession(InvalidSessionEvent { resumable }));
                self.invalid_session(resumable).await;
                Ok(())
            }
            op if op == Opcode::Hello as u8 => {
                let interval = payload
                    .d
                    .get("heartbeat_interval")
                    .and_then(Value::as_f64)
                    .unwrap_or(45000.0) as u64;
                self.hello_received = true;
                self.heartbeat.start(interval);
                on_event(
                    self,
                    &Event::Hello(HelloEvent {
                        heartbeat_interval: interval,
                    }),
                );
                if !self.session_id.is_empty() {
                    tracing::trace!(session = %self.session_id, "resuming session");
                    self.resume()
                } else {
                    self.identify()
                }
            }
            op if op == Opcode::HeartbeatAck as u8 => {
                self.heartbeat.acked += 1;
                tracing::trace!(count = self.heartbeat.acked, "acknowledgement");
                Ok(())
            }
            op => {
                self.login = false;
                Err(Error::Gateway(format!("unexpected opcode {op}")))
            }
        }
    }

    fn dispatch(
        &mut self,
        name: &str,
        data: Value,
        on_event: &mut (dyn FnMut(&mut Client<T>, &Event) + Send),
    ) {
        let event = match Event::from_dispatch(name, data) {
            Some(event) => event,
            None => {
                tracing::error!(name, "unknown event");
                return;
            }
        };
        if let Event::Ready(ready) = &event {
            if ready.session_id.len() <= MAX_SESSION_ID {
                self.session_id = ready.session_id.clone();
                tracing::trace!(session = %self.session_id, "client session ready");
            } else {
                tracing::warn!("session id exceeds {MAX_SESSION_ID} bytes, resume disabled");
            }
        }
        tracing::trace!(name = event.name(), "event");
        on_event(self, &event);
    }

    async fn invalid_session(&mut self, resumable: bool) {
        if !self.session_id.is_empty() {
            if !resumable {
                tracing::trace!(session = %self.session_id, "failed to resume session");
                // clear so the next handshake identifies instead
                self.session_id.clear();
                self.ws.start_close(CLOSE_ABNORMAL);
                let wait = rand::thread_rng().gen_range(1000..5000);
                tokio::time::sleep(Duration::from_millis(wait)).await;
            }
            // resumable: the gateway closes the connection itself and
            // the stored session resumes on reconnect
        } else {
            self.ws.start_close(CLOSE_ABNORMAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameConfig, FrameDecoder};
    use crate::protocol::ConnectionState;
    use crate::stream::testing::Mem;
    use bytes::BytesMut;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_util::codec::Decoder as _;

    #[test]
    fn heartbeat_fires_once_per_interval() {
        let mut hb = Heartbeat::default();
        hb.start(45000);
        // nothing during the first 44 seconds
        let mut due = 0;
        for _ in 0..44 {
            if hb.tick(1000) == HeartbeatTick::Due {
                due += 1;
            }
        }
        assert_eq!(due, 0);
        // 45001 total loop-ms: exactly one beat owed
        assert_eq!(hb.tick(1001), HeartbeatTick::Due);
        // counter reset to the full interval
        assert_eq!(hb.remaining, 45000);
        assert_eq!(hb.tick(1000), HeartbeatTick::Idle);
    }

    #[test]
    fn heartbeat_idle_until_hello() {
        let mut hb = Heartbeat::default();
        assert_eq!(hb.tick(100_000), HeartbeatTick::Idle);
    }

    #[test]
    fn close_policy_matches_discord_ranges() {
        for code in [4000u16, 4001, 4002, 4003, 4005, 4007, 4008, 4009] {
            assert!(close_code_can_restart(code), "{code} should restart");
        }
        // authentication failure and the sharding/intent family are fatal
        for code in [4004u16, 4006, 4010, 4011, 4012, 4013, 4014, 1000, 1001, 1006, 3999] {
            assert!(!close_code_can_restart(code), "{code} should terminate");
        }
    }

    #[test]
    fn dispatch_names_map_to_variants() {
        let ev = Event::from_dispatch("MESSAGE_CREATE", serde_json::json!({"id": "1"})).unwrap();
        assert_eq!(ev.name(), "MESSAGE_CREATE");
        let ev = Event::from_dispatch("GUILD_SCHEDULED_EVENT_USER_REMOVE", Value::Null).unwrap();
        assert_eq!(ev.name(), "GUILD_SCHEDULED_EVENT_USER_REMOVE");
        let ev = Event::from_dispatch("RESUMED", Value::Null).unwrap();
        assert!(matches!(ev, Event::Resumed));
        assert!(Event::from_dispatch("NOT_A_REAL_EVENT", Value::Null).is_none());
    }

    #[test]
    fn ready_event_extracts_session_fields() {
        let ready = ReadyEvent::from_value(serde_json::json!({
            "v": 9,
            "session_id": "deadbeef",
            "shard": [1, 4],
            "user": {"id": "42"}
        }));
        assert_eq!(ready.v, 9);
        assert_eq!(ready.session_id, "deadbeef");
        assert_eq!(ready.shard, Some([1, 4]));
        assert_eq!(ready.data["user"]["id"], "42");
    }

    fn test_client(server_buffer: usize) -> (Client<Mem>, DuplexStream) {
        let (client_end, server_end) = tokio::io::duplex(server_buffer);
        let ws = WebSocket::after_handshake(Mem(client_end), BytesMut::new(), FrameConfig::default());
        let config = IdentifyConfig::new("<TOKEN>", Intents::GUILDS | Intents::GUILD_MESSAGES);
        let client = Client::new(ws, config, Duration::from_millis(20), SessionState::fresh());
        (client, server_end)
    }

    /// unmasked server-side frame bytes
    fn server_text(json: &Value) -> BytesMut {
        let payload = serde_json::to_vec(json).unwrap();
        let mut buf = BytesMut::new();
        crate::frame::encode_header(&mut buf, true, FrameOp::Text, None, payload.len() as u64);
        buf.extend_from_slice(&payload);
        buf
    }

    async fn read_client_frame(server: &mut DuplexStream, decoder: &mut FrameDecoder) -> Frame {
        let mut wire = BytesMut::new();
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = decoder.decode(&mut wire).unwrap() {
                return frame;
            }
            let n = server.read(&mut chunk).await.unwrap();
            assert_ne!(n, 0, "client hung up mid frame");
            wire.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn missing_ack_closes_abnormally_without_sending() {
        let (mut client, _server) = test_client(1024);
        client.heartbeat.start(45000);
        client.heartbeat.sent = 1;
        client.heartbeat.acked = 0;

        client.heartbeat().unwrap();

        assert_eq!(client.heartbeat.sent, 1, "no second heartbeat");
        assert_eq!(client.ws.state(), ConnectionState::Closed);
        assert_eq!(client.ws.pending(), 0, "1006 never goes on the wire");
    }

    #[tokio::test]
    async fn identify_handshake_ready_and_logout() {
        let (mut client, mut server) = test_client(64 * 1024);

        let server_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new(FrameConfig {
                accept_masked: true,
                ..Default::default()
            });

            server
                .write_all(&server_text(&serde_json::json!({
                    "op": 10, "d": {"heartbeat_interval": 45000}
                })))
                .await
                .unwrap();

            // with no stored session the next outbound frame must be IDENTIFY
            let frame = read_client_frame(&mut server, &mut decoder).await;
            let identify: Value = serde_json::from_slice(&frame.payload).unwrap();
            assert_eq!(identify["op"], 2);
            assert_eq!(identify["d"]["token"], "<TOKEN>");
            assert_eq!(identify["d"]["properties"]["$browser"], "Katachi");
            assert_eq!(identify["d"]["properties"]["$device"], "Katachi");
            assert_eq!(identify["d"]["intents"], 513);
            assert_eq!(identify["d"]["compress"], false);
            let threshold = identify["d"]["large_threshold"].as_u64().unwrap();
            assert!((50..=250).contains(&threshold));

            server
                .write_all(&server_text(&serde_json::json!({
                    "op": 0, "s": 1, "t": "READY",
                    "d": {"v": 9, "session_id": "abc123", "user": {"id": "7"}}
                })))
                .await
                .unwrap();

            // the handler logs out on READY: expect close 1000, echo it
            let frame = read_client_frame(&mut server, &mut decoder).await;
            assert_eq!(frame.opcode, FrameOp::Close);
            assert_eq!(frame.close_code(), Some(1000));
            let mut echo = BytesMut::new();
            crate::frame::encode_header(&mut echo, true, FrameOp::Close, None, 2);
            echo.extend_from_slice(&1000u16.to_be_bytes());
            server.write_all(&echo).await.unwrap();
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();
        let mut handler = move |client: &mut Client<Mem>, event: &Event| {
            seen_in_handler.lock().unwrap().push(event.name());
            if matches!(event, Event::Ready(_)) {
                assert_eq!(client.session_id(), "abc123");
                client.logout();
            }
        };

        client.run(&mut handler).await.unwrap();
        server_task.await.unwrap();

        let state = client.into_state();
        assert!(!state.login);
        assert_eq!(state.session_id, "abc123");
        assert_eq!(state.sequence, Some(1));
        assert_eq!(*seen.lock().unwrap(), vec!["HELLO", "READY"]);
    }

    #[tokio::test]
    async fn resume_is_sent_when_a_session_is_stored() {
        let (client_end, mut server) = tokio::io::duplex(64 * 1024);
        let ws = WebSocket::after_handshake(Mem(client_end), BytesMut::new(), FrameConfig::default());
        let config = IdentifyConfig::new("<TOKEN>", Intents::GUILDS);
        let mut state = SessionState::fresh();
        state.session_id = "stored-session".to_string();
        state.sequence = Some(42);
        let mut client = Client::new(ws, config, Duration::from_millis(20), state);

        let server_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new(FrameConfig {
                accept_masked: true,
                ..Default::default()
            });
            server
                .write_all(&server_text(&serde_json::json!({
                    "op": 10, "d": {"heartbeat_interval": 45000}
                })))
                .await
                .unwrap();
            let frame = read_client_frame(&mut server, &mut decoder).await;
            let resume: Value = serde_json::from_slice(&frame.payload).unwrap();
            assert_eq!(resume["op"], 6);
            assert_eq!(resume["d"]["session_id"], "stored-session");
            assert_eq!(resume["d"]["seq"], 42);
            // terminate so run returns
            server.shutdown().await.unwrap();
        });

        let mut handler = |_c: &mut Client<Mem>, _e: &Event| {};
        client.run(&mut handler).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_session_not_resumable_clears_and_waits() {
        let (client_end, mut server) = tokio::io::duplex(64 * 1024);
        let ws = WebSocket::after_handshake(Mem(client_end), BytesMut::new(), FrameConfig::default());
        let config = IdentifyConfig::new("<TOKEN>", Intents::GUILDS);
        let mut state = SessionState::fresh();
        state.session_id = "doomed".to_string();
        let mut client = Client::new(ws, config, Duration::from_millis(20), state);

        let server_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new(FrameConfig {
                accept_masked: true,
                ..Default::default()
            });
            server
                .write_all(&server_text(&serde_json::json!({
                    "op": 10, "d": {"heartbeat_interval": 45000}
                })))
                .await
                .unwrap();
            // swallow the RESUME attempt
            let frame = read_client_frame(&mut server, &mut decoder).await;
            let resume: Value = serde_json::from_slice(&frame.payload).unwrap();
            assert_eq!(resume["op"], 6);
            server
                .write_all(&server_text(&serde_json::json!({"op": 9, "d": false})))
                .await
                .unwrap();
            // the client tears down without a close frame
            let mut rest = Vec::new();
            server.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty(), "1006 must not reach the wire");
        });

        let start = Instant::now();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();
        let mut handler = move |_c: &mut Client<Mem>, event: &Event| {
            seen_in_handler.lock().unwrap().push(event.name());
        };
        client.run(&mut handler).await.unwrap();
        server_task.await.unwrap();

        // slept between one and five seconds before returning
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(1000), "waited {waited:?}");
        assert!(waited < Duration::from_millis(5500), "waited {waited:?}");

        let state = client.into_state();
        assert!(state.login, "a cleared session reconnects and identifies");
        assert!(state.session_id.is_empty());
        assert!(seen.lock().unwrap().contains(&"INVALID_SESSION"));
    }

    #[tokio::test]
    async fn reconnect_request_closes_abnormally_for_resume() {
        let (mut client, mut server) = test_client(64 * 1024);

        let server_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new(FrameConfig {
                accept_masked: true,
                ..Default::default()
            });
            server
                .write_all(&server_text(&serde_json::json!({
                    "op": 10, "d": {"heartbeat_interval": 45000}
                })))
                .await
                .unwrap();
            let frame = read_client_frame(&mut server, &mut decoder).await;
            assert_eq!(
                serde_json::from_slice::<Value>(&frame.payload).unwrap()["op"],
                2
            );
            server
                .write_all(&server_text(&serde_json::json!({"op": 7, "d": null})))
                .await
                .unwrap();
            let mut rest = Vec::new();
            server.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty(), "no close frame for an abnormal closure");
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();
        let mut handler = move |_c: &mut Client<Mem>, event: &Event| {
            seen_in_handler.lock().unwrap().push(event.name());
        };
        client.run(&mut handler).await.unwrap();
        server_task.await.unwrap();

        let state = client.into_state();
        assert!(state.login, "reconnect keeps the login loop alive");
        assert!(seen.lock().unwrap().contains(&"RECONNECT"));
    }

    async fn hello_identify_then_close(mut server: DuplexStream, code: u16) {
        let mut decoder = FrameDecoder::new(FrameConfig {
            accept_masked: true,
            ..Default::default()
        });
        server
            .write_all(&server_text(&serde_json::json!({
                "op": 10, "d": {"heartbeat_interval": 45000}
            })))
            .await
            .unwrap();
        let _identify = read_client_frame(&mut server, &mut decoder).await;
        let mut close = BytesMut::new();
        crate::frame::encode_header(&mut close, true, FrameOp::Close, None, 2);
        close.extend_from_slice(&code.to_be_bytes());
        server.write_all(&close).await.unwrap();
        // expect the echo with the same code
        let frame = read_client_frame(&mut server, &mut decoder).await;
        assert_eq!(frame.close_code(), Some(code));
    }

    #[tokio::test]
    async fn fatal_close_code_terminates_login_with_an_error() {
        let (mut client, server) = test_client(64 * 1024);
        // authentication failed
        let server_task = tokio::spawn(hello_identify_then_close(server, 4004));

        let mut handler = |_c: &mut Client<Mem>, _e: &Event| {};
        let err = client.run(&mut handler).await.unwrap_err();
        assert!(matches!(err, Error::FatalClose { code: 4004, .. }));
        server_task.await.unwrap();
        assert!(!client.into_state().login);
    }

    #[tokio::test]
    async fn restartable_close_code_keeps_login_alive() {
        let (mut client, server) = test_client(64 * 1024);
        // unknown error, safe to resume
        let server_task = tokio::spawn(hello_identify_then_close(server, 4000));

        let mut handler = |_c: &mut Client<Mem>, _e: &Event| {};
        client.run(&mut handler).await.unwrap();
        server_task.await.unwrap();
        assert!(client.into_state().login);
    }

    #[tokio::test]
    async fn first_payload_must_be_hello() {
        let (mut client, mut server) = test_client(64 * 1024);
        tokio::spawn(async move {
            server
                .write_all(&server_text(
                    &serde_json::json!({"op": 11, "d": null}),
                ))
                .await
                .unwrap();
            let _ = server.read_u8().await;
        });
        let mut handler = |_c: &mut Client<Mem>, _e: &Event| {};
        let err = client.run(&mut handler).await.unwrap_err();
        assert!(matches!(err, Error::Gateway(_)));
        assert!(!client.into_state().login);
    }

    #[tokio::test]
    async fn heartbeat_request_is_answered_immediately() {
        let (mut client, mut server) = test_client(64 * 1024);

        let server_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new(FrameConfig {
                accept_masked: true,
                ..Default::default()
            });
            server
                .write_all(&server_text(&serde_json::json!({
                    "op": 10, "d": {"heartbeat_interval": 45000}
                })))
                .await
                .unwrap();
            let _identify = read_client_frame(&mut server, &mut decoder).await;
            server
                .write_all(&server_text(&serde_json::json!({"op": 1, "d": null})))
                .await
                .unwrap();
            let beat = read_client_frame(&mut server, &mut decoder).await;
            let beat: Value = serde_json::from_slice(&beat.payload).unwrap();
            assert_eq!(beat["op"], 1);
            assert!(beat["d"].is_null(), "no dispatch seen, d is null");
            server.shutdown().await.unwrap();
        });

        let mut handler = |_c: &mut Client<Mem>, _e: &Event| {};
        client.run(&mut handler).await.unwrap();
        server_task.await.unwrap();
    }
}
