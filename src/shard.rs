use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde_json::Value;

use crate::codec::{FrameConfig, DEFAULT_MAX_PAYLOAD, DEFAULT_RING_SIZE};
use crate::errors::Error;
use crate::gateway::{
    Client, Event, IdentifyConfig, Intents, PresenceUpdate, SessionState, USER_AGENT,
};
use crate::http::{Headers, HeaderId, HttpClient, QueryParams, Request, Response};
use crate::protocol::{client_handshake, WebSocket, WsUri};
use crate::stream::Socket;

/// rest origin for gateway discovery
pub const API_BASE: &str = "https://discord.com";

/// per shard tuning knobs. values below the defaults are raised to
/// them when a session starts.
#[derive(Debug, Clone)]
pub struct ClientSpec {
    /// cap on one decoded frame payload
    pub scratch_size: usize,
    /// inbound ring capacity
    pub read_size: usize,
    /// outbound ring capacity
    pub write_size: usize,
    /// outbound bytes tolerated before the driver complains
    pub queue_size: usize,
    /// poll budget of one loop iteration, in ms
    pub tick_ms: u64,
    /// `[shard_id, shard_count]`
    pub shard: [u32; 2],
}

impl Default for ClientSpec {
    fn default() -> Self {
        Self {
            scratch_size: DEFAULT_MAX_PAYLOAD,
            read_size: DEFAULT_RING_SIZE,
            write_size: DEFAULT_RING_SIZE,
            queue_size: DEFAULT_RING_SIZE * 4,
            tick_ms: 100,
            shard: [0, 0],
        }
    }
}

impl ClientSpec {
    fn clamped(&self) -> ClientSpec {
        let d = ClientSpec::default();
        ClientSpec {
            scratch_size: self.scratch_size.max(d.scratch_size),
            read_size: self.read_size.max(d.read_size),
            write_size: self.write_size.max(d.write_size),
            queue_size: self.queue_size.max(d.queue_size),
            tick_ms: self.tick_ms,
            shard: self.shard,
        }
    }
}

/// per shard overrides plus the default everyone else inherits
#[derive(Debug, Clone, Default)]
pub struct ShardSpec {
    pub default_spec: ClientSpec,
    pub specs: Vec<ClientSpec>,
}

impl ShardSpec {
    fn for_shard(&self, shard_id: u32, shard_count: u32) -> ClientSpec {
        match self.specs.get(shard_id as usize) {
            Some(spec) => spec.clone(),
            None => {
                let mut spec = self.default_spec.clone();
                spec.shard = [shard_id, shard_count];
                spec
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartLimit {
    pub total: i64,
    pub remaining: i64,
    pub reset_after: i64,
    pub max_concurrency: u32,
}

/// `GET /api/v10/gateway/bot` response
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBot {
    pub url: String,
    pub shards: i32,
    pub session_start_limit: SessionStartLimit,
}

/// a 200 yields the body, anything else surfaces the `message` field
fn api_body(res: Response) -> Result<Value, Error> {
    let body: Value = serde_json::from_slice(&res.body)?;
    if res.status != 200 {
        let msg = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(Error::Gateway(format!(
            "connection error; code {}: {}",
            res.status, msg
        )));
    }
    Ok(body)
}

async fn api_get(endpoint: &str, authorization: Option<&str>) -> Result<Value, Error> {
    let mut http = HttpClient::connect(API_BASE).await?;
    let mut req = Request::new();
    if let Some(auth) = authorization {
        req.headers.set(HeaderId::Authorization, auth);
    }
    req.headers.set(HeaderId::UserAgent, USER_AGENT);
    let res = http.get(endpoint, &QueryParams::new(), &req).await;
    http.close().await;
    api_body(res?)
}

/// ask the rest api where the gateway lives
pub async fn gateway_url() -> Result<String, Error> {
    let body = api_get("/api/v10/gateway", None).await?;
    body.get("url")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Gateway("gateway response missing url".to_string()))
}

/// gateway address plus the recommended shard count and the identify
/// rate limits for this bot
pub async fn gateway_bot(token: &str) -> Result<GatewayBot, Error> {
    let auth = format!("Bot {token}");
    let body = api_get("/api/v10/gateway/bot", Some(&auth)).await?;
    serde_json::from_value(body).map_err(Error::from)
}

/// `min(2^attempt, 32)` seconds plus up to one second of jitter
async fn reconnect_backoff(attempt: u32) {
    let wait_secs = 1u64 << attempt.min(5);
    tracing::info!(secs = wait_secs, "reconnect after backoff");
    let wait = wait_secs * 1000 + rand::thread_rng().gen_range(0..1000);
    tokio::time::sleep(Duration::from_millis(wait)).await;
    tracing::info!("reconnecting");
}

async fn connect_gateway(token: &str, spec: &ClientSpec) -> Result<WebSocket<Socket>, Error> {
    let url = gateway_url().await?;
    let uri = WsUri::parse(&url)?;
    let socket = Socket::connect(&uri.host, uri.port, uri.secure).await?;

    let mut headers = Headers::new();
    headers.set(HeaderId::Authorization, format!("Bot {token}"));
    headers.set(HeaderId::UserAgent, USER_AGENT);
    let mut params = QueryParams::new();
    params.set("v", "9")?;
    params.set("encoding", "json")?;

    let (transport, remain, _resp) =
        client_handshake(socket, &uri, &params, &headers, "", "", 13).await?;

    let config = FrameConfig {
        max_payload: spec.scratch_size,
        ..Default::default()
    };
    Ok(WebSocket::with_capacity(
        transport,
        remain,
        config,
        spec.read_size,
        spec.write_size,
        spec.queue_size,
    ))
}

/// run one gateway session loop on the calling task: discover the
/// gateway, connect, hand frames to the state machine, reconnect with
/// backoff until the session terminates.
pub async fn login<F>(
    token: impl Into<String>,
    intents: Intents,
    mut on_event: F,
    presence: Option<PresenceUpdate>,
    spec: ClientSpec,
) -> Result<(), Error>
where
    F: FnMut(&mut Client<Socket>, &Event) + Send,
{
    let token = token.into();
    let spec = spec.clamped();
    let mut config = IdentifyConfig::new(token.clone(), intents);
    config.shard = spec.shard;
    config.presence = presence;

    let mut state = SessionState::fresh();
    while state.login {
        let mut attempt = 0u32;
        let ws = loop {
            match connect_gateway(&token, &spec).await {
                Ok(ws) => break ws,
                Err(e) => {
                    tracing::warn!(error = %e, "gateway connection failed");
                    reconnect_backoff(attempt).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        };

        let mut client = Client::new(
            ws,
            config.clone(),
            Duration::from_millis(spec.tick_ms),
            state,
        );
        let outcome = client.run(&mut on_event).await;
        state = client.into_state();
        match outcome {
            Ok(()) => {}
            Err(e @ (Error::Gateway(_) | Error::FatalClose { .. })) => {
                tracing::error!(error = %e, "shard terminated");
                return Err(e);
            }
            // transport or protocol failure: the connection is gone,
            // the session may still resume
            Err(e) => tracing::warn!(error = %e, "session dropped"),
        }
    }
    // only a logout-initiated stop reaches here
    Ok(())
}

/// seconds to wait before launching `shard_id`, given the bucket size.
/// one shard per `rate_limit_key == 0` bucket may start every 5 s.
fn launch_delay_secs(shard_id: u32, max_concurrency: u32) -> u64 {
    if shard_id != 0 && shard_id % max_concurrency == 0 {
        5
    } else {
        0
    }
}

/// start `shard_count` parallel sessions (server recommendation when
/// `shard_count <= 0`). shards 0..n-1 run on spawned tasks, the last
/// shard runs on the calling task; the call returns when every shard
/// has terminated.
pub async fn login_sharded<F>(
    token: impl Into<String>,
    intents: Intents,
    on_event: F,
    presence: Option<PresenceUpdate>,
    shard_count: i32,
    specs: ShardSpec,
) -> Result<(), Error>
where
    F: FnMut(&mut Client<Socket>, &Event) + Send + Clone + 'static,
{
    let token = token.into();

    let mut attempt = 0u32;
    let info = loop {
        match gateway_bot(&token).await {
            Ok(info) => break info,
            Err(e) => {
                tracing::warn!(error = %e, "gateway discovery failed");
                reconnect_backoff(attempt).await;
                attempt = attempt.saturating_add(1);
            }
        }
    };

    let shard_count = if shard_count <= 0 {
        info.shards.max(1) as u32
    } else {
        shard_count as u32
    };
    let max_concurrency = info.session_start_limit.max_concurrency.max(1);
    if info.session_start_limit.remaining == 0 {
        tracing::warn!("session start limit exhausted, identifies will be rejected");
    }
    tracing::debug!(shard_count, max_concurrency, "launching shards");

    let mut handles = Vec::new();
    let mut last_result = Ok(());
    for shard_id in 0..shard_count {
        let delay = launch_delay_secs(shard_id, max_concurrency);
        if delay > 0 {
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
        let spec = specs.for_shard(shard_id, shard_count);
        if shard_id == shard_count - 1 {
            // the final shard runs on the caller's task and owns the presence
            last_result = login(
                token.clone(),
                intents,
                on_event.clone(),
                presence.clone(),
                spec,
            )
            .await;
        } else {
            let token = token.clone();
            let on_event = on_event.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = login(token, intents, on_event, None, spec).await {
                    tracing::error!(error = %e, "shard exited with error");
                }
            }));
        }
    }

    for handle in handles {
        let _ = handle.await;
    }
    last_result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_schedule_honors_concurrency_buckets() {
        // six shards, two identify buckets: the key==0 bucket pays 5s
        // before shards 2 and 4, everyone else launches with its peer
        let mut t = 0u64;
        let times: Vec<u64> = (0..6)
            .map(|id| {
                t += launch_delay_secs(id, 2);
                t
            })
            .collect();
        assert_eq!(times, vec![0, 0, 5, 5, 10, 10]);
    }

    #[test]
    fn launch_schedule_with_single_bucket() {
        let mut t = 0u64;
        let times: Vec<u64> = (0..4)
            .map(|id| {
                t += launch_delay_secs(id, 1);
                t
            })
            .collect();
        assert_eq!(times, vec![0, 5, 10, 15]);
    }

    #[test]
    fn shard_spec_fills_in_identity() {
        let specs = ShardSpec {
            default_spec: ClientSpec::default(),
            specs: vec![ClientSpec {
                tick_ms: 7,
                ..Default::default()
            }],
        };
        // explicit override is taken verbatim
        assert_eq!(specs.for_shard(0, 6).tick_ms, 7);
        // everyone else inherits the default with their identity filled
        let spec = specs.for_shard(3, 6);
        assert_eq!(spec.shard, [3, 6]);
        assert_eq!(spec.tick_ms, 100);
    }

    #[test]
    fn undersized_spec_values_are_raised() {
        let spec = ClientSpec {
            scratch_size: 16,
            read_size: 16,
            write_size: 16,
            queue_size: 16,
            tick_ms: 5,
            shard: [1, 2],
        }
        .clamped();
        let d = ClientSpec::default();
        assert_eq!(spec.scratch_size, d.scratch_size);
        assert_eq!(spec.read_size, d.read_size);
        assert_eq!(spec.queue_size, d.queue_size);
        // the tick is the caller's business
        assert_eq!(spec.tick_ms, 5);
        assert_eq!(spec.shard, [1, 2]);
    }

    #[test]
    fn gateway_bot_payload_parses() {
        let body = serde_json::json!({
            "url": "wss://gateway.discord.gg",
            "shards": 9,
            "session_start_limit": {
                "total": 1000,
                "remaining": 999,
                "reset_after": 14400000,
                "max_concurrency": 1
            }
        });
        let info: GatewayBot = serde_json::from_value(body).unwrap();
        assert_eq!(info.url, "wss://gateway.discord.gg");
        assert_eq!(info.shards, 9);
        assert_eq!(info.session_start_limit.max_concurrency, 1);
    }

    #[test]
    fn non_200_surfaces_the_message_field() {
        let res = Response {
            version: crate::http::Version::Http11,
            status: 401,
            reason: "Unauthorized".to_string(),
            headers: Headers::new(),
            body: bytes::BytesMut::from(&br#"{"message": "401: Unauthorized", "code": 0}"#[..]),
        };
        let err = api_body(res).unwrap_err();
        assert!(err.to_string().contains("401: Unauthorized"));

        let res = Response {
            version: crate::http::Version::Http11,
            status: 200,
            reason: "OK".to_string(),
            headers: Headers::new(),
            body: bytes::BytesMut::from(&br#"{"url": "wss://gateway.discord.gg"}"#[..]),
        };
        assert_eq!(api_body(res).unwrap()["url"], "wss://gateway.discord.gg");
    }
}
