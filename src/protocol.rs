use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use std::time::Duration;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{FrameCodec, FrameConfig, DEFAULT_RING_SIZE};
use crate::errors::Error;
use crate::frame::{Frame, OpCode};
use crate::http::{build_request, BodySink, Headers, HeaderId, HttpClient, QueryParams, Request, Response};
use crate::stream::{Socket, Transport};

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// endpoint going away
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// protocol violation
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// abnormal closure. reserved: synthesized locally, never on the wire
pub const CLOSE_ABNORMAL: u16 = 1006;

/// connection lifecycle of a [`WebSocket`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Running,
    /// a close frame went out, waiting for the peer echo
    Closing,
    Closed,
}

fn gen_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

fn cal_accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID);
    BASE64.encode(sha1.finalize())
}

/// a websocket endpoint address. accepts `ws://`, `wss://` or a bare
/// `host[:port][/path]`; an explicit port always wins, otherwise the
/// scheme picks 443/80, and a bare uri infers tls from the port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUri {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub path: String,
}

impl WsUri {
    pub fn parse(uri: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidUri(uri.to_string());

        let (rest, mut secure, explicit_scheme) =
            if let Some(rest) = strip_prefix_icase(uri, "wss://") {
                (rest, true, true)
            } else if let Some(rest) = strip_prefix_icase(uri, "ws://") {
                (rest, false, true)
            } else {
                (uri, true, false)
            };

        let colon = rest.find(':');
        let slash = rest.find('/');
        if let (Some(colon), Some(slash)) = (colon, slash) {
            if colon > slash {
                return Err(invalid());
            }
        }

        let (host, port_str, path) = match colon {
            Some(colon) => {
                if colon == 0 {
                    return Err(invalid());
                }
                let host = &rest[..colon];
                match slash {
                    Some(slash) => (host, &rest[colon + 1..slash], &rest[slash..]),
                    None => (host, &rest[colon + 1..], "/"),
                }
            }
            None => match slash {
                Some(slash) => (&rest[..slash], "", &rest[slash..]),
                None => (rest, "", "/"),
            },
        };
        if host.is_empty() {
            return Err(invalid());
        }

        let port = if port_str.is_empty() {
            if secure {
                443
            } else {
                80
            }
        } else if port_str.eq_ignore_ascii_case("https") {
            443
        } else if port_str.eq_ignore_ascii_case("http") {
            80
        } else {
            port_str.parse().map_err(|_| invalid())?
        };

        if !explicit_scheme && !port_str.is_empty() {
            secure = port == 443;
        }

        Ok(Self {
            host: host.to_string(),
            port,
            secure,
            path: path.to_string(),
        })
    }

    /// value for the Host request header
    pub fn host_header(&self) -> String {
        let default = if self.secure { 443 } else { 80 };
        if self.port == default {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn strip_prefix_icase<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// whether every item the server returned was offered by the client.
/// extensions use `;` separated `name=value` assignments with value
/// subset semantics, protocols use plain `,` separated tokens.
fn values_present(server: &str, offered: &str, delim: char, assignment: bool) -> bool {
    if server.is_empty() {
        return true;
    }
    for item in server.split(delim) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let found = if assignment {
            match item.split_once('=') {
                Some((name, value)) => {
                    let name = name.trim();
                    let value = value.trim();
                    offered.split(delim).any(|off| match off.trim().split_once('=') {
                        Some((on, ov)) => on.trim().eq_ignore_ascii_case(name) && ov.contains(value),
                        None => false,
                    })
                }
                None => offered.split(delim).any(|off| {
                    let off = off.trim();
                    off.eq_ignore_ascii_case(item)
                        || off
                            .split_once('=')
                            .map(|(n, _)| n.trim().eq_ignore_ascii_case(item))
                            .unwrap_or(false)
                }),
            }
        } else {
            offered
                .split(delim)
                .any(|off| off.trim().eq_ignore_ascii_case(item))
        };
        if !found {
            return false;
        }
    }
    true
}

/// perform the client side of the http upgrade over an established
/// transport. returns the transport, any bytes read past the response
/// head (already websocket frames) and the parsed 101 response.
pub async fn client_handshake<T: Transport>(
    transport: T,
    uri: &WsUri,
    params: &QueryParams,
    extra_headers: &Headers,
    protocols: &str,
    extensions: &str,
    version: u8,
) -> Result<(T, BytesMut, Response), Error> {
    let key = gen_key();
    let accept_key = cal_accept_key(&key);

    let mut req = Request::new();
    req.headers = extra_headers.clone();
    req.headers.set(HeaderId::Host, uri.host_header());
    req.headers.set(HeaderId::Upgrade, "websocket");
    req.headers.set(HeaderId::Connection, "Upgrade");
    req.headers.set_raw("Sec-WebSocket-Key", key.clone())?;
    req.headers
        .set_raw("Sec-WebSocket-Version", version.to_string())?;
    if !protocols.is_empty() {
        req.headers.set_raw("Sec-WebSocket-Protocol", protocols)?;
    }
    if !extensions.is_empty() {
        req.headers
            .set_raw("Sec-WebSocket-Extensions", extensions)?;
    }

    let mut http = HttpClient::from_transport(transport, uri.host.clone(), uri.port);
    let mut head = BytesMut::new();
    build_request("GET", &uri.path, params, &req, &mut head)?;
    http.send_request(&head, crate::http::BodySource::None).await?;
    let resp = http.receive_response(BodySink::Buffer).await?;

    if resp.status != 101 {
        return Err(Error::HandshakeFailed(format!(
            "expect 101 response, got {} {}",
            resp.status, resp.reason
        )));
    }
    let upgrade = resp.headers.get(HeaderId::Upgrade).unwrap_or_default();
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(Error::HandshakeFailed(
            "missing or invalid Upgrade header".to_string(),
        ));
    }
    let connection = resp.headers.get(HeaderId::Connection).unwrap_or_default();
    if !connection.eq_ignore_ascii_case("upgrade") {
        return Err(Error::HandshakeFailed(
            "missing or invalid Connection header".to_string(),
        ));
    }
    match resp.headers.get_raw("Sec-WebSocket-Accept") {
        Some(got) if got == accept_key => {}
        Some(got) => {
            return Err(Error::HandshakeFailed(format!(
                "mismatch accept key, expect {accept_key}, got {got}"
            )))
        }
        None => {
            return Err(Error::HandshakeFailed(
                "missing Sec-WebSocket-Accept header".to_string(),
            ))
        }
    }

    let server_extensions = resp.headers.get_raw("Sec-WebSocket-Extensions").unwrap_or_default();
    let server_protocols = resp.headers.get_raw("Sec-WebSocket-Protocol").unwrap_or_default();
    if extensions.is_empty() && protocols.is_empty() {
        if !server_extensions.is_empty() || !server_protocols.is_empty() {
            return Err(Error::HandshakeFailed(
                "server negotiated unrequested extension or protocol".to_string(),
            ));
        }
    } else {
        if !values_present(server_extensions, extensions, ';', true) {
            return Err(Error::HandshakeFailed(format!(
                "unsupported extensions sent by server: {server_extensions}"
            )));
        }
        if !values_present(server_protocols, protocols, ',', false) {
            return Err(Error::HandshakeFailed(format!(
                "unsupported protocols sent by server: {server_protocols}"
            )));
        }
    }

    tracing::debug!(host = %uri.host, "protocol handshake complete");
    let (transport, remain) = http.into_parts();
    Ok((transport, remain, resp))
}

/// what one driver iteration produced
#[derive(Debug)]
pub enum WsEvent {
    /// a complete data message
    Frame(Frame),
    /// the connection is over. `by_peer` is set when the code came in
    /// a close frame from the server rather than being synthesized
    Close {
        code: u16,
        reason: Bytes,
        by_peer: bool,
    },
    /// the tick elapsed with nothing to deliver
    Tick,
}

/// frame-level connection driver: owns the transport, the read/write
/// rings and the codec. pings are answered, pongs are discarded and a
/// peer close is echoed with the same code before the connection is
/// declared over.
#[derive(Debug)]
pub struct WebSocket<T> {
    transport: T,
    codec: FrameCodec,
    read_ring: BytesMut,
    write_ring: BytesMut,
    queue_limit: usize,
    state: ConnectionState,
    local_close: Option<u16>,
}

impl<T: Transport> WebSocket<T> {
    /// wrap an upgraded transport. `remain` carries bytes the
    /// handshake read past the 101 response head.
    pub fn after_handshake(transport: T, remain: BytesMut, config: FrameConfig) -> Self {
        Self::with_capacity(
            transport,
            remain,
            config,
            DEFAULT_RING_SIZE,
            DEFAULT_RING_SIZE,
            DEFAULT_RING_SIZE * 4,
        )
    }

    pub fn with_capacity(
        transport: T,
        remain: BytesMut,
        config: FrameConfig,
        read_size: usize,
        write_size: usize,
        queue_limit: usize,
    ) -> Self {
        let mut read_ring = BytesMut::with_capacity(read_size.max(remain.len()));
        read_ring.extend_from_slice(&remain);
        Self {
            transport,
            codec: FrameCodec::new(config),
            read_ring,
            write_ring: BytesMut::with_capacity(write_size),
            queue_limit,
            state: ConnectionState::Running,
            local_close: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state != ConnectionState::Closed
    }

    /// bytes queued but not yet written out
    pub fn pending(&self) -> usize {
        self.write_ring.len()
    }

    /// enqueue a frame into the write ring. it goes out on the next
    /// flush, which the driver loop performs whenever the ring has
    /// pending bytes.
    pub fn send(&mut self, frame: Frame) -> Result<(), Error> {
        if self.state != ConnectionState::Running {
            return Err(Error::InvalidConnState(self.state));
        }
        self.codec.encode(frame, &mut self.write_ring)?;
        if self.write_ring.len() > self.queue_limit {
            tracing::warn!(
                pending = self.write_ring.len(),
                limit = self.queue_limit,
                "write ring above its configured capacity"
            );
        }
        Ok(())
    }

    pub fn send_text(&mut self, data: &str) -> Result<(), Error> {
        self.send(Frame::text(data))
    }

    /// begin the close handshake. 1006 is reserved for abnormal
    /// closure and never leaves the host: the connection is torn down
    /// without a close frame so the session can be resumed.
    pub fn start_close(&mut self, code: u16) {
        match self.state {
            ConnectionState::Running => {
                self.local_close = Some(code);
                if code == CLOSE_ABNORMAL {
                    self.state = ConnectionState::Closed;
                } else {
                    // direct encode, send() refuses non-running states
                    let _ = self
                        .codec
                        .encode(Frame::close(code, b""), &mut self.write_ring);
                    self.state = ConnectionState::Closing;
                }
            }
            ConnectionState::Closing if code == CLOSE_ABNORMAL => {
                self.state = ConnectionState::Closed;
            }
            _ => {}
        }
    }

    /// drain the write ring
    pub async fn flush(&mut self) -> Result<(), Error> {
        if !self.write_ring.is_empty() {
            let out = self.write_ring.split();
            self.transport.write_all(&out).await?;
        }
        Ok(())
    }

    /// advance the connection by at most one delivered event. drains
    /// pending writes, then decodes buffered frames, then reads with
    /// the tick budget.
    pub async fn receive(&mut self, tick: Option<Duration>) -> Result<WsEvent, Error> {
        loop {
            self.flush().await?;

            if self.state == ConnectionState::Closed {
                return Ok(WsEvent::Close {
                    code: self.local_close.unwrap_or(CLOSE_ABNORMAL),
                    reason: Bytes::new(),
                    by_peer: false,
                });
            }

            let decoded = match self.codec.decode(&mut self.read_ring) {
                Ok(frame) => frame,
                Err(e) => {
                    if let Error::Protocol { close_code, .. } = &e {
                        self.start_close(*close_code);
                        let _ = self.flush().await;
                    }
                    self.state = ConnectionState::Closed;
                    return Err(e);
                }
            };

            match decoded {
                Some(frame) => match frame.opcode {
                    OpCode::Ping => {
                        if self.state == ConnectionState::Running {
                            let _ = self
                                .codec
                                .encode(Frame::pong(&frame.payload), &mut self.write_ring);
                        }
                    }
                    OpCode::Pong => {}
                    OpCode::Close => {
                        let code = frame.close_code();
                        if self.state == ConnectionState::Running {
                            // echo the same 2 byte code, then terminate
                            let echo = match code {
                                Some(code) => Frame::close(code, b""),
                                None => Frame::new(OpCode::Close, Bytes::new()),
                            };
                            let _ = self.codec.encode(echo, &mut self.write_ring);
                        }
                        let _ = self.flush().await;
                        self.state = ConnectionState::Closed;
                        let reason = if frame.payload.len() > 2 {
                            frame.payload.slice(2..)
                        } else {
                            Bytes::new()
                        };
                        return Ok(WsEvent::Close {
                            code: code.unwrap_or(1005),
                            reason,
                            by_peer: true,
                        });
                    }
                    _ => return Ok(WsEvent::Frame(frame)),
                },
                None => {
                    match self
                        .transport
                        .read_buf_timeout(&mut self.read_ring, tick)
                        .await?
                    {
                        None => return Ok(WsEvent::Tick),
                        Some(0) => {
                            self.state = ConnectionState::Closed;
                            return Ok(WsEvent::Close {
                                code: self.local_close.unwrap_or(CLOSE_ABNORMAL),
                                reason: Bytes::new(),
                                by_peer: false,
                            });
                        }
                        Some(_) => {}
                    }
                }
            }
        }
    }

    /// release the transport
    pub async fn shutdown(&mut self) {
        self.state = ConnectionState::Closed;
        self.transport.close().await;
    }
}

/// helper builder to construct a websocket client connection
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    protocols: Vec<String>,
    extensions: Vec<String>,
    version: u8,
    headers: Headers,
    params: QueryParams,
    config: FrameConfig,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            protocols: vec![],
            extensions: vec![],
            version: 13,
            headers: Headers::new(),
            params: QueryParams::new(),
            config: FrameConfig::default(),
        }
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    /// offer a subprotocol
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    /// offer an extension in the handshake
    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extensions.push(extension.into());
        self
    }

    pub fn header(mut self, id: HeaderId, value: impl Into<String>) -> Self {
        self.headers.set(id, value);
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Result<Self, Error> {
        self.params.set(name, value)?;
        Ok(self)
    }

    pub fn frame_config(mut self, config: FrameConfig) -> Self {
        self.config = config;
        self
    }

    /// resolve, connect, upgrade
    pub async fn connect(&self, uri: &str) -> Result<WebSocket<Socket>, Error> {
        let parsed = WsUri::parse(uri)?;
        let socket = Socket::connect(&parsed.host, parsed.port, parsed.secure).await?;
        let (transport, remain, _resp) = client_handshake(
            socket,
            &parsed,
            &self.params,
            &self.headers,
            &self.protocols.join(", "),
            &self.extensions.join("; "),
            self.version,
        )
        .await?;
        Ok(WebSocket::after_handshake(transport, remain, self.config.clone()))
    }
}
