use bytes::{Buf, BytesMut};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::errors::{Error, ProtocolError};
use crate::stream::{Socket, Transport};

/// a request head (request line + headers) may not exceed this
pub const MAX_HEADER_SIZE: usize = 8 * 1024;
/// unrecognized headers kept as raw name/value pairs, at most this many
pub const MAX_RAW_HEADERS: usize = 64;
/// ordered query parameters per request, at most this many
pub const MAX_QUERY_PARAMS: usize = 8;

macro_rules! header_ids {
    ($(($variant:ident, $name:literal),)*) => {
        /// headers recognized by their canonical spelling. anything else
        /// round-trips through the raw list.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(usize)]
        pub enum HeaderId {
            $($variant,)*
        }

        impl HeaderId {
            pub const COUNT: usize = [$(HeaderId::$variant,)*].len();
            pub const ALL: [HeaderId; Self::COUNT] = [$(HeaderId::$variant,)*];

            /// canonical on-wire spelling
            pub fn canonical(self) -> &'static str {
                match self {
                    $(HeaderId::$variant => $name,)*
                }
            }

            /// exact, case sensitive match against the canonical form
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(HeaderId::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

header_ids! {
    (CacheControl, "Cache-Control"),
    (Connection, "Connection"),
    (Date, "Date"),
    (KeepAlive, "Keep-Alive"),
    (Pragma, "Pragma"),
    (Trailer, "Trailer"),
    (TransferEncoding, "Transfer-Encoding"),
    (Upgrade, "Upgrade"),
    (Via, "Via"),
    (Warning, "Warning"),
    (Allow, "Allow"),
    (ContentLength, "Content-Length"),
    (ContentType, "Content-Type"),
    (ContentEncoding, "Content-Encoding"),
    (ContentLanguage, "Content-Language"),
    (ContentLocation, "Content-Location"),
    (ContentMd5, "Content-MD5"),
    (ContentRange, "Content-Range"),
    (Expires, "Expires"),
    (LastModified, "Last-Modified"),
    (Accept, "Accept"),
    (AcceptCharset, "Accept-Charset"),
    (AcceptEncoding, "Accept-Encoding"),
    (AcceptLanguage, "Accept-Language"),
    (Authorization, "Authorization"),
    (Cookie, "Cookie"),
    (Expect, "Expect"),
    (From, "From"),
    (Host, "Host"),
    (IfMatch, "If-Match"),
    (IfModifiedSince, "If-Modified-Since"),
    (IfNoneMatch, "If-None-Match"),
    (IfRange, "If-Range"),
    (IfUnmodifiedSince, "If-Unmodified-Since"),
    (MaxForwards, "Max-Forwards"),
    (ProxyAuthorization, "Proxy-Authorization"),
    (Referer, "Referer"),
    (Range, "Range"),
    (Te, "TE"),
    (Translate, "Translate"),
    (UserAgent, "User-Agent"),
    (AcceptRanges, "Accept-Ranges"),
    (Age, "Age"),
    (Etag, "ETag"),
    (Location, "Location"),
    (ProxyAuthenticate, "Proxy-Authenticate"),
    (RetryAfter, "Retry-After"),
    (Server, "Server"),
    (SetCookie, "Set-Cookie"),
    (Vary, "Vary"),
    (WwwAuthenticate, "WWW-Authenticate"),
}

/// fixed table of recognized headers plus a bounded raw list
#[derive(Debug, Clone)]
pub struct Headers {
    known: [Option<String>; HeaderId::COUNT],
    raw: Vec<(String, String)>,
}

impl Default for Headers {
    fn default() -> Self {
        Self {
            known: std::array::from_fn(|_| None),
            raw: Vec::new(),
        }
    }
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: HeaderId, value: impl Into<String>) {
        self.known[id as usize] = Some(value.into());
    }

    pub fn get(&self, id: HeaderId) -> Option<&str> {
        self.known[id as usize].as_deref()
    }

    /// append to an existing value as a comma separated list
    pub fn append(&mut self, id: HeaderId, value: &str) {
        match &mut self.known[id as usize] {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            slot => *slot = Some(value.to_string()),
        }
    }

    /// store a header that has no canonical slot
    pub fn set_raw(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<(), Error> {
        if self.raw.len() >= MAX_RAW_HEADERS {
            return Err(Error::protocol(ProtocolError::TooManyHeaders(
                MAX_RAW_HEADERS,
            )));
        }
        self.raw.push((name.into(), value.into()));
        Ok(())
    }

    /// case insensitive lookup in the raw list
    pub fn get_raw(&self, name: &str) -> Option<&str> {
        self.raw
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// recognized slot by canonical name, else the raw list
    pub fn get_by_name(&self, name: &str) -> Option<&str> {
        match HeaderId::from_name(name) {
            Some(id) => self.get(id),
            None => self.get_raw(name),
        }
    }

    pub fn raw(&self) -> &[(String, String)] {
        &self.raw
    }

    /// classify one parsed header into the table
    fn insert_parsed(&mut self, name: &str, value: &str) -> Result<(), Error> {
        match HeaderId::from_name(name) {
            Some(id) => {
                self.set(id, value);
                Ok(())
            }
            None => self.set_raw(name, value),
        }
    }

    fn render(&self, out: &mut String) {
        for id in HeaderId::ALL {
            if let Some(value) = self.get(id) {
                out.push_str(id.canonical());
                out.push_str(": ");
                out.push_str(value);
                out.push_str("\r\n");
            }
        }
        for (name, value) in &self.raw {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
    }
}

/// ordered query parameters, capped at [`MAX_QUERY_PARAMS`]
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    items: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<(), Error> {
        if self.items.len() >= MAX_QUERY_PARAMS {
            return Err(Error::protocol(ProtocolError::TooManyQueryParams(
                MAX_QUERY_PARAMS,
            )));
        }
        self.items.push((name.into(), value.into()));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

/// a request scoped to a single send
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub headers: Headers,
    body: Option<Vec<u8>>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    /// attach an in-memory body with its media type; sets both the
    /// Content-Type and Content-Length headers
    pub fn set_content(&mut self, content_type: &str, body: impl Into<Vec<u8>>) {
        let body = body.into();
        self.headers.set(HeaderId::ContentType, content_type);
        self.headers
            .set(HeaderId::ContentLength, body.len().to_string());
        self.body = Some(body);
    }

    /// declare the length of a body that a pull reader will produce
    pub fn set_content_length(&mut self, length: usize) {
        self.headers
            .set(HeaderId::ContentLength, length.to_string());
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }
}

/// a response scoped to a single receive
#[derive(Debug)]
pub struct Response {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    /// materialized body; stays empty when a push writer consumed it
    pub body: BytesMut,
}

/// where request body bytes come from
pub enum BodySource<'a> {
    None,
    Bytes(&'a [u8]),
    /// called until it returns 0
    Reader(&'a mut (dyn FnMut(&mut [u8]) -> usize + Send)),
}

/// where response body bytes go
pub enum BodySink<'a> {
    /// materialize into [`Response::body`]
    Buffer,
    /// push chunks to the callback, which may consume or discard them
    Writer(&'a mut (dyn FnMut(&Headers, &[u8]) + Send)),
}

/// write a complete request head (request line, headers, blank line)
/// into `buf`, returning its length. fails when the head would exceed
/// [`MAX_HEADER_SIZE`].
pub fn build_request(
    method: &str,
    endpoint: &str,
    params: &QueryParams,
    req: &Request,
    buf: &mut BytesMut,
) -> Result<usize, Error> {
    let mut head = String::with_capacity(256);
    head.push_str(method);
    head.push(' ');
    head.push_str(endpoint);
    let mut sep = '?';
    for (name, value) in params.iter() {
        head.push(sep);
        head.push_str(name);
        head.push('=');
        head.push_str(value);
        sep = '&';
    }
    head.push_str(" HTTP/1.1\r\n");
    req.headers.render(&mut head);
    head.push_str("\r\n");

    if head.len() > MAX_HEADER_SIZE {
        return Err(Error::protocol(ProtocolError::HeaderTooLarge(
            MAX_HEADER_SIZE,
        )));
    }
    buf.extend_from_slice(head.as_bytes());
    Ok(head.len())
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn transfer_encoding_is_chunked(value: &str) -> bool {
    value
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
}

/// keep-alive http/1.1 connection to a single origin
#[derive(Debug)]
pub struct HttpClient<T = Socket> {
    transport: T,
    host: String,
    port: u16,
    /// stream buffer carrying bytes read past the current parse point
    buffer: BytesMut,
}

impl HttpClient<Socket> {
    /// connect to `http://host[:port]` or `https://host[:port]`;
    /// a bare hostname defaults to https
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let (host, port, tls) = parse_http_url(url)?;
        let socket = Socket::connect(&host, port, tls).await?;
        Ok(Self::from_transport(socket, host, port))
    }
}

fn parse_http_url(url: &str) -> Result<(String, u16, bool), Error> {
    let (rest, tls) = if let Some(rest) = url.strip_prefix("https://") {
        (rest, true)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (rest, false)
    } else {
        (url, true)
    };
    let rest = rest.split('/').next().unwrap_or_default();
    if rest.is_empty() {
        return Err(Error::InvalidUri(url.to_string()));
    }
    match rest.split_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::InvalidUri(url.to_string()))?;
            Ok((host.to_string(), port, tls))
        }
        None => Ok((rest.to_string(), if tls { 443 } else { 80 }, tls)),
    }
}

impl<T: Transport> HttpClient<T> {
    pub fn from_transport(transport: T, host: String, port: u16) -> Self {
        Self {
            transport,
            host,
            port,
            buffer: BytesMut::with_capacity(MAX_HEADER_SIZE),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// tear the client apart for a protocol upgrade; the returned
    /// buffer holds any bytes read past the response head
    pub fn into_parts(self) -> (T, BytesMut) {
        (self.transport, self.buffer)
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    /// write the head, then the body: a fixed buffer in one write or a
    /// pull reader drained until it reports 0 bytes
    pub async fn send_request(
        &mut self,
        head: &[u8],
        body: BodySource<'_>,
    ) -> Result<(), Error> {
        self.transport.write_all(head).await?;
        match body {
            BodySource::None => {}
            BodySource::Bytes(bytes) => self.transport.write_all(bytes).await?,
            BodySource::Reader(reader) => {
                let mut chunk = [0u8; 8 * 1024];
                loop {
                    let n = reader(&mut chunk);
                    if n == 0 {
                        break;
                    }
                    self.transport.write_all(&chunk[..n]).await?;
                }
            }
        }
        Ok(())
    }

    async fn fill(&mut self) -> Result<usize, Error> {
        self.transport.read_buf(&mut self.buffer).await
    }

    /// read and parse one response. body bytes are either materialized
    /// in the returned response or pushed to the writer.
    pub async fn receive_response(&mut self, mut sink: BodySink<'_>) -> Result<Response, Error> {
        // accumulate the head
        let head_len = loop {
            if let Some(len) = find_head_end(&self.buffer) {
                break len;
            }
            if self.buffer.len() > MAX_HEADER_SIZE {
                return Err(Error::protocol(ProtocolError::HeaderTooLarge(
                    MAX_HEADER_SIZE,
                )));
            }
            if self.fill().await? == 0 {
                return Err(Error::protocol(ProtocolError::UnexpectedEof));
            }
        };

        let mut parsed_headers = [httparse::EMPTY_HEADER; MAX_RAW_HEADERS];
        let mut parsed = httparse::Response::new(&mut parsed_headers);
        let status = parsed
            .parse(&self.buffer[..head_len])
            .map_err(|_| Error::protocol(ProtocolError::InvalidStatusLine))?;
        if !status.is_complete() {
            return Err(Error::protocol(ProtocolError::InvalidStatusLine));
        }

        let version = match parsed.version {
            Some(0) => Version::Http10,
            Some(1) => Version::Http11,
            _ => return Err(Error::protocol(ProtocolError::InvalidStatusLine)),
        };
        let code = parsed
            .code
            .ok_or_else(|| Error::protocol(ProtocolError::InvalidStatusLine))?;
        let reason = parsed.reason.unwrap_or_default().to_string();

        let mut headers = Headers::new();
        for header in parsed.headers.iter() {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| Error::protocol(ProtocolError::InvalidHeaderLine))?;
            headers.insert_parsed(header.name.trim(), value.trim())?;
        }
        self.buffer.advance(head_len);

        let mut response = Response {
            version,
            status: code,
            reason,
            headers,
            body: BytesMut::new(),
        };

        if let Err(e) = self.receive_body(&mut response, &mut sink).await {
            // release partial storage on any body failure
            response.body = BytesMut::new();
            return Err(e);
        }
        Ok(response)
    }

    async fn receive_body(
        &mut self,
        response: &mut Response,
        sink: &mut BodySink<'_>,
    ) -> Result<(), Error> {
        if let Some(length) = response.headers.get(HeaderId::ContentLength) {
            let length: usize = length
                .parse()
                .map_err(|_| Error::protocol(ProtocolError::InvalidHeaderLine))?;
            if length < self.buffer.len() {
                return Err(Error::protocol(ProtocolError::ContentLengthMismatch {
                    expected: length,
                    buffered: self.buffer.len(),
                }));
            }
            let mut remaining = length;
            while remaining > 0 {
                if self.buffer.is_empty() && self.fill().await? == 0 {
                    return Err(Error::protocol(ProtocolError::UnexpectedEof));
                }
                let take = remaining.min(self.buffer.len());
                let chunk = self.buffer.split_to(take);
                remaining -= take;
                Self::emit(response, sink, &chunk);
            }
            return Ok(());
        }

        let chunked = response
            .headers
            .get(HeaderId::TransferEncoding)
            .map(transfer_encoding_is_chunked)
            .unwrap_or(false);
        if !chunked {
            // neither framing header: no body to read
            return Ok(());
        }

        loop {
            let size = self.read_chunk_size().await?;
            if size == 0 {
                // the closing CRLF is the last thing consumed
                self.consume_crlf().await?;
                return Ok(());
            }
            let mut remaining = size;
            while remaining > 0 {
                if self.buffer.is_empty() && self.fill().await? == 0 {
                    return Err(Error::protocol(ProtocolError::UnexpectedEof));
                }
                let take = remaining.min(self.buffer.len());
                let chunk = self.buffer.split_to(take);
                remaining -= take;
                Self::emit(response, sink, &chunk);
            }
            self.consume_crlf().await?;
        }
    }

    fn emit(response: &mut Response, sink: &mut BodySink<'_>, chunk: &[u8]) {
        match sink {
            BodySink::Buffer => response.body.extend_from_slice(chunk),
            BodySink::Writer(writer) => writer(&response.headers, chunk),
        }
    }

    async fn read_line(&mut self) -> Result<BytesMut, Error> {
        loop {
            if let Some(pos) = self.buffer.windows(2).position(|w| w == b"\r\n") {
                let line = self.buffer.split_to(pos);
                self.buffer.advance(2);
                return Ok(line);
            }
            if self.fill().await? == 0 {
                return Err(Error::protocol(ProtocolError::UnexpectedEof));
            }
        }
    }

    async fn read_chunk_size(&mut self) -> Result<usize, Error> {
        let line = self.read_line().await?;
        let line = std::str::from_utf8(&line)
            .map_err(|_| Error::protocol(ProtocolError::MissingChunkSize))?;
        // chunk extensions after ';' are ignored
        let size = line.split(';').next().unwrap_or_default().trim();
        if size.is_empty() {
            return Err(Error::protocol(ProtocolError::MissingChunkSize));
        }
        usize::from_str_radix(size, 16)
            .map_err(|_| Error::protocol(ProtocolError::InvalidChunkSize(size.to_string())))
    }

    async fn consume_crlf(&mut self) -> Result<(), Error> {
        while self.buffer.len() < 2 {
            if self.fill().await? == 0 {
                return Err(Error::protocol(ProtocolError::UnexpectedEof));
            }
        }
        if &self.buffer[..2] != b"\r\n" {
            return Err(Error::protocol(ProtocolError::InvalidChunkSize(
                String::from_utf8_lossy(&self.buffer[..2]).into_owned(),
            )));
        }
        self.buffer.advance(2);
        Ok(())
    }

    /// one full exchange with explicit body plumbing
    pub async fn custom_with(
        &mut self,
        method: &str,
        endpoint: &str,
        params: &QueryParams,
        req: &Request,
        body: BodySource<'_>,
        sink: BodySink<'_>,
    ) -> Result<Response, Error> {
        let mut req = req.clone();
        if req.headers.get(HeaderId::Host).is_none() {
            req.headers.set(HeaderId::Host, self.host.clone());
        }
        let mut head = BytesMut::new();
        build_request(method, endpoint, params, &req, &mut head)?;
        self.send_request(&head, body).await?;
        self.receive_response(sink).await
    }

    /// exchange using the body attached to the request, if any
    pub async fn custom(
        &mut self,
        method: &str,
        endpoint: &str,
        params: &QueryParams,
        req: &Request,
    ) -> Result<Response, Error> {
        let source = match req.body() {
            Some(body) => BodySource::Bytes(body),
            None => BodySource::None,
        };
        self.custom_with(method, endpoint, params, req, source, BodySink::Buffer)
            .await
    }

    pub async fn get(
        &mut self,
        endpoint: &str,
        params: &QueryParams,
        req: &Request,
    ) -> Result<Response, Error> {
        self.custom("GET", endpoint, params, req).await
    }

    pub async fn post(
        &mut self,
        endpoint: &str,
        params: &QueryParams,
        req: &Request,
    ) -> Result<Response, Error> {
        self.custom("POST", endpoint, params, req).await
    }

    pub async fn put(
        &mut self,
        endpoint: &str,
        params: &QueryParams,
        req: &Request,
    ) -> Result<Response, Error> {
        self.custom("PUT", endpoint, params, req).await
    }
}

/// multipart/form-data body under construction
#[derive(Debug)]
pub struct Multipart {
    boundary: String,
    body: BytesMut,
}

/// start a multipart body with a fresh 64 byte random boundary
pub fn multipart_begin() -> Multipart {
    let boundary: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect();
    Multipart {
        boundary,
        body: BytesMut::new(),
    }
}

impl Multipart {
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// media type for the Content-Type request header
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// append one part
    pub fn data(
        &mut self,
        name: &str,
        filename: &str,
        content_type: Option<&str>,
        content: &[u8],
    ) {
        self.body.extend_from_slice(b"--");
        self.body.extend_from_slice(self.boundary.as_bytes());
        self.body.extend_from_slice(b"\r\n");
        self.body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n")
                .as_bytes(),
        );
        if let Some(content_type) = content_type {
            self.body
                .extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        self.body.extend_from_slice(b"\r\n");
        self.body.extend_from_slice(content);
        self.body.extend_from_slice(b"\r\n");
    }

    /// write the closing sentinel and return the assembled body
    pub fn end(mut self) -> BytesMut {
        self.body.extend_from_slice(b"--");
        self.body.extend_from_slice(self.boundary.as_bytes());
        self.body.extend_from_slice(b"--\r\n");
        self.body
    }
}
