use std::io::ErrorKind;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::errors::Error;

/// plain or tls wrapped stream
#[derive(Debug)]
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

fn tls_connector() -> Result<TlsConnector, Error> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        // individual store entries may be stale or unparsable, skip them
        let _ = roots.add(cert);
    }
    if roots.is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn open_stream(
    host: &str,
    port: u16,
    tls: Option<&TlsConnector>,
) -> Result<MaybeTlsStream, Error> {
    let addrs = lookup_host((host, port))
        .await
        .map_err(|_| Error::ResolveFailed(format!("{host}:{port}")))?;

    let mut tcp = None;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let tcp = tcp.ok_or_else(|| {
        Error::ConnectionFailed(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("no address for {host}:{port}")),
        )
    })?;

    match tls {
        Some(connector) => {
            let domain = ServerName::try_from(host.to_string())
                .map_err(|e| Error::Tls(e.to_string()))?;
            let stream = connector
                .connect(domain, tcp)
                .await
                .map_err(|e| Error::Tls(e.to_string()))?;
            tracing::debug!(host, "tls connection established");
            Ok(MaybeTlsStream::Tls(Box::new(stream)))
        }
        None => Ok(MaybeTlsStream::Plain(tcp)),
    }
}

/// byte transport driven by the http client and the websocket engine.
/// [`Socket`] implements it with the reconnect-once policy; tests drive
/// the protocol layers over in-memory duplex pipes instead.
pub trait Transport: Send {
    fn write_all(&mut self, buf: &[u8]) -> impl std::future::Future<Output = Result<(), Error>> + Send;
    fn read_buf(&mut self, buf: &mut BytesMut) -> impl std::future::Future<Output = Result<usize, Error>> + Send;
    /// read bounded by a tick; `Ok(None)` means the tick elapsed
    fn read_buf_timeout(
        &mut self,
        buf: &mut BytesMut,
        tick: Option<Duration>,
    ) -> impl std::future::Future<Output = Result<Option<usize>, Error>> + Send;
    fn close(&mut self) -> impl std::future::Future<Output = ()> + Send;
}

/// a connected stream that remembers its peer so it can transparently
/// reconnect once when the peer aborts mid operation
pub struct Socket {
    stream: MaybeTlsStream,
    host: String,
    port: u16,
    tls: Option<TlsConnector>,
}

impl Socket {
    /// resolve `host`, connect to the first answering address and
    /// optionally wrap the connection in tls verified against the
    /// system trust store
    pub async fn connect(host: &str, port: u16, tls: bool) -> Result<Self, Error> {
        let connector = if tls { Some(tls_connector()?) } else { None };
        let stream = open_stream(host, port, connector.as_ref()).await?;
        tracing::debug!(host, port, tls, "connected");
        Ok(Self {
            stream,
            host: host.to_string(),
            port,
            tls: connector,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.host
    }

    /// drop the current connection and dial the same peer again,
    /// rebinding the tls session to the new descriptor
    pub async fn reconnect(&mut self) -> Result<(), Error> {
        tracing::debug!(host = %self.host, "reconnecting");
        self.stream = open_stream(&self.host, self.port, self.tls.as_ref()).await?;
        Ok(())
    }

    /// write the whole buffer, retrying once through a reconnect when
    /// the peer reset the connection under us
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self.stream.write_all(buf).await {
            Ok(()) => Ok(()),
            Err(e) if Error::is_peer_abort(e.kind()) => {
                tracing::debug!("write aborted by peer, retrying once");
                self.reconnect().await?;
                self.stream.write_all(buf).await.map_err(Error::from)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// read some bytes into `buf`, with the same reconnect-once policy
    /// as [`Socket::write_all`]; `Ok(0)` means the peer closed cleanly
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, Error> {
        match self.stream.read_buf(buf).await {
            Ok(n) => Ok(n),
            Err(e) if Error::is_peer_abort(e.kind()) => {
                tracing::debug!("read aborted by peer, retrying once");
                self.reconnect().await?;
                self.stream.read_buf(buf).await.map_err(Error::from)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// read with a tick budget. `None` tick waits forever. a `None`
    /// return means the tick elapsed with nothing to read, which is
    /// not an error: the caller's timers get a chance to run
    pub async fn read_buf_timeout(
        &mut self,
        buf: &mut BytesMut,
        tick: Option<Duration>,
    ) -> Result<Option<usize>, Error> {
        match tick {
            Some(tick) => match tokio::time::timeout(tick, self.read_buf(buf)).await {
                Ok(res) => res.map(Some),
                Err(_elapsed) => Ok(None),
            },
            None => self.read_buf(buf).await.map(Some),
        }
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            if e.kind() != ErrorKind::NotConnected {
                tracing::debug!(error = %e, "socket shutdown");
            }
        }
    }
}

impl Transport for Socket {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        Socket::write_all(self, buf).await
    }

    async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, Error> {
        Socket::read_buf(self, buf).await
    }

    async fn read_buf_timeout(
        &mut self,
        buf: &mut BytesMut,
        tick: Option<Duration>,
    ) -> Result<Option<usize>, Error> {
        Socket::read_buf_timeout(self, buf, tick).await
    }

    async fn close(&mut self) {
        Socket::close(self).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn only_peer_aborts_are_retried() {
        use std::io::ErrorKind::*;
        for kind in [ConnectionReset, ConnectionAborted, BrokenPipe] {
            assert!(Error::is_peer_abort(kind), "{kind:?} should reconnect");
        }
        // everything else takes the propagate-immediately branch
        for kind in [WouldBlock, TimedOut, NotConnected, AddrInUse, InvalidData] {
            assert!(!Error::is_peer_abort(kind), "{kind:?} should propagate");
        }
    }

    /// accept one connection and reset it hard so the peer sees
    /// ECONNRESET instead of a clean fin
    async fn accept_and_reset(listener: &TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        stream.set_linger(Some(Duration::from_secs(0))).unwrap();
        drop(stream);
    }

    #[tokio::test]
    async fn write_reconnects_once_after_peer_abort() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            accept_and_reset(&listener).await;
            // the retried write lands on the replacement connection
            let (mut replacement, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            replacement.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut socket = Socket::connect("127.0.0.1", port, false).await.unwrap();
        // let the rst land before writing
        tokio::time::sleep(Duration::from_millis(50)).await;
        socket.write_all(b"hello").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn read_reconnects_once_after_peer_abort() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            accept_and_reset(&listener).await;
            let (mut replacement, _) = listener.accept().await.unwrap();
            replacement.write_all(b"fresh").await.unwrap();
            // hold the replacement open until the peer is done
            let mut hold = [0u8; 1];
            let _ = replacement.read(&mut hold).await;
        });

        let mut socket = Socket::connect("127.0.0.1", port, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut buf = BytesMut::new();
        let n = socket.read_buf(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"fresh");
        socket.close().await;
        let _ = server.await;
    }

    #[tokio::test]
    async fn failed_reconnect_propagates_the_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (socket, accepted) =
            tokio::join!(Socket::connect("127.0.0.1", port, false), listener.accept());
        let mut socket = socket.unwrap();
        let (aborted, _) = accepted.unwrap();
        aborted.set_linger(Some(Duration::from_secs(0))).unwrap();
        drop(aborted);
        // nothing left to reconnect to
        drop(listener);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = socket.write_all(b"x").await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed(_)), "{err:?}");
    }

    #[tokio::test]
    async fn clean_peer_close_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (socket, accepted) =
            tokio::join!(Socket::connect("127.0.0.1", port, false), listener.accept());
        let mut socket = socket.unwrap();
        let (first, _) = accepted.unwrap();
        // orderly fin
        drop(first);

        let mut buf = BytesMut::new();
        assert_eq!(socket.read_buf(&mut buf).await.unwrap(), 0);
        // eof is surfaced as-is, no transparent redial happens
        let redial = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(redial.is_err(), "clean close must not trigger a reconnect");
    }
}
