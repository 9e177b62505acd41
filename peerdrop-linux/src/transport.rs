//! Direct TCP data channel. The initiator listens on an ephemeral port and
//! puts `{addr, token}` in its offer; the responder dials it and sends the
//! token as its first frame. Frames use the core wire format.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use peerdrop_core::connection::ConnectionEvents;
use peerdrop_core::signaling::{IceCandidate, SessionDescription};
use peerdrop_core::wire::{decode_payload, encode_frame, frame_len};
use peerdrop_core::{ChannelMessage, ConnectionError, ConnectionEvent, Connector, PeerConnection, PeerId};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const LEN_SIZE: usize = 4;

type EventTx = mpsc::UnboundedSender<ConnectionEvent>;

#[derive(Debug, Serialize, Deserialize)]
struct Offer {
    addr: SocketAddr,
    token: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Answer {
    token: String,
}

pub struct TcpConnector {
    bind_ip: IpAddr,
    advertise_ip: IpAddr,
}

impl TcpConnector {
    /// `advertise_ip` is the address written into offers; peers must be able to reach it.
    pub fn new(bind_ip: IpAddr, advertise_ip: IpAddr) -> Self {
        Self {
            bind_ip,
            advertise_ip,
        }
    }
}

impl Connector for TcpConnector {
    fn open(
        &self,
        peer_id: &PeerId,
    ) -> Result<(Box<dyn PeerConnection>, ConnectionEvents), ConnectionError> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        debug!(peer = %peer_id, "opening tcp connection");
        let conn = TcpConnection {
            bind_ip: self.bind_ip,
            advertise_ip: self.advertise_ip,
            events,
            outbound,
            outbound_rx: Some(outbound_rx),
            buffered: Arc::new(AtomicUsize::new(0)),
            token: None,
            driver: None,
        };
        Ok((Box::new(conn), events_rx))
    }
}

pub struct TcpConnection {
    bind_ip: IpAddr,
    advertise_ip: IpAddr,
    events: EventTx,
    outbound: mpsc::UnboundedSender<ChannelMessage>,
    /// Taken by the driver once negotiation starts.
    outbound_rx: Option<mpsc::UnboundedReceiver<ChannelMessage>>,
    buffered: Arc<AtomicUsize>,
    token: Option<String>,
    driver: Option<JoinHandle<()>>,
}

impl TcpConnection {
    fn take_outbound(&mut self) -> Result<mpsc::UnboundedReceiver<ChannelMessage>, ConnectionError> {
        self.outbound_rx
            .take()
            .ok_or_else(|| ConnectionError::Negotiation("already negotiated".into()))
    }
}

fn parse<T: for<'de> Deserialize<'de>>(desc: &SessionDescription) -> Result<T, ConnectionError> {
    serde_json::from_str(&desc.sdp)
        .map_err(|e| ConnectionError::Negotiation(format!("bad description: {e}")))
}

fn to_sdp<T: Serialize>(value: &T) -> Result<String, ConnectionError> {
    serde_json::to_string(value).map_err(|e| ConnectionError::Negotiation(e.to_string()))
}

#[async_trait]
impl PeerConnection for TcpConnection {
    async fn create_offer(&mut self) -> Result<SessionDescription, ConnectionError> {
        let outbound = self.take_outbound()?;
        let listener = TcpListener::bind((self.bind_ip, 0)).await?;
        let port = listener.local_addr()?.port();
        let token = uuid::Uuid::new_v4().to_string();
        let offer = Offer {
            addr: SocketAddr::new(self.advertise_ip, port),
            token: token.clone(),
        };
        let events = self.events.clone();
        let buffered = self.buffered.clone();
        let expected = token.clone();
        self.driver = Some(tokio::spawn(async move {
            match accept_peer(&listener, &expected).await {
                Ok(stream) => drive(stream, outbound, events, buffered).await,
                Err(e) => {
                    let _ = events.send(ConnectionEvent::Failed(e.to_string()));
                }
            }
        }));
        self.token = Some(token);
        Ok(SessionDescription::offer(to_sdp(&offer)?))
    }

    async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, ConnectionError> {
        let Offer { addr, token } = parse(&offer)?;
        let outbound = self.take_outbound()?;
        let events = self.events.clone();
        let buffered = self.buffered.clone();
        let hello = ChannelMessage::Text(token.clone());
        self.driver = Some(tokio::spawn(async move {
            match dial(addr, &hello).await {
                Ok(stream) => drive(stream, outbound, events, buffered).await,
                Err(e) => {
                    let _ = events.send(ConnectionEvent::Failed(format!("dial {addr}: {e}")));
                }
            }
        }));
        let answer = Answer {
            token: token.clone(),
        };
        self.token = Some(token);
        Ok(SessionDescription::answer(to_sdp(&answer)?))
    }

    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), ConnectionError> {
        let Answer { token } = parse(&answer)?;
        if self.token.as_deref() != Some(token.as_str()) {
            return Err(ConnectionError::Negotiation("answer token mismatch".into()));
        }
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        debug!(candidate = %candidate.candidate, "tcp channel ignores candidates");
        Ok(())
    }

    fn send(&mut self, message: ChannelMessage) -> Result<(), ConnectionError> {
        if self.token.is_none() {
            return Err(ConnectionError::NotOpen);
        }
        let len = message.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        self.outbound.send(message).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            ConnectionError::Closed
        })
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Accept connections until one presents `token`.
async fn accept_peer(listener: &TcpListener, token: &str) -> std::io::Result<TcpStream> {
    loop {
        let (mut stream, from) = listener.accept().await?;
        match read_frame(&mut stream).await {
            Ok(Some(ChannelMessage::Text(t))) if t == token => return Ok(stream),
            Ok(_) => warn!(%from, "connection without the offer token, dropping"),
            Err(e) => warn!(%from, error = %e, "bad first frame, dropping"),
        }
    }
}

async fn dial(addr: SocketAddr, hello: &ChannelMessage) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    write_frame(&mut stream, hello).await?;
    Ok(stream)
}

async fn drive(
    stream: TcpStream,
    outbound: mpsc::UnboundedReceiver<ChannelMessage>,
    events: EventTx,
    buffered: Arc<AtomicUsize>,
) {
    let (reader, writer) = stream.into_split();
    let _ = events.send(ConnectionEvent::ChannelOpen);
    let result = tokio::select! {
        r = read_loop(reader, &events) => r,
        r = write_loop(writer, outbound, &buffered) => r,
    };
    let _ = events.send(match result {
        Ok(()) => ConnectionEvent::ChannelClosed,
        Err(e) => ConnectionEvent::Failed(e.to_string()),
    });
}

async fn read_loop(mut reader: OwnedReadHalf, events: &EventTx) -> std::io::Result<()> {
    while let Some(msg) = read_frame(&mut reader).await? {
        if events.send(ConnectionEvent::Message(msg)).is_err() {
            break;
        }
    }
    Ok(())
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<ChannelMessage>,
    buffered: &AtomicUsize,
) -> std::io::Result<()> {
    while let Some(msg) = outbound.recv().await {
        write_frame(&mut writer, &msg).await?;
        buffered.fetch_sub(msg.len(), Ordering::SeqCst);
    }
    writer.shutdown().await
}

/// `None` on a clean end of stream.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<ChannelMessage>> {
    let mut prefix = [0u8; LEN_SIZE];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = frame_len(prefix).map_err(invalid)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode_payload(&payload).map(Some).map_err(invalid)
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &ChannelMessage) -> std::io::Result<()> {
    let frame = encode_frame(msg).map_err(invalid)?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

fn invalid(e: impl std::error::Error + Send + Sync + 'static) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn connector() -> TcpConnector {
        let local = IpAddr::V4(Ipv4Addr::LOCALHOST);
        TcpConnector::new(local, local)
    }

    async fn next(events: &mut ConnectionEvents) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out")
            .expect("events closed")
    }

    #[tokio::test]
    async fn offer_answer_opens_a_channel() {
        let net = connector();
        let (mut a, mut a_events) = net.open(&PeerId::from("b")).unwrap();
        let (mut b, mut b_events) = net.open(&PeerId::from("a")).unwrap();

        let offer = a.create_offer().await.unwrap();
        let answer = b.accept_offer(offer).await.unwrap();
        a.accept_answer(answer).await.unwrap();
        assert_eq!(next(&mut a_events).await, ConnectionEvent::ChannelOpen);
        assert_eq!(next(&mut b_events).await, ConnectionEvent::ChannelOpen);

        let chunk = ChannelMessage::Binary(Bytes::from_static(&[9u8; 5000]));
        a.send(ChannelMessage::Text("hello".into())).unwrap();
        a.send(chunk.clone()).unwrap();
        assert_eq!(
            next(&mut b_events).await,
            ConnectionEvent::Message(ChannelMessage::Text("hello".into()))
        );
        assert_eq!(next(&mut b_events).await, ConnectionEvent::Message(chunk));

        b.send(ChannelMessage::Text("back".into())).unwrap();
        assert_eq!(
            next(&mut a_events).await,
            ConnectionEvent::Message(ChannelMessage::Text("back".into()))
        );

        a.close();
        assert_eq!(next(&mut b_events).await, ConnectionEvent::ChannelClosed);
    }

    #[tokio::test]
    async fn wrong_token_is_refused() {
        let net = connector();
        let (mut a, _a_events) = net.open(&PeerId::from("b")).unwrap();
        let offer = a.create_offer().await.unwrap();
        let err = a
            .accept_answer(SessionDescription::answer(r#"{"token":"nope"}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Negotiation(_)));

        let parsed: Offer = parse(&offer).unwrap();
        assert_eq!(parsed.addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn send_before_negotiation_fails() {
        let (mut a, _events) = connector().open(&PeerId::from("b")).unwrap();
        assert!(matches!(
            a.send(ChannelMessage::Text("x".into())),
            Err(ConnectionError::NotOpen)
        ));
    }
}
