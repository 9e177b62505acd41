//! In-process connector: connections opened from the same `LoopbackNetwork`
//! pair up through their offer/answer tokens and deliver messages over
//! channels, in order and without loss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionEvents, Connector, PeerConnection,
};
use crate::protocol::ChannelMessage;
use crate::signaling::{IceCandidate, PeerId, SessionDescription};

const SDP_PREFIX: &str = "loopback:";

type EventTx = mpsc::UnboundedSender<ConnectionEvent>;

#[derive(Default)]
struct Registry {
    next_token: u64,
    offers: HashMap<String, EventTx>,
    answers: HashMap<String, EventTx>,
}

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Connector for LoopbackNetwork {
    fn open(
        &self,
        _peer_id: &PeerId,
    ) -> Result<(Box<dyn PeerConnection>, ConnectionEvents), ConnectionError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let conn = LoopbackConnection {
            network: self.clone(),
            events_tx,
            peer_tx: None,
            token: None,
        };
        Ok((Box::new(conn), events_rx))
    }
}

pub struct LoopbackConnection {
    network: LoopbackNetwork,
    events_tx: EventTx,
    peer_tx: Option<EventTx>,
    token: Option<String>,
}

impl LoopbackConnection {
    fn announce_candidate(&self, token: &str) {
        let _ = self
            .events_tx
            .send(ConnectionEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:{token} 1 loopback"),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            }));
    }
}

fn token_of(desc: &SessionDescription) -> Result<String, ConnectionError> {
    desc.sdp
        .strip_prefix(SDP_PREFIX)
        .map(str::to_string)
        .ok_or_else(|| ConnectionError::Negotiation(format!("foreign description: {}", desc.sdp)))
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_offer(&mut self) -> Result<SessionDescription, ConnectionError> {
        let token = {
            let mut reg = self.network.registry();
            reg.next_token += 1;
            let token = reg.next_token.to_string();
            reg.offers.insert(token.clone(), self.events_tx.clone());
            token
        };
        self.announce_candidate(&token);
        let offer = SessionDescription::offer(format!("{SDP_PREFIX}{token}"));
        self.token = Some(token);
        Ok(offer)
    }

    async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, ConnectionError> {
        let token = token_of(&offer)?;
        let initiator = {
            let mut reg = self.network.registry();
            let initiator = reg
                .offers
                .remove(&token)
                .ok_or_else(|| ConnectionError::Negotiation(format!("unknown offer {token}")))?;
            reg.answers.insert(token.clone(), self.events_tx.clone());
            initiator
        };
        self.peer_tx = Some(initiator);
        self.announce_candidate(&token);
        let answer = SessionDescription::answer(format!("{SDP_PREFIX}{token}"));
        self.token = Some(token);
        Ok(answer)
    }

    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), ConnectionError> {
        let token = token_of(&answer)?;
        if self.token.as_deref() != Some(token.as_str()) {
            return Err(ConnectionError::Negotiation(format!(
                "answer {token} does not match our offer"
            )));
        }
        let responder = self
            .network
            .registry()
            .answers
            .remove(&token)
            .ok_or_else(|| ConnectionError::Negotiation(format!("unknown answer {token}")))?;
        let _ = self.events_tx.send(ConnectionEvent::ChannelOpen);
        let _ = responder.send(ConnectionEvent::ChannelOpen);
        self.peer_tx = Some(responder);
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        if !candidate.candidate.contains("loopback") {
            return Err(ConnectionError::Negotiation(format!(
                "foreign candidate: {}",
                candidate.candidate
            )));
        }
        Ok(())
    }

    fn send(&mut self, message: ChannelMessage) -> Result<(), ConnectionError> {
        let peer = self.peer_tx.as_ref().ok_or(ConnectionError::NotOpen)?;
        peer.send(ConnectionEvent::Message(message))
            .map_err(|_| ConnectionError::Closed)
    }

    fn buffered_amount(&self) -> usize {
        0
    }

    fn close(&mut self) {
        if let Some(peer) = self.peer_tx.take() {
            let _ = peer.send(ConnectionEvent::ChannelClosed);
        }
        if let Some(token) = self.token.take() {
            let mut reg = self.network.registry();
            reg.offers.remove(&token);
            reg.answers.remove(&token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offer_answer_opens_both_sides() {
        let net = LoopbackNetwork::new();
        let peer = PeerId::from("x");
        let (mut a, mut a_events) = net.open(&peer).unwrap();
        let (mut b, mut b_events) = net.open(&peer).unwrap();

        let offer = a.create_offer().await.unwrap();
        let answer = b.accept_offer(offer).await.unwrap();
        a.accept_answer(answer).await.unwrap();

        assert!(matches!(a_events.recv().await, Some(ConnectionEvent::LocalCandidate(_))));
        assert_eq!(a_events.recv().await, Some(ConnectionEvent::ChannelOpen));
        assert!(matches!(b_events.recv().await, Some(ConnectionEvent::LocalCandidate(_))));
        assert_eq!(b_events.recv().await, Some(ConnectionEvent::ChannelOpen));

        a.send(ChannelMessage::Text("hi".into())).unwrap();
        assert_eq!(
            b_events.recv().await,
            Some(ConnectionEvent::Message(ChannelMessage::Text("hi".into())))
        );

        b.close();
        assert_eq!(a_events.recv().await, Some(ConnectionEvent::ChannelClosed));
    }

    #[tokio::test]
    async fn send_before_negotiation_fails() {
        let net = LoopbackNetwork::new();
        let (mut a, _events) = net.open(&PeerId::from("x")).unwrap();
        assert!(matches!(
            a.send(ChannelMessage::Text("early".into())),
            Err(ConnectionError::NotOpen)
        ));
    }
}
