//! [`PeerConnection`] backed by a webrtc-rs `RTCPeerConnection`.
//!
//! Candidates travel as the JSON encoding of `RTCIceCandidateInit`, which is never empty,
//! so the empty-string sentinel stays unambiguous.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{trace, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::candidate::Candidate;
use crate::description::{SdpType, SignalDescription};
use crate::error::{SignalError, SignalResult, peer_error};
use crate::peer::{CandidateSink, PeerConnection};

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    sink: Mutex<Option<CandidateSink>>,
}

impl RtcPeer {
    pub fn new(pc: Arc<RTCPeerConnection>) -> Arc<Self> {
        Arc::new(Self {
            pc,
            sink: Mutex::new(None),
        })
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> SignalResult<SignalDescription> {
        let offer = self.pc.create_offer(None).await.map_err(peer_error)?;
        description_from_rtc(offer)
    }

    async fn create_answer(&self) -> SignalResult<SignalDescription> {
        let answer = self.pc.create_answer(None).await.map_err(peer_error)?;
        description_from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SignalDescription) -> SignalResult<()> {
        // gathering does not restart without an ICE restart, so nothing would end the round
        let already_gathered = self.pc.ice_gathering_state() == RTCIceGatheringState::Complete;
        self.pc
            .set_local_description(description_to_rtc(desc)?)
            .await
            .map_err(peer_error)?;
        if already_gathered {
            trace!(target = "signaler", "gathering already complete; ending candidates");
            if let Some(sink) = self.sink.lock().clone() {
                sink.emit(Candidate::end());
            }
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SignalDescription) -> SignalResult<()> {
        self.pc
            .set_remote_description(description_to_rtc(desc)?)
            .await
            .map_err(peer_error)
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> SignalResult<()> {
        let init = candidate_to_init(&candidate)?;
        self.pc.add_ice_candidate(init).await.map_err(peer_error)
    }

    fn on_candidate(&self, sink: CandidateSink) {
        *self.sink.lock() = Some(sink.clone());
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        sink.emit(Candidate::end());
                        return;
                    };
                    match candidate_from_rtc(&candidate) {
                        Ok(candidate) => sink.emit(candidate),
                        Err(err) => {
                            warn!(target = "signaler", error = %err, "dropping unencodable candidate")
                        }
                    }
                })
            }));
    }
}

pub fn description_to_rtc(desc: SignalDescription) -> SignalResult<RTCSessionDescription> {
    match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(peer_error)
}

pub fn description_from_rtc(desc: RTCSessionDescription) -> SignalResult<SignalDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SignalDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SignalDescription::answer(desc.sdp)),
        other => Err(SignalError::Protocol(format!(
            "unsupported description type {other}"
        ))),
    }
}

pub fn candidate_from_rtc(candidate: &RTCIceCandidate) -> SignalResult<Candidate> {
    let init = candidate.to_json().map_err(peer_error)?;
    candidate_from_init(&init)
}

pub fn candidate_from_init(init: &RTCIceCandidateInit) -> SignalResult<Candidate> {
    serde_json::to_string(init)
        .map(Candidate::new)
        .map_err(|err| SignalError::Protocol(err.to_string()))
}

/// The sentinel becomes an empty init, which the peer connection reads as end-of-candidates.
pub fn candidate_to_init(candidate: &Candidate) -> SignalResult<RTCIceCandidateInit> {
    if candidate.is_end() {
        return Ok(RTCIceCandidateInit::default());
    }
    serde_json::from_str(candidate.as_str())
        .map_err(|err| SignalError::Protocol(format!("malformed candidate: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_init_survives_the_wire_form() {
        let init = RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2130706431 192.168.1.2 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let wire = candidate_from_init(&init).unwrap();
        assert!(!wire.is_end());
        let back = candidate_to_init(&wire).unwrap();
        assert_eq!(back.candidate, init.candidate);
        assert_eq!(back.sdp_mid.as_deref(), Some("0"));
        assert_eq!(back.sdp_mline_index, Some(0));
    }

    #[test]
    fn sentinel_maps_to_empty_init() {
        let init = candidate_to_init(&Candidate::end()).unwrap();
        assert!(init.candidate.is_empty());
        assert!(init.sdp_mid.is_none());
    }

    #[test]
    fn garbage_candidate_is_a_protocol_error() {
        let err = candidate_to_init(&Candidate::new("not json")).unwrap_err();
        assert!(matches!(err, SignalError::Protocol(_)));
    }

    #[test]
    fn only_offers_and_answers_convert() {
        let err = description_from_rtc(RTCSessionDescription::default()).unwrap_err();
        assert!(matches!(err, SignalError::Protocol(_)));
    }
}
