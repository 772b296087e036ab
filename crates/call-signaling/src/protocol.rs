//! JSON frames exchanged with the relay.
//!
//! Every frame is `{ "kind", "payload", "senderId", "targetId"? }`. Payload
//! shapes follow the browser `RTCSessionDescriptionInit` and
//! `RTCIceCandidateInit` objects so browser peers interoperate unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Offer,
    Answer,
    IceCandidate,
    CallEnded,
    CallRejected,
    UserJoined,
    UserLeft,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::IceCandidate => "ice-candidate",
            MessageKind::CallEnded => "call-ended",
            MessageKind::CallRejected => "call-rejected",
            MessageKind::UserJoined => "user-joined",
            MessageKind::UserLeft => "user-left",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Rejection {
    reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
}

impl SignalingMessage {
    fn directed(kind: MessageKind, payload: Value, sender: &str, target: &str) -> Self {
        Self {
            kind,
            payload,
            sender_id: sender.to_string(),
            target_id: Some(target.to_string()),
        }
    }

    pub fn offer(sender: &str, target: &str, description: &SessionDescription) -> Self {
        Self::directed(MessageKind::Offer, to_value(description), sender, target)
    }

    pub fn answer(sender: &str, target: &str, description: &SessionDescription) -> Self {
        Self::directed(MessageKind::Answer, to_value(description), sender, target)
    }

    pub fn ice_candidate(sender: &str, target: &str, candidate: &IceCandidate) -> Self {
        Self::directed(MessageKind::IceCandidate, to_value(candidate), sender, target)
    }

    pub fn call_ended(sender: &str, target: &str) -> Self {
        Self::directed(MessageKind::CallEnded, Value::Null, sender, target)
    }

    pub fn call_rejected(sender: &str, target: &str, reason: &str) -> Self {
        let payload = to_value(&Rejection {
            reason: reason.to_string(),
        });
        Self::directed(MessageKind::CallRejected, payload, sender, target)
    }

    /// Parses one text frame and checks that its payload fits its kind.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let message: SignalingMessage = serde_json::from_str(text)?;
        message.validate()?;
        Ok(message)
    }

    pub fn decode_binary(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::NotUtf8)?;
        Self::decode(text)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn description(&self) -> Result<SessionDescription, ProtocolError> {
        self.require_payload()?;
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn candidate(&self) -> Result<IceCandidate, ProtocolError> {
        self.require_payload()?;
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn rejection_reason(&self) -> Option<String> {
        serde_json::from_value::<Rejection>(self.payload.clone())
            .ok()
            .map(|rejection| rejection.reason)
    }

    /// `true` when the frame is addressed to `user_id` or carries no target.
    pub fn is_addressed_to(&self, user_id: &str) -> bool {
        self.target_id.as_deref().is_none_or(|target| target == user_id)
    }

    fn require_payload(&self) -> Result<(), ProtocolError> {
        if self.payload.is_null() {
            return Err(ProtocolError::MissingPayload {
                kind: self.kind.as_str(),
            });
        }
        Ok(())
    }

    fn expect_description(&self, allowed: &[SdpType]) -> Result<(), ProtocolError> {
        let description = self.description()?;
        if allowed.contains(&description.sdp_type) {
            Ok(())
        } else {
            Err(ProtocolError::DescriptionMismatch {
                kind: self.kind.as_str(),
                sdp_type: description.sdp_type,
            })
        }
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        match self.kind {
            MessageKind::Offer => self.expect_description(&[SdpType::Offer]),
            MessageKind::Answer => self.expect_description(&[SdpType::Answer, SdpType::Pranswer]),
            MessageKind::IceCandidate => self.candidate().map(|_| ()),
            MessageKind::CallEnded
            | MessageKind::CallRejected
            | MessageKind::UserJoined
            | MessageKind::UserLeft => Ok(()),
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    // Plain structs with string keys always serialise.
    serde_json::to_value(value).unwrap_or(Value::Null)
}
