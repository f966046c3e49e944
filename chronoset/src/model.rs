//! Core data model: KeyScoreMember, KeyMember, Cursor, Presence.
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// The canonical unit: a (key, score, member) triple.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyScoreMember {
    pub key: Vec<u8>,
    pub score: f64,
    pub member: Vec<u8>,
}

impl KeyScoreMember {
    pub fn new(key: impl Into<Vec<u8>>, score: f64, member: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            score,
            member: member.into(),
        }
    }

    pub fn key_member(&self) -> KeyMember {
        KeyMember {
            key: self.key.clone(),
            member: self.member.clone(),
        }
    }
}

/// A (key, member) pair without a score, used for repair candidates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyMember {
    pub key: Vec<u8>,
    pub member: Vec<u8>,
}

impl KeyMember {
    pub fn new(key: impl Into<Vec<u8>>, member: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            member: member.into(),
        }
    }
}

/// Presence of a (key, member) pair on one replica.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Presence {
    Absent,
    Present { inserted: bool, score: f64 },
}

impl Presence {
    pub fn is_present(&self) -> bool {
        matches!(self, Presence::Present { .. })
    }

    pub fn score(&self) -> Option<f64> {
        match self {
            Presence::Present { score, .. } => Some(*score),
            Presence::Absent => None,
        }
    }
}

/// A (score, member) pagination position for range-scan Select.
///
/// Wire format: `uint64(float_bits(score)) || "A" || url_safe_base64(member)`.
/// The delimiter sits at a fixed byte offset (8), so whether `'A'` happens to
/// be part of the base64 alphabet is immaterial to parsing: there is no
/// search for the delimiter, only a fixed split.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub score: f64,
    pub member: Vec<u8>,
}

const CURSOR_DELIMITER: u8 = b'A';

impl Cursor {
    pub fn new(score: f64, member: impl Into<Vec<u8>>) -> Self {
        Self {
            score,
            member: member.into(),
        }
    }

    /// Raw wire bytes, before any transport-level encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.member.len() * 4 / 3 + 4);
        out.extend_from_slice(&self.score.to_bits().to_be_bytes());
        out.push(CURSOR_DELIMITER);
        out.extend_from_slice(URL_SAFE_NO_PAD.encode(&self.member).as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < 9 {
            return Err(ParseError::Cursor("cursor too short".into()));
        }
        let score_bits = u64::from_be_bytes(
            bytes[0..8]
                .try_into()
                .map_err(|_| ParseError::Cursor("bad score bits".into()))?,
        );
        if bytes[8] != CURSOR_DELIMITER {
            return Err(ParseError::Cursor("missing delimiter".into()));
        }
        let member = URL_SAFE_NO_PAD
            .decode(&bytes[9..])
            .map_err(|e| ParseError::Cursor(format!("bad member base64: {e}")))?;
        Ok(Cursor {
            score: f64::from_bits(score_bits),
            member,
        })
    }

    /// Opaque token suitable for handing to a client (e.g. in a REST API).
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_bytes())
    }

    pub fn decode(token: &str) -> Result<Self, ParseError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| ParseError::Cursor(format!("bad token base64: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

/// KSM JSON wire format: key/member are base64, score is a number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KsmJson {
    pub key: String,
    pub score: f64,
    pub member: String,
}

impl From<&KeyScoreMember> for KsmJson {
    fn from(ksm: &KeyScoreMember) -> Self {
        KsmJson {
            key: URL_SAFE_NO_PAD.encode(&ksm.key),
            score: ksm.score,
            member: URL_SAFE_NO_PAD.encode(&ksm.member),
        }
    }
}

impl TryFrom<&KsmJson> for KeyScoreMember {
    type Error = ParseError;

    fn try_from(json: &KsmJson) -> Result<Self, Self::Error> {
        Ok(KeyScoreMember {
            key: URL_SAFE_NO_PAD
                .decode(&json.key)
                .map_err(|e| ParseError::Ksm(format!("bad key base64: {e}")))?,
            score: json.score,
            member: URL_SAFE_NO_PAD
                .decode(&json.member)
                .map_err(|e| ParseError::Ksm(format!("bad member base64: {e}")))?,
        })
    }
}
