
use std::fmt;

use serde::Serialize;

use crate::candidate::{CandidateKind, TransportType};

/// Which dialect of ICE the agent speaks on the wire.
///
/// `Rfc5245` is standard full ICE. `Oc2007R2` follows the Microsoft
/// WLM2009/OC2007R2 variant: a different candidate type preference table
/// (relay above server reflexive over UDP), non-aligned attribute layout
/// and the CANDIDATE-IDENTIFIER attribute in connectivity checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum IceCompatibility {
    #[serde(rename = "rfc5245")]
    Rfc5245,
    #[serde(rename = "oc2007r2")]
    Oc2007R2,
}

impl Default for IceCompatibility {
    fn default() -> Self {
        Self::Rfc5245
    }
}

impl fmt::Display for IceCompatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Rfc5245 => "rfc5245",
            Self::Oc2007R2 => "oc2007r2",
        };
        write!(f, "{s}")
    }
}

/// Which dialect of TURN is used for relay allocations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TurnCompatibility {
    #[serde(rename = "rfc5766")]
    Rfc5766,
    #[serde(rename = "oc2007")]
    Oc2007,
}

impl Default for TurnCompatibility {
    fn default() -> Self {
        Self::Rfc5766
    }
}

impl fmt::Display for TurnCompatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Rfc5766 => "rfc5766",
            Self::Oc2007 => "oc2007",
        };
        write!(f, "{s}")
    }
}

// RFC 5245 4.1.2.2 recommended type preferences.
pub(crate) const TYPE_PREF_HOST: u8 = 120;
pub(crate) const TYPE_PREF_PEER_REFLEXIVE: u8 = 110;
pub(crate) const TYPE_PREF_SERVER_REFLEXIVE: u8 = 100;
pub(crate) const TYPE_PREF_RELAYED: u8 = 60;

pub(crate) const TYPE_PREF_HOST_TCP: u8 = 50;
pub(crate) const TYPE_PREF_PEER_REFLEXIVE_TCP: u8 = 40;
pub(crate) const TYPE_PREF_SERVER_REFLEXIVE_TCP: u8 = 30;
pub(crate) const TYPE_PREF_RELAYED_TCP: u8 = 0;

// OC2007R2 ranks relay above server reflexive over UDP, and inverts the
// host/prflx order over TCP.
pub(crate) const OC2007R2_TYPE_PREF_HOST: u8 = 120;
pub(crate) const OC2007R2_TYPE_PREF_PEER_REFLEXIVE: u8 = 100;
pub(crate) const OC2007R2_TYPE_PREF_SERVER_REFLEXIVE: u8 = 60;
pub(crate) const OC2007R2_TYPE_PREF_RELAYED: u8 = 110;

pub(crate) const OC2007R2_TYPE_PREF_HOST_TCP: u8 = 8;
pub(crate) const OC2007R2_TYPE_PREF_PEER_REFLEXIVE_TCP: u8 = 9;
pub(crate) const OC2007R2_TYPE_PREF_SERVER_REFLEXIVE_TCP: u8 = 7;
pub(crate) const OC2007R2_TYPE_PREF_RELAYED_TCP: u8 = 0;

impl IceCompatibility {
    /// The candidate type preference for the profile, RFC 5245 4.1.2.1.
    #[must_use]
    pub fn type_preference(&self, kind: CandidateKind, transport: TransportType) -> u8 {
        match self {
            Self::Oc2007R2 => {
                if transport == TransportType::Udp {
                    match kind {
                        CandidateKind::Host => OC2007R2_TYPE_PREF_HOST,
                        CandidateKind::PeerReflexive => OC2007R2_TYPE_PREF_PEER_REFLEXIVE,
                        CandidateKind::ServerReflexive => OC2007R2_TYPE_PREF_SERVER_REFLEXIVE,
                        CandidateKind::Relayed => OC2007R2_TYPE_PREF_RELAYED,
                    }
                } else {
                    match kind {
                        CandidateKind::Host => OC2007R2_TYPE_PREF_HOST_TCP,
                        CandidateKind::PeerReflexive => OC2007R2_TYPE_PREF_PEER_REFLEXIVE_TCP,
                        CandidateKind::ServerReflexive => OC2007R2_TYPE_PREF_SERVER_REFLEXIVE_TCP,
                        CandidateKind::Relayed => OC2007R2_TYPE_PREF_RELAYED_TCP,
                    }
                }
            }
            Self::Rfc5245 => {
                if transport == TransportType::Udp {
                    match kind {
                        CandidateKind::Host => TYPE_PREF_HOST,
                        CandidateKind::PeerReflexive => TYPE_PREF_PEER_REFLEXIVE,
                        CandidateKind::ServerReflexive => TYPE_PREF_SERVER_REFLEXIVE,
                        CandidateKind::Relayed => TYPE_PREF_RELAYED,
                    }
                } else {
                    match kind {
                        CandidateKind::Host => TYPE_PREF_HOST_TCP,
                        CandidateKind::PeerReflexive => TYPE_PREF_PEER_REFLEXIVE_TCP,
                        CandidateKind::ServerReflexive => TYPE_PREF_SERVER_REFLEXIVE_TCP,
                        CandidateKind::Relayed => TYPE_PREF_RELAYED_TCP,
                    }
                }
            }
        }
    }
}
