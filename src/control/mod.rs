#[cfg(test)]
mod control_test;

use std::fmt;

use serde::Serialize;
use stun::attributes::*;
use stun::checks::*;
use stun::message::*;

/// The agent role in the current ICE session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Role {
    #[serde(rename = "controlling")]
    Controlling,
    #[serde(rename = "controlled")]
    Controlled,
}

impl Default for Role {
    fn default() -> Self {
        Self::Controlling
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Controlling => "controlling",
            Self::Controlled => "controlled",
        };
        write!(f, "{s}")
    }
}

const TIE_BREAKER_SIZE: usize = 8; // 64 bit

fn add_tie_breaker(m: &mut Message, t: AttrType, value: u64) {
    m.add(t, &value.to_be_bytes());
}

fn get_tie_breaker(m: &Message, t: AttrType) -> Result<u64, stun::Error> {
    let v = m.get(t)?;
    check_size(t, v.len(), TIE_BREAKER_SIZE)?;
    Ok(u64::from_be_bytes([
        v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7],
    ]))
}

/// Represents the ICE-CONTROLLING attribute.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct AttrControlling(pub u64);

impl Setter for AttrControlling {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        add_tie_breaker(m, ATTR_ICE_CONTROLLING, self.0);
        Ok(())
    }
}

impl Getter for AttrControlling {
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        self.0 = get_tie_breaker(m, ATTR_ICE_CONTROLLING)?;
        Ok(())
    }
}

/// Represents the ICE-CONTROLLED attribute.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct AttrControlled(pub u64);

impl Setter for AttrControlled {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        add_tie_breaker(m, ATTR_ICE_CONTROLLED, self.0);
        Ok(())
    }
}

impl Getter for AttrControlled {
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        self.0 = get_tie_breaker(m, ATTR_ICE_CONTROLLED)?;
        Ok(())
    }
}

/// Role + tie-breaker as observed in an inbound check, whichever of the
/// two control attributes the sender used.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AttrControl {
    pub role: Role,
    pub tie_breaker: u64,
}

impl AttrControl {
    /// Decodes ICE-CONTROLLING or ICE-CONTROLLED from the message,
    /// whichever is present.
    pub fn from_message(m: &Message) -> Option<Self> {
        if let Ok(tb) = get_tie_breaker(m, ATTR_ICE_CONTROLLING) {
            return Some(Self {
                role: Role::Controlling,
                tie_breaker: tb,
            });
        }
        if let Ok(tb) = get_tie_breaker(m, ATTR_ICE_CONTROLLED) {
            return Some(Self {
                role: Role::Controlled,
                tie_breaker: tb,
            });
        }
        None
    }
}

impl Setter for AttrControl {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        match self.role {
            Role::Controlling => AttrControlling(self.tie_breaker).add_to(m),
            Role::Controlled => AttrControlled(self.tie_breaker).add_to(m),
        }
    }
}
