#[cfg(test)]
mod msattrs_test;

use stun::attributes::AttrType;
use stun::checks::*;
use stun::message::*;

/// CANDIDATE-IDENTIFIER, MS-ICE2 2.2.4. Sent by OC2007R2 agents in every
/// connectivity check, carrying the foundation of the local candidate the
/// check originates from.
pub const ATTR_CANDIDATE_IDENTIFIER: AttrType = AttrType(0x8054);

/// MS-IMPLEMENTATION-VERSION, MS-ICE2 2.2.8.
pub const ATTR_MS_IMPLEMENTATION_VERSION: AttrType = AttrType(0x8070);

/// The implementation version advertised to OC2007R2 peers. Value 2
/// selects the MS-ICE2 processing rules on Lync-era servers.
pub const MS_IMPLEMENTATION_VERSION: u32 = 2;

/// Carries the originating candidate's foundation in OC2007R2 checks.
#[derive(Default, PartialEq, Eq, Debug, Clone)]
pub struct CandidateIdentifierAttr(pub String);

impl CandidateIdentifierAttr {
    #[must_use]
    pub fn new(foundation: String) -> Self {
        Self(foundation)
    }
}

impl Setter for CandidateIdentifierAttr {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_CANDIDATE_IDENTIFIER, self.0.as_bytes());
        Ok(())
    }
}

impl Getter for CandidateIdentifierAttr {
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_CANDIDATE_IDENTIFIER)?;
        self.0 = String::from_utf8_lossy(&v).to_string();
        Ok(())
    }
}

/// MS-IMPLEMENTATION-VERSION as a 32-bit attribute.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct MsImplementationVersionAttr(pub u32);

const VERSION_SIZE: usize = 4;

impl Setter for MsImplementationVersionAttr {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_MS_IMPLEMENTATION_VERSION, &self.0.to_be_bytes());
        Ok(())
    }
}

impl Getter for MsImplementationVersionAttr {
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_MS_IMPLEMENTATION_VERSION)?;
        check_size(ATTR_MS_IMPLEMENTATION_VERSION, v.len(), VERSION_SIZE)?;
        self.0 = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
        Ok(())
    }
}
