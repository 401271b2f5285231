
use stun::attributes::ATTR_USE_CANDIDATE;
use stun::message::*;

/// Represents the USE-CANDIDATE attribute. Only the controlling agent may
/// include it, RFC 5245 8.1.1.
#[derive(Default)]
pub struct UseCandidateAttr;

impl UseCandidateAttr {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns true if the USE-CANDIDATE attribute is set on the message.
    #[must_use]
    pub fn is_set(m: &Message) -> bool {
        m.get(ATTR_USE_CANDIDATE).is_ok()
    }
}

impl Setter for UseCandidateAttr {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_USE_CANDIDATE, &[]);
        Ok(())
    }
}
