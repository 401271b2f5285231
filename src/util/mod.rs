
use std::net::SocketAddr;
use std::sync::Arc;

use stun::attributes::ATTR_USERNAME;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::Username;
use util::vnet::net::*;
use util::Conn;

use crate::error::*;
use crate::stream::PortRange;

pub fn assert_inbound_username(m: &Message, expected_username: &str) -> Result<()> {
    let mut username = Username::new(ATTR_USERNAME, String::new());
    username.get_from(m)?;

    if username.to_string() != expected_username {
        return Err(Error::Other(format!(
            "{:?} expected({}) actual({})",
            Error::ErrMismatchUsername,
            expected_username,
            username,
        )));
    }

    Ok(())
}

/// The USERNAME of a check is `<receiver ufrag>:<sender ufrag>`; only the
/// prefix identifies the local side and picks the validation password.
pub fn username_prefix(m: &Message) -> Option<String> {
    let mut username = Username::new(ATTR_USERNAME, String::new());
    username.get_from(m).ok()?;
    let text = username.to_string();
    text.split(':').next().map(str::to_owned)
}

pub fn assert_inbound_message_integrity(m: &mut Message, key: &[u8]) -> Result<()> {
    let message_integrity_attr = MessageIntegrity(key.to_vec());
    Ok(message_integrity_attr.check(m)?)
}

/// Binds a UDP socket inside the port range, walking from a random start
/// port until a bind succeeds. An exhausted range fails the gather for
/// this candidate.
pub async fn listen_udp_in_port_range(
    vnet: &Arc<Net>,
    range: PortRange,
    laddr: SocketAddr,
) -> Result<Arc<dyn Conn + Send + Sync>> {
    if laddr.port() != 0 || range.is_unconstrained() {
        return Ok(vnet.bind(laddr).await?);
    }

    let i = if range.min == 0 { 1 } else { range.min };
    let j = if range.max == 0 { 0xFFFF } else { range.max };
    if i > j {
        return Err(Error::ErrInvalidPortRange);
    }

    let port_start = rand::random::<u16>() % (j - i + 1) + i;
    let mut port_current = port_start;
    loop {
        let laddr = SocketAddr::new(laddr.ip(), port_current);
        match vnet.bind(laddr).await {
            Ok(c) => return Ok(c),
            Err(err) => log::debug!("failed to listen {laddr}: {err}"),
        };

        port_current += 1;
        if port_current > j {
            port_current = i;
        }
        if port_current == port_start {
            break;
        }
    }

    Err(Error::ErrPortRangeExhausted)
}
