use stun::message::MESSAGE_HEADER_SIZE;

/// How packets are delimited on a byte stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpFraming {
    /// 2-byte big-endian length prefix per datagram, RFC 4571. Used
    /// between ICE TCP candidates.
    Rfc4571,
    /// Raw STUN/ChannelData framing as used on a TCP connection to a
    /// TURN server: the frame length is carried in the message header
    /// itself.
    Turn,
}

/// Prepends the RFC 4571 length prefix. Packets longer than a u16 cannot
/// be framed and are truncated by the caller before reaching this point.
pub fn frame_rfc4571(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(2 + payload.len());
    framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Returns the total byte length of the first complete frame in `buf`,
/// or `None` when more bytes are needed.
pub fn frame_len(framing: TcpFraming, buf: &[u8]) -> Option<usize> {
    match framing {
        TcpFraming::Rfc4571 => {
            if buf.len() < 2 {
                return None;
            }
            let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            let total = 2 + len;
            (buf.len() >= total).then_some(total)
        }
        TcpFraming::Turn => {
            if buf.len() < 4 {
                return None;
            }
            let total = if buf[0] & 0xc0 == 0x40 {
                // ChannelData: 4-byte header, payload padded to 4 bytes
                // on stream transports.
                let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                4 + (len + 3) / 4 * 4
            } else {
                // STUN message: header carries the attribute length.
                if buf.len() < MESSAGE_HEADER_SIZE {
                    return None;
                }
                let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                MESSAGE_HEADER_SIZE + len
            };
            (buf.len() >= total).then_some(total)
        }
    }
}

/// Splits the payload out of a complete RFC 4571 frame of `total` bytes.
pub fn strip_rfc4571(frame: &[u8]) -> &[u8] {
    &frame[2..]
}
