//! Command framing and response splitting.
//!
//! Command layout: header (tag u16, total size u32, command code u32) ->
//! handle area (u32 each) -> optional authorization area (u32 byte length,
//! then per session: handle u32, nonce 2B, attributes u8, auth 2B) ->
//! parameter area.
//!
//! Response layout: header (tag u16, total size u32, response code u32); a
//! non-success response is exactly the 10-byte header. A success response
//! continues with an optional allocated handle, then (when sessions were
//! sent) a u32 parameter-area size followed by the parameters and one
//! acknowledgement per session (nonce 2B, attributes u8, hmac 2B); without
//! sessions the parameters simply run to the end of the buffer.

use super::buffer::{WireError, WireReader, WireWriter};
use super::constants::{CommandCode, ResponseCode, SessionAttributes, SessionTag};

/// Response header length; an error response carries nothing else.
pub const RESPONSE_HEADER_LEN: usize = 10;

/// One authorization-area entry as transmitted with a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCommand {
    pub session_handle: u32,
    pub nonce: Vec<u8>,
    pub attributes: SessionAttributes,
    /// HMAC for keyed sessions, the plaintext auth value for the password
    /// session, empty for policy sessions without an auth-value leg.
    pub auth: Vec<u8>,
}

/// One per-session acknowledgement parsed from a success response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub nonce: Vec<u8>,
    pub attributes: SessionAttributes,
    pub hmac: Vec<u8>,
}

/// A fully resolved command ready for serialization.
#[derive(Debug)]
pub struct CommandFrame<'a> {
    pub code: CommandCode,
    pub handles: &'a [u32],
    pub auths: &'a [AuthCommand],
    pub params: &'a [u8],
}

/// The structured form of a decoded device response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub rc: ResponseCode,
    pub handle: Option<u32>,
    pub params: Vec<u8>,
    pub acks: Vec<AuthResponse>,
}

/// Serialize `frame` into the device wire format.
///
/// Deterministic: identical frames always produce identical bytes.
///
/// # Errors
/// Returns `WireError::Oversize` if a nonce or auth value does not fit its
/// 16-bit size prefix.
pub fn encode_command(frame: &CommandFrame<'_>) -> Result<Vec<u8>, WireError> {
    let tag = if frame.auths.is_empty() {
        SessionTag::NoSessions
    } else {
        SessionTag::Sessions
    };

    let mut w = WireWriter::new();
    w.write_u16(tag.value());
    w.write_u32(0); // patched below
    w.write_u32(frame.code.value());
    for h in frame.handles {
        w.write_u32(*h);
    }

    if !frame.auths.is_empty() {
        let mut area = WireWriter::new();
        for auth in frame.auths {
            area.write_u32(auth.session_handle);
            area.write_sized(&auth.nonce)?;
            area.write_u8(auth.attributes.value());
            area.write_sized(&auth.auth)?;
        }
        let area = area.into_bytes();
        let area_len =
            u32::try_from(area.len()).map_err(|_| WireError::Oversize { len: area.len() })?;
        w.write_u32(area_len);
        w.write_bytes(&area);
    }

    w.write_bytes(frame.params);

    let mut bytes = w.into_bytes();
    let total =
        u32::try_from(bytes.len()).map_err(|_| WireError::Oversize { len: bytes.len() })?;
    bytes[2..6].copy_from_slice(&total.to_be_bytes());
    Ok(bytes)
}

/// Split a raw device response into its structured parts.
///
/// `sessions` is the number of authorization-area entries that accompanied
/// the command; `returns_handle` whether this command code allocates a device
/// handle. Both are properties of the invocation, not of the bytes, so the
/// caller must supply them.
///
/// # Errors
/// Any structural inconsistency (declared size vs. buffer length, a size
/// field past the end, trailing bytes, an unknown tag, a tag that disagrees
/// with `sessions`) is a `WireError`; the pipeline reports these as a
/// malformed response.
pub fn decode_response(
    bytes: &[u8],
    sessions: usize,
    returns_handle: bool,
) -> Result<ResponseFrame, WireError> {
    let mut r = WireReader::new(bytes);
    let tag_raw = r.read_u16()?;
    let tag = SessionTag::from_u16(tag_raw).ok_or(WireError::BadTag(tag_raw))?;
    let declared = r.read_u32()? as usize;
    if declared != bytes.len() {
        return Err(WireError::SizeMismatch {
            declared,
            actual: bytes.len(),
        });
    }
    let rc = ResponseCode(r.read_u32()?);

    if !rc.is_success() {
        // Error responses are header-only and always tagged NoSessions.
        if bytes.len() != RESPONSE_HEADER_LEN {
            return Err(WireError::SizeMismatch {
                declared: RESPONSE_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        return Ok(ResponseFrame {
            rc,
            handle: None,
            params: Vec::new(),
            acks: Vec::new(),
        });
    }

    let expected_tag = if sessions == 0 {
        SessionTag::NoSessions
    } else {
        SessionTag::Sessions
    };
    if tag != expected_tag {
        return Err(WireError::BadTag(tag_raw));
    }

    let handle = if returns_handle { Some(r.read_u32()?) } else { None };

    let (params, acks) = if sessions == 0 {
        (r.take_remaining().to_vec(), Vec::new())
    } else {
        let param_len = r.read_u32()? as usize;
        let params = r.read_bytes(param_len)?.to_vec();
        let mut acks = Vec::with_capacity(sessions);
        for _ in 0..sessions {
            let nonce = r.read_sized()?.to_vec();
            let attributes = SessionAttributes::from_u8(r.read_u8()?);
            let hmac = r.read_sized()?.to_vec();
            acks.push(AuthResponse {
                nonce,
                attributes,
                hmac,
            });
        }
        r.expect_end()?;
        (params, acks)
    };

    Ok(ResponseFrame {
        rc,
        handle,
        params,
        acks,
    })
}
