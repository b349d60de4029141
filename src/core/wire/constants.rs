//! Protocol constants: framing tags, command and response codes, algorithm
//! identifiers, reserved device handles and session attribute bits.
//!
//! Values are the TPM 2.0 protocol's normative constants; the device's own
//! parser rejects anything else, so these are not tunable.

use core::fmt;
use core::ops::BitOr;

/// Framing tag in the first two bytes of every command and response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTag {
    /// No authorization area follows the handle area.
    NoSessions,
    /// A byte-length-prefixed authorization area follows the handle area.
    Sessions,
}

impl SessionTag {
    #[must_use]
    pub fn value(self) -> u16 {
        match self {
            SessionTag::NoSessions => 0x8001,
            SessionTag::Sessions => 0x8002,
        }
    }

    #[must_use]
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x8001 => Some(SessionTag::NoSessions),
            0x8002 => Some(SessionTag::Sessions),
            _ => None,
        }
    }
}

/// 32-bit command code in the command header.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandCode(pub u32);

impl CommandCode {
    pub const EVICT_CONTROL: CommandCode = CommandCode(0x0000_0120);
    pub const CLEAR_CONTROL: CommandCode = CommandCode(0x0000_0127);
    pub const STARTUP: CommandCode = CommandCode(0x0000_0144);
    pub const POLICY_SECRET: CommandCode = CommandCode(0x0000_0151);
    pub const FLUSH_CONTEXT: CommandCode = CommandCode(0x0000_0165);
    pub const POLICY_AUTH_VALUE: CommandCode = CommandCode(0x0000_016B);
    pub const POLICY_COMMAND_CODE: CommandCode = CommandCode(0x0000_016C);
    pub const READ_PUBLIC: CommandCode = CommandCode(0x0000_0173);
    pub const START_AUTH_SESSION: CommandCode = CommandCode(0x0000_0176);
    pub const GET_RANDOM: CommandCode = CommandCode(0x0000_017B);
    pub const POLICY_GET_DIGEST: CommandCode = CommandCode(0x0000_0189);
    pub const POLICY_PASSWORD: CommandCode = CommandCode(0x0000_018C);
    pub const POLICY_TEMPLATE: CommandCode = CommandCode(0x0000_0190);

    #[must_use]
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandCode({:#010x})", self.0)
    }
}

/// 32-bit response code in the response header.
///
/// Carried verbatim on every device-originated error so callers can tell a
/// bad-authorization rejection from a disabled hierarchy or an unsupported
/// command without this layer interpreting the full format-1/format-0 split.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode(pub u32);

impl ResponseCode {
    pub const SUCCESS: ResponseCode = ResponseCode(0x0000_0000);
    /// Warning: the command was not executed, resend later.
    pub const YIELDED: ResponseCode = ResponseCode(0x0000_0908);
    /// Warning: the device is running its self test, resend later.
    pub const TESTING: ResponseCode = ResponseCode(0x0000_090A);
    /// Warning: the command could not be accepted right now, resend later.
    pub const RETRY: ResponseCode = ResponseCode(0x0000_0922);

    #[must_use]
    pub fn is_success(self) -> bool {
        self == ResponseCode::SUCCESS
    }

    /// Transient "try again" codes the pipeline resubmits on (bounded).
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ResponseCode::RETRY | ResponseCode::YIELDED | ResponseCode::TESTING
        )
    }

    #[must_use]
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseCode({:#010x})", self.0)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// 16-bit algorithm identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlgId(pub u16);

impl AlgId {
    pub const AES: AlgId = AlgId(0x0006);
    pub const SHA256: AlgId = AlgId(0x000B);
    pub const SHA384: AlgId = AlgId(0x000C);
    pub const NULL: AlgId = AlgId(0x0010);
    pub const CFB: AlgId = AlgId(0x0043);

    #[must_use]
    pub fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for AlgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AlgId({:#06x})", self.0)
    }
}

/// Session attribute byte carried in each authorization-area entry.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionAttributes(pub u8);

impl SessionAttributes {
    /// Keep the session alive after this command.
    pub const CONTINUE_SESSION: SessionAttributes = SessionAttributes(0x01);
    /// Session audits this command exclusively.
    pub const AUDIT_EXCLUSIVE: SessionAttributes = SessionAttributes(0x02);
    /// Reset the audit digest before this command.
    pub const AUDIT_RESET: SessionAttributes = SessionAttributes(0x04);
    /// Session encrypts the first command parameter (caller -> device).
    pub const DECRYPT: SessionAttributes = SessionAttributes(0x20);
    /// Session encrypts the first response parameter (device -> caller).
    pub const ENCRYPT: SessionAttributes = SessionAttributes(0x40);
    /// Session audits commands.
    pub const AUDIT: SessionAttributes = SessionAttributes(0x80);

    #[must_use]
    pub fn contains(self, other: SessionAttributes) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn value(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn from_u8(v: u8) -> Self {
        SessionAttributes(v)
    }
}

impl BitOr for SessionAttributes {
    type Output = SessionAttributes;
    fn bitor(self, rhs: SessionAttributes) -> SessionAttributes {
        SessionAttributes(self.0 | rhs.0)
    }
}

impl fmt::Debug for SessionAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionAttributes({:#04x})", self.0)
    }
}

/// Reserved device handle values (handle type `0x40`, permanent).
pub mod reserved {
    /// Owner hierarchy.
    pub const RH_OWNER: u32 = 0x4000_0001;
    /// Null hierarchy.
    pub const RH_NULL: u32 = 0x4000_0007;
    /// The well-known plaintext password session.
    pub const RS_PW: u32 = 0x4000_0009;
    /// Dictionary-attack lockout authority.
    pub const RH_LOCKOUT: u32 = 0x4000_000A;
    /// Endorsement hierarchy.
    pub const RH_ENDORSEMENT: u32 = 0x4000_000B;
    /// Platform hierarchy.
    pub const RH_PLATFORM: u32 = 0x4000_000C;
}

/// Handle-type prefixes (top byte of a device handle value).
pub mod handle_type {
    pub const HMAC_SESSION: u8 = 0x02;
    pub const POLICY_SESSION: u8 = 0x03;
    pub const PERMANENT: u8 = 0x40;
    pub const TRANSIENT: u8 = 0x80;
    pub const PERSISTENT: u8 = 0x81;
}

/// Startup type parameter values for the startup command.
pub mod startup {
    pub const SU_CLEAR: u16 = 0x0000;
    pub const SU_STATE: u16 = 0x0001;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_values_round_trip() {
        for tag in [SessionTag::NoSessions, SessionTag::Sessions] {
            assert_eq!(SessionTag::from_u16(tag.value()), Some(tag));
        }
        assert_eq!(SessionTag::from_u16(0x8000), None);
    }

    #[test]
    fn transient_codes_are_the_warning_trio() {
        assert!(ResponseCode::RETRY.is_transient());
        assert!(ResponseCode::YIELDED.is_transient());
        assert!(ResponseCode::TESTING.is_transient());
        assert!(!ResponseCode::SUCCESS.is_transient());
        assert!(!ResponseCode(0x0000_098E).is_transient());
    }

    #[test]
    fn attribute_bits_compose() {
        let a = SessionAttributes::CONTINUE_SESSION | SessionAttributes::DECRYPT;
        assert!(a.contains(SessionAttributes::CONTINUE_SESSION));
        assert!(a.contains(SessionAttributes::DECRYPT));
        assert!(!a.contains(SessionAttributes::ENCRYPT));
        assert_eq!(a.value(), 0x21);
    }
}
