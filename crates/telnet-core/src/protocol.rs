//! Telnet command and option bytes (RFC 854, RFC 855, RFC 1073).

/// Interpret As Command: introduces every control sequence.
pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
/// Subnegotiation begin.
pub const SB: u8 = 250;
pub const GA: u8 = 249;
pub const EL: u8 = 248;
pub const EC: u8 = 247;
pub const AYT: u8 = 246;
pub const AO: u8 = 245;
pub const IP: u8 = 244;
pub const BRK: u8 = 243;
pub const DM: u8 = 242;
pub const NOP: u8 = 241;
/// Subnegotiation end.
pub const SE: u8 = 240;

pub mod option {
    pub const BINARY: u8 = 0;
    pub const ECHO: u8 = 1;
    pub const SGA: u8 = 3;
    pub const STATUS: u8 = 5;
    pub const TIMING_MARK: u8 = 6;
    pub const TTYPE: u8 = 24;
    pub const NAWS: u8 = 31;
    pub const TSPEED: u8 = 32;
    pub const LFLOW: u8 = 33;
    pub const LINEMODE: u8 = 34;
    pub const NEW_ENVIRON: u8 = 39;
}

/// Human-readable option name for log output.
pub fn option_name(opt: u8) -> &'static str {
    match opt {
        option::BINARY => "BINARY",
        option::ECHO => "ECHO",
        option::SGA => "SGA",
        option::STATUS => "STATUS",
        option::TIMING_MARK => "TIMING-MARK",
        option::TTYPE => "TTYPE",
        option::NAWS => "NAWS",
        option::TSPEED => "TSPEED",
        option::LFLOW => "LFLOW",
        option::LINEMODE => "LINEMODE",
        option::NEW_ENVIRON => "NEW-ENVIRON",
        _ => "UNKNOWN",
    }
}

/// One of the four option negotiation verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Will,
    Wont,
    Do,
    Dont,
}

impl Verb {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            WILL => Some(Verb::Will),
            WONT => Some(Verb::Wont),
            DO => Some(Verb::Do),
            DONT => Some(Verb::Dont),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Verb::Will => WILL,
            Verb::Wont => WONT,
            Verb::Do => DO,
            Verb::Dont => DONT,
        }
    }

    /// The negative answer to a proposal, if this verb is one.
    pub fn refusal(self) -> Option<Verb> {
        match self {
            Verb::Will => Some(Verb::Dont),
            Verb::Do => Some(Verb::Wont),
            Verb::Wont | Verb::Dont => None,
        }
    }

    /// Encode `IAC <verb> <option>`.
    pub fn command(self, opt: u8) -> [u8; 3] {
        [IAC, self.to_byte(), opt]
    }
}

/// Terminal dimensions reported through NAWS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl WindowSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Decode a NAWS payload: width then height, each big-endian u16.
    pub fn from_naws(payload: &[u8]) -> Option<Self> {
        match payload {
            [w0, w1, h0, h1] => Some(Self {
                cols: u16::from_be_bytes([*w0, *w1]),
                rows: u16::from_be_bytes([*h0, *h1]),
            }),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cols == 0 || self.rows == 0
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Negotiation the server opens every session with: ask for window size
/// reports, and announce that it echoes and suppresses go-ahead.
pub fn greeting() -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.extend_from_slice(&Verb::Do.command(option::NAWS));
    out.extend_from_slice(&Verb::Will.command(option::ECHO));
    out.extend_from_slice(&Verb::Will.command(option::SGA));
    out
}
