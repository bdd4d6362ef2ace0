//! Streaming decoder for the client → terminal direction.
//!
//! Literal bytes pass through to the sink; `IAC` sequences are consumed and
//! acted on. State carries across `feed` calls, so a sequence split between
//! two network reads decodes the same as one delivered whole.

use crate::policy::OptionPolicy;
use crate::protocol::{option, Verb, WindowSize, IAC, SB, SE};

/// Longest subnegotiation payload kept; longer ones are discarded.
const MAX_SUBNEG_PAYLOAD: usize = 64;

/// Receives everything the codec produces.
pub trait CodecSink {
    /// Decoded literal bytes, destined for the terminal.
    fn data(&mut self, bytes: &[u8]);

    /// Negotiation answers, destined for the client.
    fn reply(&mut self, bytes: &[u8]);

    /// The peer reported new terminal dimensions.
    fn window_size(&mut self, size: WindowSize);
}

/// Coarse view of the decoder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecState {
    Data,
    Command,
    Option,
    Subnegotiation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    /// Saw `IAC`.
    Command,
    /// Saw `IAC <verb>`.
    Negotiate(Verb),
    /// Saw `IAC SB`, waiting for the option byte.
    SubOption,
    /// Collecting payload for `option`.
    SubData(u8),
    /// Saw `IAC` inside a payload.
    SubIac(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelnetCodec {
    state: State,
    policy: OptionPolicy,
    payload: Vec<u8>,
    overflow: bool,
}

impl Default for TelnetCodec {
    fn default() -> Self {
        Self::new(OptionPolicy::default())
    }
}

impl TelnetCodec {
    pub fn new(policy: OptionPolicy) -> Self {
        Self {
            state: State::Data,
            policy,
            payload: Vec::new(),
            overflow: false,
        }
    }

    pub fn state(&self) -> CodecState {
        match self.state {
            State::Data => CodecState::Data,
            State::Command => CodecState::Command,
            State::Negotiate(_) => CodecState::Option,
            State::SubOption | State::SubData(_) | State::SubIac(_) => CodecState::Subnegotiation,
        }
    }

    /// Whether the decoder sits between sequences.
    pub fn is_idle(&self) -> bool {
        self.state == State::Data
    }

    /// Decode `input`, pushing results into `sink`.
    pub fn feed<S: CodecSink + ?Sized>(&mut self, input: &[u8], sink: &mut S) {
        let mut pos = 0;
        while pos < input.len() {
            if self.state == State::Data {
                // Hand over the whole run up to the next IAC in one piece.
                let rest = &input[pos..];
                let run = rest.iter().position(|&b| b == IAC).unwrap_or(rest.len());
                if run > 0 {
                    sink.data(&rest[..run]);
                    pos += run;
                    continue;
                }
            }
            self.step(input[pos], sink);
            pos += 1;
        }
    }

    fn step<S: CodecSink + ?Sized>(&mut self, byte: u8, sink: &mut S) {
        self.state = match self.state {
            State::Data => {
                if byte == IAC {
                    State::Command
                } else {
                    sink.data(&[byte]);
                    State::Data
                }
            }
            State::Command => Self::command(byte, sink),
            State::Negotiate(verb) => {
                if let Some(answer) = self.policy.respond(verb, byte) {
                    sink.reply(&answer);
                }
                State::Data
            }
            State::SubOption => {
                self.payload.clear();
                self.overflow = false;
                State::SubData(byte)
            }
            State::SubData(opt) => {
                if byte == IAC {
                    State::SubIac(opt)
                } else {
                    self.push_payload(byte);
                    State::SubData(opt)
                }
            }
            State::SubIac(opt) => match byte {
                SE => {
                    self.finish_subnegotiation(opt, sink);
                    State::Data
                }
                IAC => {
                    self.push_payload(IAC);
                    State::SubData(opt)
                }
                // Unterminated subnegotiation: abandon it and treat the
                // byte as the start of a new command.
                other => {
                    self.payload.clear();
                    self.overflow = false;
                    Self::command(other, sink)
                }
            },
        };
    }

    /// The byte following a bare `IAC`.
    fn command<S: CodecSink + ?Sized>(byte: u8, sink: &mut S) -> State {
        match byte {
            IAC => {
                sink.data(&[IAC]);
                State::Data
            }
            SB => State::SubOption,
            // GA, BRK, IP, AYT and friends are dropped.
            other => Verb::from_byte(other).map_or(State::Data, State::Negotiate),
        }
    }

    fn push_payload(&mut self, byte: u8) {
        if self.payload.len() < MAX_SUBNEG_PAYLOAD {
            self.payload.push(byte);
        } else {
            self.overflow = true;
        }
    }

    fn finish_subnegotiation<S: CodecSink + ?Sized>(&mut self, opt: u8, sink: &mut S) {
        if opt == option::NAWS && !self.overflow {
            if let Some(size) = WindowSize::from_naws(&self.payload) {
                sink.window_size(size);
            }
        }
        self.payload.clear();
        self.overflow = false;
    }
}
