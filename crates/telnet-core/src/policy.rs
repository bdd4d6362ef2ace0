//! Which options the server lets the peer turn on.
//!
//! The server implements almost nothing: window size reports from the peer,
//! go-ahead suppression in both directions, and server-side echo (which the
//! pseudo-terminal performs anyway). Everything else is refused.

use crate::protocol::{option, Verb};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionPolicy {
    /// Options the peer may enable on its side (answers to `WILL`).
    remote: Vec<u8>,
    /// Options the server agrees to enable on its side (answers to `DO`).
    local: Vec<u8>,
}

impl Default for OptionPolicy {
    fn default() -> Self {
        Self::refuse_all()
            .allow_remote(option::NAWS)
            .allow_remote(option::SGA)
            .allow_local(option::SGA)
            .allow_local(option::ECHO)
    }
}

impl OptionPolicy {
    /// A policy that refuses every proposal.
    pub fn refuse_all() -> Self {
        Self {
            remote: Vec::new(),
            local: Vec::new(),
        }
    }

    pub fn allow_remote(mut self, opt: u8) -> Self {
        if !self.remote.contains(&opt) {
            self.remote.push(opt);
        }
        self
    }

    pub fn allow_local(mut self, opt: u8) -> Self {
        if !self.local.contains(&opt) {
            self.local.push(opt);
        }
        self
    }

    pub fn accepts(&self, verb: Verb, opt: u8) -> bool {
        match verb {
            Verb::Will => self.remote.contains(&opt),
            Verb::Do => self.local.contains(&opt),
            Verb::Wont | Verb::Dont => true,
        }
    }

    /// Reply to send for `IAC <verb> <opt>`, if any.
    ///
    /// Accepted proposals are acknowledgements of the server's own offers and
    /// get no answer; `WONT`/`DONT` never get one either.
    pub fn respond(&self, verb: Verb, opt: u8) -> Option<[u8; 3]> {
        if self.accepts(verb, opt) {
            return None;
        }
        verb.refusal().map(|answer| answer.command(opt))
    }
}
