//! Telnet IAC option negotiation (RFC 854/855).
//!
//! Decoding is stateless per call: [`Negotiator::decode`] separates
//! application bytes from protocol commands in one buffer, produces the
//! replies our option policy dictates, and reports how many bytes it
//! consumed. A command cut off at the end of the buffer is left
//! unconsumed so the caller can retry once more bytes arrive.

/// Telnet command bytes.
pub mod cmd {
    /// Interpret As Command.
    pub const IAC: u8 = 255;
    pub const DONT: u8 = 254;
    pub const DO: u8 = 253;
    pub const WONT: u8 = 252;
    pub const WILL: u8 = 251;
    /// Subnegotiation begin.
    pub const SB: u8 = 250;
    /// Go Ahead.
    pub const GA: u8 = 249;
    pub const NOP: u8 = 241;
    /// Subnegotiation end.
    pub const SE: u8 = 240;
}

/// Telnet option codes.
pub mod opt {
    pub const ECHO: u8 = 1;
    /// Suppress Go-Ahead.
    pub const SGA: u8 = 3;
    pub const TERMINAL_TYPE: u8 = 24;
    /// Negotiate About Window Size.
    pub const NAWS: u8 = 31;
}

use cmd::*;

/// TERMINAL-TYPE subnegotiation verbs (RFC 1091).
const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;

/// Terminal type reported to the device.
const TERMINAL_NAME: &[u8] = b"VT100";

/// Output of one decode pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Decoded {
    /// Application bytes with every protocol byte removed.
    pub data: Vec<u8>,

    /// Negotiation replies to write back to the peer.
    pub replies: Vec<u8>,

    /// Number of input bytes consumed.
    pub consumed: usize,
}

/// Option negotiation policy for a CLI client.
#[derive(Debug, Clone, Copy)]
pub struct Negotiator {
    width: u16,
    height: u16,
}

impl Negotiator {
    /// Create a negotiator that reports the given window size via NAWS.
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// Split `input` into application data and negotiation replies.
    pub fn decode(&self, input: &[u8]) -> Decoded {
        let mut out = Decoded::default();
        let mut i = 0;

        while i < input.len() {
            let byte = input[i];
            if byte != IAC {
                out.data.push(byte);
                i += 1;
                continue;
            }

            let Some(&verb) = input.get(i + 1) else {
                break;
            };
            match verb {
                IAC => {
                    out.data.push(IAC);
                    i += 2;
                }
                DO | DONT | WILL | WONT => {
                    let Some(&option) = input.get(i + 2) else {
                        break;
                    };
                    out.replies.extend_from_slice(&self.answer(verb, option));
                    i += 3;
                }
                SB => {
                    let Some(end) = find_subnegotiation_end(input, i + 2) else {
                        break;
                    };
                    self.answer_subnegotiation(&input[i + 2..end], &mut out.replies);
                    i = end + 2;
                }
                // NOP, GA and the other two-byte commands carry no data.
                _ => i += 2,
            }
        }

        out.consumed = i;
        out
    }

    /// The reply to `IAC <verb> <option>`.
    pub fn answer(&self, verb: u8, option: u8) -> Vec<u8> {
        match (verb, option) {
            (DO, opt::SGA) | (DO, opt::TERMINAL_TYPE) => vec![IAC, WILL, option],
            (DO, opt::NAWS) => {
                let mut reply = vec![IAC, WILL, opt::NAWS];
                reply.extend_from_slice(&naws(self.width, self.height));
                reply
            }
            (DO, _) => vec![IAC, WONT, option],
            (WILL, opt::ECHO) | (WILL, opt::SGA) => vec![IAC, DO, option],
            (WILL, _) | (WONT, _) => vec![IAC, DONT, option],
            (DONT, _) => vec![IAC, WONT, option],
            _ => Vec::new(),
        }
    }

    fn answer_subnegotiation(&self, body: &[u8], replies: &mut Vec<u8>) {
        if body == [opt::TERMINAL_TYPE, TTYPE_SEND] {
            replies.extend_from_slice(&[IAC, SB, opt::TERMINAL_TYPE, TTYPE_IS]);
            replies.extend_from_slice(TERMINAL_NAME);
            replies.extend_from_slice(&[IAC, SE]);
        }
    }
}

/// Index of the `IAC` that starts `IAC SE`, searching from `from`.
fn find_subnegotiation_end(input: &[u8], from: usize) -> Option<usize> {
    let mut j = from;
    while j + 1 < input.len() {
        if input[j] == IAC {
            match input[j + 1] {
                SE => return Some(j),
                IAC => j += 2,
                _ => j += 1,
            }
        } else {
            j += 1;
        }
    }
    None
}

/// `IAC SB NAWS <width> <height> IAC SE`, with 0xFF data bytes doubled.
pub fn naws(width: u16, height: u16) -> Vec<u8> {
    let mut frame = vec![IAC, SB, opt::NAWS];
    frame.extend_from_slice(&escape(&width.to_be_bytes()));
    frame.extend_from_slice(&escape(&height.to_be_bytes()));
    frame.extend_from_slice(&[IAC, SE]);
    frame
}

/// Double every 0xFF so application data is not read as a command.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        out.push(byte);
        if byte == IAC {
            out.push(IAC);
        }
    }
    out
}
