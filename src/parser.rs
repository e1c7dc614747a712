//! Parses command lines of the beanstalkd TCP protocol.
use std::fmt;

use crate::types::protocol::WireCommand;
use crate::types::serialisable::WireSerialise;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    BadFormat,
    UnknownCommand,
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::BadFormat => "bad format",
            Self::UnknownCommand => "unknown command",
        })
    }
}

impl WireSerialise for ParsingError {
    fn serialise_wire(&self) -> Vec<u8> {
        match self {
            ParsingError::BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            ParsingError::UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
        }
    }
}

/// Minimal zero-copy scanner over one command line (CRLF already
/// stripped).
struct Scanner<'a> {
    rest: &'a [u8],
}

impl<'a> Scanner<'a> {
    fn new(rest: &'a [u8]) -> Self {
        Scanner { rest }
    }

    /// Asserts the whole line was consumed, returning `cmd` if so.
    fn finish(&self, cmd: WireCommand) -> Result<WireCommand, ParsingError> {
        if self.rest.is_empty() {
            Ok(cmd)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// Takes bytes up to the next space or end of line. Empty tokens are
    /// rejected, so consecutive spaces fail.
    fn token(&mut self) -> Result<&'a [u8], ParsingError> {
        let rest = self.rest;
        let idx = rest.iter().position(|c| *c == b' ').unwrap_or(rest.len());
        let (token, tail) = rest.split_at(idx);
        self.rest = tail;

        if token.is_empty() {
            Err(ParsingError::BadFormat)
        } else {
            Ok(token)
        }
    }

    fn space(&mut self) -> Result<(), ParsingError> {
        match self.rest.first() {
            Some(b' ') => {
                self.rest = &self.rest[1..];
                Ok(())
            },
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes a space then a decimal u32, rejecting overflow.
    fn u32(&mut self) -> Result<u32, ParsingError> {
        self.space()?;

        let mut r = 0u32;
        for v in self.token()? {
            match v {
                b'0'..=b'9' => {
                    r = r
                        .checked_mul(10)
                        .and_then(|r| r.checked_add((*v - b'0') as u32))
                        .ok_or(ParsingError::BadFormat)?
                },
                _ => return Err(ParsingError::BadFormat),
            };
        }

        Ok(r)
    }

    /// Consumes a space then a decimal u64, rejecting overflow.
    fn u64(&mut self) -> Result<u64, ParsingError> {
        self.space()?;

        let mut r = 0u64;
        for v in self.token()? {
            match v {
                b'0'..=b'9' => {
                    r = r
                        .checked_mul(10)
                        .and_then(|r| r.checked_add((*v - b'0') as u64))
                        .ok_or(ParsingError::BadFormat)?
                },
                _ => return Err(ParsingError::BadFormat),
            };
        }

        Ok(r)
    }

    /// Consumes a space then a tube name: at most 200 bytes of the name
    /// charset, with `-` disallowed in first position.
    fn name(&mut self) -> Result<String, ParsingError> {
        self.space()?;

        let token = self.token()?;

        fn name_safe(c: u8, is_first: bool) -> bool {
            match c {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' => true,
                b'+' | b'/' | b';' | b'.' | b'$' | b'_' | b'(' | b')' => true,
                b'-' => !is_first,
                _ => false,
            }
        }

        if token.len() <= 200
            && token.iter().enumerate().all(|(i, c)| name_safe(*c, i == 0))
        {
            // The charset check admits ASCII only.
            String::from_utf8(token.to_vec()).map_err(|_| ParsingError::BadFormat)
        } else {
            Err(ParsingError::BadFormat)
        }
    }
}

impl TryFrom<&[u8]> for WireCommand {
    type Error = ParsingError;

    fn try_from(line: &[u8]) -> Result<Self, Self::Error> {
        use WireCommand::*;

        let mut sc = Scanner::new(line);

        let cmd = match sc.token()? {
            // <cmd>
            b"list-tube-used" => ListTubeUsed,
            b"list-tubes-watched" => ListTubesWatched,
            b"list-tubes" => ListTubes,
            b"peek-buried" => PeekBuried,
            b"peek-delayed" => PeekDelayed,
            b"peek-ready" => PeekReady,
            b"quit" => Quit,
            b"reserve" => Reserve,

            // <cmd> <id>
            b"delete" => Delete { id: sc.u64()? },
            b"kick-job" => KickJob { id: sc.u64()? },
            b"peek" => Peek { id: sc.u64()? },
            b"touch" => Touch { id: sc.u64()? },

            // <cmd> <bound>
            b"kick" => Kick { bound: sc.u64()? },

            // <cmd> <timeout>
            b"reserve-with-timeout" => ReserveWithTimeout { timeout: sc.u32()? },

            // <cmd> <tube>
            b"use" => Use { tube: sc.name()? },
            b"watch" => Watch { tube: sc.name()? },
            b"ignore" => Ignore { tube: sc.name()? },

            // <cmd> <id> <pri>
            b"bury" => Bury {
                id: sc.u64()?,
                pri: sc.u32()?,
            },

            // <cmd> <id> <pri> <delay>
            b"release" => Release {
                id: sc.u64()?,
                pri: sc.u32()?,
                delay: sc.u32()?,
            },

            // <cmd> <pri> <delay> <ttr> <n_bytes>
            b"put" => Put {
                pri: sc.u32()?,
                delay: sc.u32()?,
                ttr: sc.u32()?,
                n_bytes: sc.u32()?,
            },

            _ => return Err(ParsingError::UnknownCommand),
        };

        sc.finish(cmd)
    }
}
