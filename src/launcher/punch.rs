//! Punch payload: the bootstrap record a new child reads from stdin.
//!
//! Eight newline-terminated lines, in order:
//!
//! ```text
//! host authority
//! process id
//! process kind          in-process | local | socket | remote:<host>
//! integrity level       low | medium | high
//! write handle          child → parent stream
//! read handle           parent → child stream
//! shutdown handle       EOF means "shut down"
//! parent os pid
//! ```
//!
//! Handles are written as `-` (none), `fd:<n>` (inherited descriptor),
//! `tcp:<addr>` (rendezvous socket, one connection for both directions) or
//! `mem` (in-memory, in-process children only).

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::ipc::message::{IntegrityLevel, ProcessKind};
use crate::types::{Error, ProcessId, Result};

/// Number of lines in a punch payload.
pub const PUNCH_LINES: usize = 8;

/// A transport handle as named in the punch payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleRef {
    None,
    Fd(i32),
    Tcp(SocketAddr),
    Memory,
}

impl fmt::Display for HandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleRef::None => write!(f, "-"),
            HandleRef::Fd(fd) => write!(f, "fd:{}", fd),
            HandleRef::Tcp(addr) => write!(f, "tcp:{}", addr),
            HandleRef::Memory => write!(f, "mem"),
        }
    }
}

impl FromStr for HandleRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "-" {
            return Ok(HandleRef::None);
        }
        if s == "mem" {
            return Ok(HandleRef::Memory);
        }
        if let Some(fd) = s.strip_prefix("fd:") {
            return fd
                .parse::<i32>()
                .ok()
                .filter(|fd| *fd >= 0)
                .map(HandleRef::Fd)
                .ok_or_else(|| Error::handshake(format!("bad descriptor handle: {:?}", s)));
        }
        if let Some(addr) = s.strip_prefix("tcp:") {
            return addr
                .parse::<SocketAddr>()
                .map(HandleRef::Tcp)
                .map_err(|e| Error::handshake(format!("bad socket handle {:?}: {}", s, e)));
        }
        Err(Error::handshake(format!("unknown handle: {:?}", s)))
    }
}

/// Bootstrap record for one child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunchPayload {
    pub host: String,
    pub process_id: ProcessId,
    pub kind: ProcessKind,
    pub integrity: IntegrityLevel,
    pub write_handle: HandleRef,
    pub read_handle: HandleRef,
    pub shutdown_handle: HandleRef,
    pub parent_pid: u32,
}

impl PunchPayload {
    pub fn to_text(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
            self.host,
            self.process_id,
            self.kind,
            self.integrity,
            self.write_handle,
            self.read_handle,
            self.shutdown_handle,
            self.parent_pid
        )
    }

    pub fn parse(text: &str) -> Result<Self> {
        let lines: Vec<&str> = text
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .collect();
        if lines.len() < PUNCH_LINES {
            return Err(Error::handshake(format!(
                "punch payload has {} lines, expected {}",
                lines.len(),
                PUNCH_LINES
            )));
        }
        if lines[PUNCH_LINES..].iter().any(|line| !line.trim().is_empty()) {
            return Err(Error::handshake("trailing data after punch payload"));
        }

        let host = lines[0].to_string();
        if host.is_empty() {
            return Err(Error::handshake("punch payload has empty host"));
        }
        let process_id = lines[1].parse::<ProcessId>().map_err(Error::handshake)?;
        let kind = lines[2]
            .parse::<ProcessKind>()
            .map_err(|e| Error::handshake(e.to_string()))?;
        let integrity = lines[3]
            .parse::<IntegrityLevel>()
            .map_err(|e| Error::handshake(e.to_string()))?;
        let parent_pid = lines[7]
            .parse::<u32>()
            .map_err(|e| Error::handshake(format!("bad parent pid {:?}: {}", lines[7], e)))?;

        Ok(Self {
            host,
            process_id,
            kind,
            integrity,
            write_handle: lines[4].parse()?,
            read_handle: lines[5].parse()?,
            shutdown_handle: lines[6].parse()?,
            parent_pid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> PunchPayload {
        PunchPayload {
            host: "localhost".into(),
            process_id: "P1".parse().unwrap(),
            kind: ProcessKind::Local,
            integrity: IntegrityLevel::Low,
            write_handle: HandleRef::Fd(5),
            read_handle: HandleRef::Fd(6),
            shutdown_handle: HandleRef::Fd(7),
            parent_pid: 1234,
        }
    }

    #[test]
    fn test_text_form_is_line_oriented() {
        let text = sample().to_text();
        assert_eq!(
            text,
            "localhost\nP1\nlocal\nlow\nfd:5\nfd:6\nfd:7\n1234\n"
        );
        assert_eq!(PunchPayload::parse(&text).unwrap(), sample());
    }

    #[test]
    fn test_socket_and_memory_handles() {
        let payload = PunchPayload {
            kind: ProcessKind::Remote {
                host: "build-02".into(),
            },
            write_handle: HandleRef::Tcp("10.0.0.5:4100".parse().unwrap()),
            read_handle: HandleRef::Tcp("10.0.0.5:4100".parse().unwrap()),
            shutdown_handle: HandleRef::None,
            ..sample()
        };
        assert_eq!(PunchPayload::parse(&payload.to_text()).unwrap(), payload);
        assert_eq!("mem".parse::<HandleRef>().unwrap(), HandleRef::Memory);
    }

    #[test]
    fn test_crlf_tolerated() {
        let text = sample().to_text().replace('\n', "\r\n");
        assert_eq!(PunchPayload::parse(&text).unwrap(), sample());
    }

    #[test]
    fn test_rejects_short_or_garbled_payload() {
        assert!(matches!(
            PunchPayload::parse("localhost\nP1\n"),
            Err(Error::Handshake(_))
        ));
        let bad_fd = sample().to_text().replace("fd:5", "fd:-3");
        assert!(PunchPayload::parse(&bad_fd).is_err());
        let bad_kind = sample().to_text().replace("local", "thread");
        assert!(PunchPayload::parse(&bad_kind).is_err());
        let trailing = format!("{}extra\n", sample().to_text());
        assert!(PunchPayload::parse(&trailing).is_err());
    }
}
