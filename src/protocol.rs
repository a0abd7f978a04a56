//! Wire format shared by [`crate::control::ControlServer`] and the `tinitctl` CLI client.
//!
//! The frames are fixed binary layouts, not a self-describing format, so this is a hand-rolled
//! little-endian codec rather than a `serde` derive — there is nothing here for a serializer to
//! infer that isn't already nailed down by the struct layout below.

use crate::error::SupervisorError;

/// Maximum pattern length, NUL terminator excluded.
pub const PATTERN_MAX: usize = 255;
/// Maximum total request size (header + pattern + NUL).
pub const REQUEST_SIZE_MAX: usize = 4 + PATTERN_MAX + 1;
/// Maximum total message size, request or reply.
pub const MSG_SIZE_MAX: usize = 4096;

pub const SOCK_NAME: &str = "tinit.sock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgType {
    Status = 0,
    Start = 1,
    Stop = 2,
    Restart = 3,
    Reload = 4,
    Switch = 5,
}

impl MsgType {
    fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(MsgType::Status),
            1 => Some(MsgType::Start),
            2 => Some(MsgType::Stop),
            3 => Some(MsgType::Restart),
            4 => Some(MsgType::Reload),
            5 => Some(MsgType::Switch),
            _ => None,
        }
    }
}

/// A decoded request frame: `u16 seq, u16 type, char[] pattern (NUL-terminated)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub seq: u16,
    pub kind: MsgType,
    pub pattern: String,
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.pattern.len() + 1);
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&(self.kind as u16).to_le_bytes());
        buf.extend_from_slice(self.pattern.as_bytes());
        buf.push(0);
        buf
    }

    pub fn decode(buf: &[u8]) -> std::result::Result<Self, SupervisorError> {
        if buf.len() < 4 || buf.len() > REQUEST_SIZE_MAX {
            return Err(SupervisorError::ProtocolError);
        }
        let seq = u16::from_le_bytes([buf[0], buf[1]]);
        let kind = MsgType::from_u16(u16::from_le_bytes([buf[2], buf[3]]))
            .ok_or(SupervisorError::ProtocolError)?;
        let raw = &buf[4..];
        let nul = raw
            .iter()
            .position(|&b| b == 0)
            .ok_or(SupervisorError::ProtocolError)?;
        if nul > PATTERN_MAX {
            return Err(SupervisorError::ProtocolError);
        }
        let pattern = std::str::from_utf8(&raw[..nul])
            .map_err(|_| SupervisorError::ProtocolError)?
            .to_owned();
        Ok(Request { seq, kind, pattern })
    }
}

/// A single service status record: `u32 pid, u8 admin_state, u8 run_state, char[] origin
/// (NUL-terminated)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub pid: u32,
    pub admin_on: bool,
    pub run_state: u8,
    pub origin: String,
}

impl StatusRecord {
    fn encoded_len(&self) -> usize {
        4 + 1 + 1 + self.origin.len() + 1
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.pid.to_le_bytes());
        buf.push(self.admin_on as u8);
        buf.push(self.run_state);
        buf.extend_from_slice(self.origin.as_bytes());
        buf.push(0);
    }

    fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < 6 {
            return None;
        }
        let pid = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let admin_on = buf[4] != 0;
        let run_state = buf[5];
        let rest = &buf[6..];
        let nul = rest.iter().position(|&b| b == 0)?;
        let origin = std::str::from_utf8(&rest[..nul]).ok()?.to_owned();
        Some((
            StatusRecord {
                pid,
                admin_on,
                run_state,
                origin,
            },
            6 + nul + 1,
        ))
    }
}

/// A decoded reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Reply to START/STOP/RESTART/RELOAD/SWITCH: `u16 seq, u16 type, u16 ret`.
    Named { seq: u16, kind: MsgType, ret: u16 },
    /// Reply to STATUS: head followed by zero or more [`StatusRecord`]s.
    Status {
        seq: u16,
        ret: u16,
        records: Vec<StatusRecord>,
    },
}

impl Reply {
    pub fn encode(&self) -> std::result::Result<Vec<u8>, SupervisorError> {
        match self {
            Reply::Named { seq, kind, ret } => {
                let mut buf = Vec::with_capacity(6);
                buf.extend_from_slice(&seq.to_le_bytes());
                buf.extend_from_slice(&(*kind as u16).to_le_bytes());
                buf.extend_from_slice(&ret.to_le_bytes());
                Ok(buf)
            }
            Reply::Status { seq, ret, records } => {
                let mut buf = Vec::with_capacity(6);
                buf.extend_from_slice(&seq.to_le_bytes());
                buf.extend_from_slice(&(MsgType::Status as u16).to_le_bytes());
                buf.extend_from_slice(&ret.to_le_bytes());
                for rec in records {
                    if buf.len() + rec.encoded_len() > MSG_SIZE_MAX {
                        return Err(SupervisorError::ReplyTooLarge(MSG_SIZE_MAX));
                    }
                    rec.encode_into(&mut buf);
                }
                Ok(buf)
            }
        }
    }

    pub fn decode(buf: &[u8]) -> std::result::Result<Self, SupervisorError> {
        if buf.len() < 6 {
            return Err(SupervisorError::ProtocolError);
        }
        let seq = u16::from_le_bytes([buf[0], buf[1]]);
        let kind = MsgType::from_u16(u16::from_le_bytes([buf[2], buf[3]]))
            .ok_or(SupervisorError::ProtocolError)?;
        let ret = u16::from_le_bytes([buf[4], buf[5]]);
        if kind != MsgType::Status {
            return Ok(Reply::Named { seq, kind, ret });
        }
        let mut records = Vec::new();
        let mut rest = &buf[6..];
        while !rest.is_empty() {
            let (rec, consumed) =
                StatusRecord::decode(rest).ok_or(SupervisorError::ProtocolError)?;
            records.push(rec);
            rest = &rest[consumed..];
        }
        Ok(Reply::Status { seq, ret, records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let req = Request {
            seq: 42,
            kind: MsgType::Start,
            pattern: "echo".to_owned(),
        };
        let decoded = Request::decode(&req.encode()).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn request_rejects_missing_nul() {
        let mut buf = vec![0u8; 4];
        buf.extend_from_slice(b"echo");
        assert_eq!(Request::decode(&buf), Err(SupervisorError::ProtocolError));
    }

    #[test]
    fn named_reply_round_trips() {
        let reply = Reply::Named {
            seq: 7,
            kind: MsgType::Stop,
            ret: 0,
        };
        let decoded = Reply::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(reply, decoded);
    }

    #[test]
    fn status_reply_round_trips() {
        let reply = Reply::Status {
            seq: 1,
            ret: 0,
            records: vec![
                StatusRecord {
                    pid: 123,
                    admin_on: true,
                    run_state: 2,
                    origin: "echo.conf".to_owned(),
                },
                StatusRecord {
                    pid: 0,
                    admin_on: false,
                    run_state: 0,
                    origin: "other.conf".to_owned(),
                },
            ],
        };
        let decoded = Reply::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(reply, decoded);
    }

    #[test]
    fn status_reply_rejects_overflow() {
        let records = (0..2000)
            .map(|i| StatusRecord {
                pid: i,
                admin_on: true,
                run_state: 1,
                origin: format!("svc-{i}.conf"),
            })
            .collect();
        let reply = Reply::Status {
            seq: 1,
            ret: 0,
            records,
        };
        assert!(matches!(
            reply.encode(),
            Err(SupervisorError::ReplyTooLarge(_))
        ));
    }
}
