use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail};

use crate::packet::{Opcode, Packet};

/// The field of a request, DATA or ACK packet that a [FaultAction::CorruptField] damages
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FieldTarget {
    /// replaces a request's mode with a random, unsupported one
    Mode,
    /// replaces the NUL after a request's file name
    FirstNul,
    /// replaces the NUL after a request's mode
    LastNul,
    /// overwrites a DATA or ACK packet's block number
    Block(u16),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FaultAction {
    CorruptOpcode,
    CorruptField(FieldTarget),
    Lose,
    Delay(Duration),
    /// forward, wait, forward the same datagram again
    Duplicate(Duration),
    /// Forward from a throwaway socket so the receiver sees an unknown transfer ID. This only
    ///  makes sense once both sides are bound to each other's transfer ID: the reply to a request
    ///  (ACK 0 or DATA 1) is what binds the client, so it must come from the real relay socket.
    WrongTid,
}

/// A fault to inject into datagrams of a given type, and optionally a given block.
///
/// Rules are written as `<opcode>[:<block>]=<action>[:<arg>...][@repeat]`, e.g. `data:2=lose`,
///  `ack:3=delay:2000`, `wrq=corrupt-field:mode` or `data:4=duplicate:500@repeat`. Without
///  `@repeat`, a rule disables itself after firing once.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FaultRule {
    pub opcode: Opcode,
    pub block: Option<u16>,
    pub action: FaultAction,
    pub one_shot: bool,
    enabled: bool,
}

impl FaultRule {
    pub fn new(opcode: Opcode, block: Option<u16>, action: FaultAction, one_shot: bool) -> anyhow::Result<FaultRule> {
        let is_request = matches!(opcode, Opcode::ReadRequest | Opcode::WriteRequest);
        match opcode {
            Opcode::Error => bail!("faults for ERROR packets are configured separately"),
            Opcode::ReadRequest | Opcode::WriteRequest if block.is_some() => bail!("requests have no block number"),
            _ => {}
        }
        match action {
            FaultAction::CorruptField(FieldTarget::Block(_)) if is_request => bail!("requests have no block number to corrupt"),
            FaultAction::CorruptField(FieldTarget::Mode | FieldTarget::FirstNul | FieldTarget::LastNul) if !is_request => {
                bail!("only requests have a mode and NUL terminators")
            }
            _ => {}
        }
        if action == FaultAction::WrongTid {
            match (opcode, block) {
                (Opcode::ReadRequest | Opcode::WriteRequest, _) => bail!("requests go to the well-known port, they have no transfer ID to get wrong"),
                (Opcode::Ack | Opcode::Data, None) => bail!("wrong-tid needs a block number, it cannot apply to the first reply of a transfer"),
                (Opcode::Ack, Some(0)) | (Opcode::Data, Some(1)) => bail!("wrong-tid cannot apply to the first reply of a transfer, which binds the client's peer"),
                _ => {}
            }
        }

        Ok(FaultRule { opcode, block, action, one_shot, enabled: true })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn matches(&self, packet: &Packet) -> bool {
        self.enabled
            && packet.opcode() == self.opcode
            && self.block.map_or(true, |block| packet.block() == Some(block))
    }

    /// to be called when the rule is applied
    pub fn fire(&mut self) {
        if self.one_shot {
            self.enabled = false;
        }
    }

    /// Applies the action's change to the datagram's content. Actions that change how the
    ///  datagram is delivered rather than what it contains leave it unchanged.
    pub fn mutate(&self, buf: &mut Vec<u8>) {
        match self.action {
            FaultAction::CorruptOpcode => corrupt_opcode(buf),
            FaultAction::CorruptField(target) => corrupt_field(buf, target),
            _ => {}
        }
    }
}

/// `0x0105` is no valid opcode
const CORRUPT_OPCODE: [u8; 2] = [1, 5];
/// `0x0105` is no valid error code
const CORRUPT_ERROR_CODE: [u8; 2] = [1, 5];
const CORRUPT_TERMINATOR: u8 = 1;

fn corrupt_opcode(buf: &mut [u8]) {
    if buf.len() >= 2 {
        buf[..2].copy_from_slice(&CORRUPT_OPCODE);
    }
}

fn corrupt_field(buf: &mut Vec<u8>, target: FieldTarget) {
    match target {
        FieldTarget::Mode => {
            // the mode starts after the file name's terminator and ends before the last byte
            if let Some(nul) = buf.iter().skip(2).position(|&b| b == 0) {
                let mode_start = nul + 3;
                if mode_start < buf.len() {
                    buf.truncate(mode_start);
                    buf.extend_from_slice(format!("mode{:x}", rand::random::<u64>()).as_bytes());
                    buf.push(0);
                }
            }
        }
        FieldTarget::FirstNul => {
            if let Some(nul) = buf.iter().skip(2).position(|&b| b == 0) {
                buf[nul + 2] = CORRUPT_TERMINATOR;
            }
        }
        FieldTarget::LastNul => {
            if let Some(last) = buf.last_mut() {
                *last = CORRUPT_TERMINATOR;
            }
        }
        FieldTarget::Block(block) => {
            if buf.len() >= 4 {
                buf[2..4].copy_from_slice(&block.to_be_bytes());
            }
        }
    }
}

fn parse_opcode(s: &str) -> anyhow::Result<Opcode> {
    match s.to_ascii_lowercase().as_str() {
        "rrq" => Ok(Opcode::ReadRequest),
        "wrq" => Ok(Opcode::WriteRequest),
        "data" => Ok(Opcode::Data),
        "ack" => Ok(Opcode::Ack),
        _ => bail!("unknown packet type {:?} - expected rrq, wrq, data or ack", s),
    }
}

fn parse_millis(s: Option<&str>) -> anyhow::Result<Duration> {
    let s = s.ok_or_else(|| anyhow!("missing duration in milliseconds"))?;
    Ok(Duration::from_millis(s.parse::<u64>()?))
}

fn parse_action(s: &str) -> anyhow::Result<FaultAction> {
    let mut parts = s.split(':');
    let name = parts.next().unwrap_or_default();
    let action = match name {
        "corrupt-opcode" => FaultAction::CorruptOpcode,
        "corrupt-field" => {
            let target = match parts.next() {
                Some("mode") => FieldTarget::Mode,
                Some("first-nul") => FieldTarget::FirstNul,
                Some("last-nul") => FieldTarget::LastNul,
                Some("block") => {
                    let block = parts.next().ok_or_else(|| anyhow!("missing block number to write"))?;
                    FieldTarget::Block(block.parse::<u16>()?)
                }
                other => bail!("unknown field {:?} - expected mode, first-nul, last-nul or block:<n>", other),
            };
            FaultAction::CorruptField(target)
        }
        "lose" => FaultAction::Lose,
        "delay" => FaultAction::Delay(parse_millis(parts.next())?),
        "duplicate" => FaultAction::Duplicate(parse_millis(parts.next())?),
        "wrong-tid" => FaultAction::WrongTid,
        _ => bail!("unknown fault {:?}", name),
    };

    if let Some(extra) = parts.next() {
        bail!("unexpected argument {:?} for {}", extra, name);
    }
    Ok(action)
}

impl FromStr for FaultRule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (s, one_shot) = match s.strip_suffix("@repeat") {
            Some(s) => (s, false),
            None => (s, true),
        };

        let (trigger, action) = s.split_once('=')
            .ok_or_else(|| anyhow!("fault rule {:?} has no '=' between packet and fault", s))?;

        let (opcode, block) = match trigger.split_once(':') {
            Some((opcode, block)) => (parse_opcode(opcode)?, Some(block.parse::<u16>()?)),
            None => (parse_opcode(trigger)?, None),
        };

        FaultRule::new(opcode, block, parse_action(action)?, one_shot)
    }
}

impl Display for FaultRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.opcode)?;
        if let Some(block) = self.block {
            write!(f, ":{}", block)?;
        }
        write!(f, " -> {:?}", self.action)?;
        if !self.one_shot {
            write!(f, " (repeating)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorCorruptionTarget {
    Opcode,
    ErrorCode,
    Terminator,
}

/// Damages ERROR packets passing through the proxy, independently of [FaultRule]s. Written as
///  `opcode`, `error-code` or `terminator`, with an optional `@repeat`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorCorruption {
    pub target: ErrorCorruptionTarget,
    pub one_shot: bool,
    enabled: bool,
}

impl ErrorCorruption {
    pub fn new(target: ErrorCorruptionTarget, one_shot: bool) -> ErrorCorruption {
        ErrorCorruption { target, one_shot, enabled: true }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// corrupts the ERROR packet in `buf` if the rule is (still) enabled, returning whether it did
    pub fn apply(&mut self, buf: &mut [u8]) -> bool {
        if !self.enabled || buf.len() < 4 {
            return false;
        }
        match self.target {
            ErrorCorruptionTarget::Opcode => buf[..2].copy_from_slice(&CORRUPT_OPCODE),
            ErrorCorruptionTarget::ErrorCode => buf[2..4].copy_from_slice(&CORRUPT_ERROR_CODE),
            ErrorCorruptionTarget::Terminator => {
                if let Some(last) = buf.last_mut() {
                    *last = CORRUPT_TERMINATOR;
                }
            }
        }
        if self.one_shot {
            self.enabled = false;
        }
        true
    }
}

impl FromStr for ErrorCorruption {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (s, one_shot) = match s.strip_suffix("@repeat") {
            Some(s) => (s, false),
            None => (s, true),
        };
        let target = match s {
            "opcode" => ErrorCorruptionTarget::Opcode,
            "error-code" => ErrorCorruptionTarget::ErrorCode,
            "terminator" => ErrorCorruptionTarget::Terminator,
            _ => bail!("unknown error corruption {:?} - expected opcode, error-code or terminator", s),
        };
        Ok(ErrorCorruption::new(target, one_shot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ErrorCode, PacketFormatError};
    use bytes::Bytes;
    use rstest::rstest;

    #[rstest]
    #[case::lose("data:2=lose", Opcode::Data, Some(2), FaultAction::Lose, true)]
    #[case::delay("ack:3=delay:2000", Opcode::Ack, Some(3), FaultAction::Delay(Duration::from_millis(2000)), true)]
    #[case::mode("wrq=corrupt-field:mode", Opcode::WriteRequest, None, FaultAction::CorruptField(FieldTarget::Mode), true)]
    #[case::first_nul("rrq=corrupt-field:first-nul", Opcode::ReadRequest, None, FaultAction::CorruptField(FieldTarget::FirstNul), true)]
    #[case::block("data:1=corrupt-field:block:7", Opcode::Data, Some(1), FaultAction::CorruptField(FieldTarget::Block(7)), true)]
    #[case::wrong_tid("ack:1=wrong-tid", Opcode::Ack, Some(1), FaultAction::WrongTid, true)]
    #[case::duplicate_repeat("data:4=duplicate:500@repeat", Opcode::Data, Some(4), FaultAction::Duplicate(Duration::from_millis(500)), false)]
    #[case::any_block("DATA=corrupt-opcode", Opcode::Data, None, FaultAction::CorruptOpcode, true)]
    fn test_parse(#[case] s: &str, #[case] opcode: Opcode, #[case] block: Option<u16>, #[case] action: FaultAction, #[case] one_shot: bool) {
        let rule = s.parse::<FaultRule>().unwrap();
        assert_eq!(rule, FaultRule::new(opcode, block, action, one_shot).unwrap());
        assert!(rule.is_enabled());
    }

    #[rstest]
    #[case::no_equals("data:2")]
    #[case::unknown_opcode("foo=lose")]
    #[case::error_opcode("error=lose")]
    #[case::bad_block("data:x=lose")]
    #[case::unknown_action("data:1=explode")]
    #[case::missing_delay("ack:1=delay")]
    #[case::bad_delay("ack:1=delay:soon")]
    #[case::extra_arg("data:1=lose:5")]
    #[case::request_block("wrq:1=lose")]
    #[case::mode_on_data("data=corrupt-field:mode")]
    #[case::block_on_request("rrq=corrupt-field:block:3")]
    #[case::unknown_field("wrq=corrupt-field:opcode")]
    #[case::wrong_tid_on_ack_0("ack:0=wrong-tid")]
    #[case::wrong_tid_on_data_1("data:1=wrong-tid")]
    #[case::wrong_tid_on_any_ack("ack=wrong-tid")]
    #[case::wrong_tid_on_any_data("data=wrong-tid@repeat")]
    #[case::wrong_tid_on_request("wrq=wrong-tid")]
    fn test_parse_rejects(#[case] s: &str) {
        assert!(s.parse::<FaultRule>().is_err());
    }

    #[test]
    fn test_matches_and_one_shot() {
        let mut rule = "data:2=lose".parse::<FaultRule>().unwrap();
        let data = |block| Packet::Data { block, payload: Bytes::from_static(b"x") };

        assert!(!rule.matches(&data(1)));
        assert!(!rule.matches(&Packet::ack(2)));
        assert!(rule.matches(&data(2)));

        rule.fire();
        assert!(!rule.matches(&data(2)));
    }

    #[test]
    fn test_repeating_rule_stays_enabled() {
        let mut rule = "ack=delay:10@repeat".parse::<FaultRule>().unwrap();
        rule.fire();
        rule.fire();
        assert!(rule.matches(&Packet::ack(17)));
    }

    fn wrq_bytes() -> Vec<u8> {
        Packet::WriteRequest { filename: "a.txt".to_string(), mode: "octet".to_string() }.encode().unwrap().to_vec()
    }

    #[rstest]
    #[case::opcode("wrq=corrupt-opcode", PacketFormatError::UnknownOpcode(0x0105))]
    #[case::first_nul("wrq=corrupt-field:first-nul", PacketFormatError::MalformedRequest("expected exactly two fields"))]
    #[case::last_nul("wrq=corrupt-field:last-nul", PacketFormatError::MalformedRequest("missing terminator"))]
    fn test_mutate_request(#[case] rule: &str, #[case] expected: PacketFormatError) {
        let rule = rule.parse::<FaultRule>().unwrap();
        let mut buf = wrq_bytes();
        rule.mutate(&mut buf);
        assert_eq!(Packet::decode(&buf), Err(expected));
    }

    #[test]
    fn test_mutate_mode() {
        let rule = "wrq=corrupt-field:mode".parse::<FaultRule>().unwrap();
        let mut buf = wrq_bytes();
        rule.mutate(&mut buf);

        match Packet::decode(&buf).unwrap() {
            Packet::WriteRequest { filename, mode } => {
                assert_eq!(filename, "a.txt");
                assert!(mode.starts_with("mode"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_mutate_block() {
        let rule = "ack:1=corrupt-field:block:7".parse::<FaultRule>().unwrap();
        let mut buf = Packet::ack(1).encode().unwrap().to_vec();
        rule.mutate(&mut buf);
        assert_eq!(Packet::decode(&buf), Ok(Packet::ack(7)));
    }

    #[test]
    fn test_delivery_faults_do_not_mutate() {
        let original = Packet::ack(1).encode().unwrap().to_vec();
        for rule in ["ack=lose", "ack=delay:1", "ack=duplicate:1", "ack:1=wrong-tid"] {
            let mut buf = original.clone();
            rule.parse::<FaultRule>().unwrap().mutate(&mut buf);
            assert_eq!(buf, original);
        }
    }

    #[rstest]
    #[case::opcode("opcode", PacketFormatError::UnknownOpcode(0x0105))]
    #[case::error_code("error-code", PacketFormatError::ErrorCodeOutOfRange(0x0105))]
    #[case::terminator("terminator", PacketFormatError::MalformedError("missing terminator"))]
    fn test_error_corruption(#[case] s: &str, #[case] expected: PacketFormatError) {
        let mut corruption = s.parse::<ErrorCorruption>().unwrap();
        let original = Packet::error(ErrorCode::FileAlreadyExists, "exists").encode().unwrap().to_vec();

        let mut buf = original.clone();
        assert!(corruption.apply(&mut buf));
        assert_eq!(Packet::decode(&buf), Err(expected));

        // one-shot
        let mut buf = original.clone();
        assert!(!corruption.apply(&mut buf));
        assert_eq!(buf, original);
    }

    #[test]
    fn test_error_corruption_repeat() {
        let mut corruption = "error-code@repeat".parse::<ErrorCorruption>().unwrap();
        assert!(!corruption.one_shot);
        let mut buf = Packet::error(ErrorCode::DiskFull, "").encode().unwrap().to_vec();
        assert!(corruption.apply(&mut buf));
        assert!(corruption.apply(&mut buf));
        assert!(corruption.is_enabled());
        assert!("bogus".parse::<ErrorCorruption>().is_err());
    }
}
