//! Core identifiers and the immutable inputs of a battle.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dense integer key of a live client connection.
///
/// Unique among live connections only; an id is handed out again once its
/// connection has been torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ConnectionId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Caller-supplied key of a battle session. Opaque to the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BattleId(pub String);

impl BattleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BattleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BattleId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for BattleId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One of the two seats in a battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    A,
    B,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::A, Side::B];

    pub fn index(self) -> usize {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }

    pub fn opponent(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => f.write_str("A"),
            Side::B => f.write_str("B"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" | "0" => Ok(Side::A),
            "b" | "1" => Ok(Side::B),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// Identity and battle profile of one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattlePlayer {
    /// Connection this player plays through
    pub connection: ConnectionId,
    /// Display name
    pub name: String,
    /// Ladder rating in the challenged tier
    #[serde(default)]
    pub rating: i32,
    /// Avatar index shown to the opponent
    #[serde(default)]
    pub avatar: u16,
    /// Free-form trainer info line
    #[serde(default)]
    pub info: String,
}

impl BattlePlayer {
    pub fn new(connection: ConnectionId, name: impl Into<String>) -> Self {
        Self {
            connection,
            name: name.into(),
            rating: 1000,
            avatar: 0,
            info: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BattleMode {
    #[default]
    Singles,
    Doubles,
    Triples,
    Rotation,
}

/// Negotiated parameters of a battle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeInfo {
    pub tier: String,
    #[serde(default)]
    pub mode: BattleMode,
    #[serde(default)]
    pub clauses: Vec<String>,
    #[serde(default)]
    pub rated: bool,
}

impl ChallengeInfo {
    pub fn new(tier: impl Into<String>) -> Self {
        Self {
            tier: tier.into(),
            mode: BattleMode::default(),
            clauses: Vec::new(),
            rated: false,
        }
    }

    pub fn has_clause(&self, clause: &str) -> bool {
        self.clauses.iter().any(|c| c.eq_ignore_ascii_case(clause))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMember {
    pub species: String,
    #[serde(default)]
    pub nickname: Option<String>,
    pub level: u8,
    #[serde(default)]
    pub item: Option<String>,
    #[serde(default)]
    pub moves: Vec<String>,
}

/// One side's team for a single battle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TeamBattle {
    pub members: Vec<TeamMember>,
}

impl TeamBattle {
    /// Largest team the server accepts.
    pub const MAX_MEMBERS: usize = 6;

    pub fn new(members: Vec<TeamMember>) -> Self {
        Self { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// How a battle that ran to its end was decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "side", rename_all = "snake_case")]
pub enum BattleOutcome {
    Win(Side),
    Tie,
    /// The named side gave up.
    Forfeit(Side),
}

/// Why a battle was cut short.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AbortReason {
    /// A participant's connection went away
    Disconnected(ConnectionId),
    /// A vacated seat was not reclaimed within the grace period
    RejoinTimeout(Side),
    /// Operator or external request
    Administrative(String),
    Shutdown,
    /// The rules engine reported an error
    EngineFault(String),
    /// The rules engine stopped without reporting an outcome
    EngineStopped,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Disconnected(id) => write!(f, "connection {id} disconnected"),
            AbortReason::RejoinTimeout(side) => write!(f, "side {side} did not rejoin in time"),
            AbortReason::Administrative(why) => write!(f, "administrative: {why}"),
            AbortReason::Shutdown => f.write_str("server shutdown"),
            AbortReason::EngineFault(why) => write!(f, "engine fault: {why}"),
            AbortReason::EngineStopped => f.write_str("engine stopped without an outcome"),
        }
    }
}

/// Terminal result of a battle session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum BattleResult {
    Completed(BattleOutcome),
    Aborted(AbortReason),
}

impl BattleResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, BattleResult::Completed(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, BattleResult::Aborted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_helpers() {
        assert_eq!(Side::A.opponent(), Side::B);
        assert_eq!(Side::B.index(), 1);
        assert_eq!("b".parse::<Side>().unwrap(), Side::B);
        assert!("c".parse::<Side>().is_err());
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&ConnectionId(7)).unwrap();
        assert_eq!(json, "7");
        let json = serde_json::to_string(&BattleId::from("b1")).unwrap();
        assert_eq!(json, "\"b1\"");
    }

    #[test]
    fn challenge_clause_lookup_ignores_case() {
        let mut challenge = ChallengeInfo::new("OU");
        challenge.clauses.push("Sleep Clause".to_string());
        assert!(challenge.has_clause("sleep clause"));
        assert!(!challenge.has_clause("species clause"));
    }

    #[test]
    fn battle_result_shape() {
        let result = BattleResult::Aborted(AbortReason::Disconnected(ConnectionId(0)));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "aborted");
        assert_eq!(value["detail"]["kind"], "disconnected");
        assert!(result.is_aborted());
    }
}
