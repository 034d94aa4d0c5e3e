//! Reward code generation.
//!
//! A reward is a directional code (`U`, `D`, `L`, `R`) of fixed length plus a
//! short checksum tag such as `Kilo-80`. The tag is derived purely from the
//! code: the weighted positional sum of symbol values modulo 26 picks a NATO
//! word, and a rolling base-3 hash modulo 100 supplies the number.
//!
//! History is kept most-recent-first and bounded; no two live entries share a
//! checksum.

use std::collections::VecDeque;

use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Symbols per generated code.
pub const CODE_LENGTH: usize = 8;

/// Rewards kept in history.
pub const HISTORY_LIMIT: usize = 10;

/// Resample attempts before giving up on a collision-free checksum.
pub const MAX_ATTEMPTS: usize = 256;

const PHONETIC: [&str; 26] = [
    "Alpha", "Bravo", "Charlie", "Delta", "Echo", "Foxtrot", "Golf", "Hotel", "India", "Juliett",
    "Kilo", "Lima", "Mike", "November", "Oscar", "Papa", "Quebec", "Romeo", "Sierra", "Tango",
    "Uniform", "Victor", "Whiskey", "X-ray", "Yankee", "Zulu",
];

/// Errors from reward generation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RewardError {
    /// Every attempt collided with a checksum already in history.
    #[error("no collision-free reward code after {attempts} attempts")]
    Exhausted {
        /// Attempts made.
        attempts: usize,
    },
}

/// One symbol of a directional code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// `U`
    Up,
    /// `D`
    Down,
    /// `L`
    Left,
    /// `R`
    Right,
}

impl Direction {
    const ALL: [Self; 4] = [Self::Up, Self::Down, Self::Left, Self::Right];

    /// Numeric value used by the checksum (1 to 4).
    #[must_use]
    pub const fn value(self) -> u32 {
        match self {
            Self::Up => 1,
            Self::Down => 2,
            Self::Left => 3,
            Self::Right => 4,
        }
    }

    /// Single-letter rendering.
    #[must_use]
    pub const fn symbol(self) -> char {
        match self {
            Self::Up => 'U',
            Self::Down => 'D',
            Self::Left => 'L',
            Self::Right => 'R',
        }
    }

    /// Parse a single letter, case-insensitive.
    #[must_use]
    pub const fn from_symbol(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'U' => Some(Self::Up),
            'D' => Some(Self::Down),
            'L' => Some(Self::Left),
            'R' => Some(Self::Right),
            _ => None,
        }
    }
}

/// Compute the checksum tag of a code.
#[must_use]
pub fn checksum(code: &[Direction]) -> String {
    let mut weighted: u64 = 0;
    let mut rolling: u32 = 0;
    for (i, symbol) in code.iter().enumerate() {
        weighted += (i as u64 + 1) * u64::from(symbol.value());
        rolling = (rolling * 3 + symbol.value()) % 100;
    }
    #[allow(clippy::cast_possible_truncation)]
    let word = PHONETIC[(weighted % 26) as usize];
    format!("{word}-{rolling:02}")
}

/// A generated reward code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Reward {
    /// Directional code, e.g. `UDLRRLDU`.
    #[schema(example = "UUUUUUUU")]
    pub code: String,
    /// Checksum tag derived from the code.
    #[schema(example = "Kilo-80")]
    pub checksum: String,
}

impl Reward {
    /// Build a reward from its symbols.
    #[must_use]
    pub fn from_symbols(symbols: &[Direction]) -> Self {
        Self {
            code: symbols.iter().map(|d| d.symbol()).collect(),
            checksum: checksum(symbols),
        }
    }

    /// Parse a textual code and derive its checksum.
    #[must_use]
    pub fn parse(code: &str) -> Option<Self> {
        let symbols: Option<Vec<Direction>> = code.chars().map(Direction::from_symbol).collect();
        symbols.map(|s| Self::from_symbols(&s))
    }
}

/// Bounded, most-recent-first reward history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Reward>", into = "Vec<Reward>")]
pub struct RewardHistory {
    entries: VecDeque<Reward>,
    limit: usize,
}

impl Default for RewardHistory {
    fn default() -> Self {
        Self::with_limit(HISTORY_LIMIT)
    }
}

impl From<Vec<Reward>> for RewardHistory {
    fn from(entries: Vec<Reward>) -> Self {
        let mut history = Self::default();
        // Oldest first so the front ends up most recent; duplicates are dropped.
        for reward in entries.into_iter().rev() {
            if !history.contains_checksum(&reward.checksum) {
                history.push(reward);
            }
        }
        history
    }
}

impl From<RewardHistory> for Vec<Reward> {
    fn from(history: RewardHistory) -> Self {
        history.entries.into_iter().collect()
    }
}

impl RewardHistory {
    /// Empty history holding at most `limit` entries.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit),
            limit: limit.max(1),
        }
    }

    /// Most recent reward.
    #[must_use]
    pub fn latest(&self) -> Option<&Reward> {
        self.entries.front()
    }

    /// Iterate most-recent-first.
    pub fn iter(&self) -> impl Iterator<Item = &Reward> {
        self.entries.iter()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `tag` is already used by a live entry.
    #[must_use]
    pub fn contains_checksum(&self, tag: &str) -> bool {
        self.entries.iter().any(|r| r.checksum == tag)
    }

    fn push(&mut self, reward: Reward) {
        self.entries.push_front(reward);
        self.entries.truncate(self.limit);
    }
}

/// Draws reward codes from a random source.
pub struct RewardGenerator<R> {
    rng: R,
    length: usize,
}

impl<R: RngCore> RewardGenerator<R> {
    /// Generator producing codes of [`CODE_LENGTH`].
    pub const fn new(rng: R) -> Self {
        Self {
            rng,
            length: CODE_LENGTH,
        }
    }

    fn draw(&mut self) -> Vec<Direction> {
        (0..self.length)
            // 4 divides 2^32, so the modulo keeps the draw uniform.
            .map(|_| Direction::ALL[(self.rng.next_u32() % 4) as usize])
            .collect()
    }

    /// Generate a reward whose checksum is not in `history`, and push it to
    /// the front of `history`.
    ///
    /// # Errors
    ///
    /// Returns [`RewardError::Exhausted`] after [`MAX_ATTEMPTS`] collisions;
    /// `history` is left untouched in that case.
    pub fn generate_into(&mut self, history: &mut RewardHistory) -> Result<Reward, RewardError> {
        for _ in 0..MAX_ATTEMPTS {
            let reward = Reward::from_symbols(&self.draw());
            if !history.contains_checksum(&reward.checksum) {
                history.push(reward.clone());
                return Ok(reward);
            }
        }
        Err(RewardError::Exhausted {
            attempts: MAX_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays a fixed sequence of words, cycling.
    struct ScriptedRng {
        words: Vec<u32>,
        next: usize,
    }

    impl ScriptedRng {
        fn new(words: Vec<u32>) -> Self {
            Self { words, next: 0 }
        }
    }

    impl RngCore for ScriptedRng {
        fn next_u32(&mut self) -> u32 {
            let word = self.words[self.next % self.words.len()];
            self.next += 1;
            word
        }

        fn next_u64(&mut self) -> u64 {
            u64::from(self.next_u32())
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for byte in dest {
                *byte = self.next_u32() as u8;
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    #[test]
    fn test_checksum_known_values() {
        assert_eq!(Reward::parse("UUUUUUUU").unwrap().checksum, "Kilo-80");
        assert_eq!(Reward::parse("RRRRRRRR").unwrap().checksum, "Oscar-20");
    }

    #[test]
    fn test_checksum_is_deterministic_and_case_insensitive() {
        let a = Reward::parse("UDLRRLDU").unwrap();
        let b = Reward::parse("udlrrldu").unwrap();
        assert_eq!(a.checksum, b.checksum);
        assert_eq!(a.code, "UDLRRLDU");
    }

    #[test]
    fn test_parse_rejects_unknown_symbols() {
        assert!(Reward::parse("UDX").is_none());
    }

    #[test]
    fn test_history_is_bounded_and_most_recent_first() {
        let mut history = RewardHistory::with_limit(3);
        for code in ["UUUUUUUU", "RRRRRRRR", "UDUDUDUD", "LLLLLLLL"] {
            history.push(Reward::parse(code).unwrap());
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.latest().unwrap().code, "LLLLLLLL");
        assert!(!history.iter().any(|r| r.code == "UUUUUUUU"));
    }

    #[test]
    fn test_generation_skips_colliding_checksum() {
        let mut history = RewardHistory::default();
        history.push(Reward::parse("UUUUUUUU").unwrap());

        // First draw is eight zeros (all Up, collides), then eight threes (all Right).
        let mut words = vec![0; CODE_LENGTH];
        words.extend(vec![3; CODE_LENGTH]);
        let mut generator = RewardGenerator::new(ScriptedRng::new(words));

        let reward = generator.generate_into(&mut history).unwrap();
        assert_eq!(reward.code, "RRRRRRRR");
        assert_eq!(history.latest(), Some(&reward));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_generation_exhausts_without_touching_history() {
        let mut history = RewardHistory::default();
        history.push(Reward::parse("UUUUUUUU").unwrap());
        let mut generator = RewardGenerator::new(ScriptedRng::new(vec![0]));

        let err = generator.generate_into(&mut history).unwrap_err();
        assert_eq!(
            err,
            RewardError::Exhausted {
                attempts: MAX_ATTEMPTS
            }
        );
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_generated_history_has_unique_checksums() {
        let mut history = RewardHistory::default();
        let mut generator = RewardGenerator::new(rand_core::OsRng);
        for _ in 0..50 {
            generator.generate_into(&mut history).unwrap();
        }
        let mut tags: Vec<&str> = history.iter().map(|r| r.checksum.as_str()).collect();
        let before = tags.len();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), before);
        assert_eq!(before, HISTORY_LIMIT);
    }

    #[test]
    fn test_history_serde_drops_duplicate_checksums() {
        let json = r#"[
            {"code": "UUUUUUUU", "checksum": "Kilo-80"},
            {"code": "UUUUUUUU", "checksum": "Kilo-80"},
            {"code": "RRRRRRRR", "checksum": "Oscar-20"}
        ]"#;
        let history: RewardHistory = serde_json::from_str(json).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.latest().unwrap().checksum, "Kilo-80");
    }
}
