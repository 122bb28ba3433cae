//! Common types used across camara

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{CamaraError, Result};

// ============================================================================
// Entities
// ============================================================================

/// One of the ingested domain types.
///
/// Entities are ordered by load dependency: parents (`Deputies`,
/// `VotingSessions`) come before the rows that reference them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Deputies,
    VotingSessions,
    Expenses,
    Speeches,
    Votes,
}

impl Entity {
    /// Every entity, in dependency order
    pub const ALL: [Entity; 5] = [
        Entity::Deputies,
        Entity::VotingSessions,
        Entity::Expenses,
        Entity::Speeches,
        Entity::Votes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Deputies => "deputies",
            Entity::VotingSessions => "voting_sessions",
            Entity::Expenses => "expenses",
            Entity::Speeches => "speeches",
            Entity::Votes => "votes",
        }
    }

    /// Whether the upstream endpoint accepts a date filter.
    ///
    /// The deputy list has no date parameter, so a deputies run is a single
    /// unit of work regardless of the requested range.
    pub fn is_date_filtered(&self) -> bool {
        !matches!(self, Entity::Deputies)
    }

    /// Load wave: entities in wave 0 own rows that wave 1 references.
    pub fn wave(&self) -> usize {
        match self {
            Entity::Deputies | Entity::VotingSessions => 0,
            Entity::Expenses | Entity::Speeches | Entity::Votes => 1,
        }
    }

    /// Group entities into sequential waves, preserving dependency order and
    /// dropping duplicates.
    pub fn dependency_waves(entities: &[Entity]) -> Vec<Vec<Entity>> {
        let mut sorted: Vec<Entity> = entities.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut waves: Vec<Vec<Entity>> = Vec::new();
        for entity in sorted {
            match waves.last_mut() {
                Some(wave) if wave[0].wave() == entity.wave() => wave.push(entity),
                _ => waves.push(vec![entity]),
            }
        }
        waves
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Entity {
    type Err = CamaraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "deputies" | "deputados" => Ok(Entity::Deputies),
            "voting_sessions" | "votacoes" => Ok(Entity::VotingSessions),
            "expenses" | "despesas" => Ok(Entity::Expenses),
            "speeches" | "discursos" => Ok(Entity::Speeches),
            "votes" | "votos" => Ok(Entity::Votes),
            _ => Err(CamaraError::UnknownEntity(s.to_string())),
        }
    }
}

/// Entity selector accepted on the command surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntitySelector {
    All,
    One(Entity),
}

impl EntitySelector {
    pub fn entities(&self) -> Vec<Entity> {
        match self {
            EntitySelector::All => Entity::ALL.to_vec(),
            EntitySelector::One(entity) => vec![*entity],
        }
    }
}

impl std::str::FromStr for EntitySelector {
    type Err = CamaraError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(EntitySelector::All);
        }
        s.parse().map(EntitySelector::One)
    }
}

impl std::fmt::Display for EntitySelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntitySelector::All => f.write_str("all"),
            EntitySelector::One(entity) => entity.fmt(f),
        }
    }
}

// ============================================================================
// Ingest Mode
// ============================================================================

/// Full refresh or delta since the watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    Full,
    Incremental,
}

impl std::fmt::Display for IngestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestMode::Full => write!(f, "full"),
            IngestMode::Incremental => write!(f, "incremental"),
        }
    }
}

impl std::str::FromStr for IngestMode {
    type Err = CamaraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(IngestMode::Full),
            "incremental" => Ok(IngestMode::Incremental),
            _ => Err(CamaraError::UnknownMode(s.to_string())),
        }
    }
}

// ============================================================================
// Date Ranges
// ============================================================================

/// Inclusive calendar date range (`start <= end` always holds)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    /// Create a range, rejecting `start > end`
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(CamaraError::InvalidDateRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Number of calendar days covered, counting both ends
    pub fn num_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    /// `(year, month)` pairs touched by the range, in ascending order
    pub fn months(&self) -> Vec<(i32, u32)> {
        let mut months = Vec::new();
        let (mut year, mut month) = (self.start.year(), self.start.month());
        while (year, month) <= (self.end.year(), self.end.month()) {
            months.push((year, month));
            if month == 12 {
                year += 1;
                month = 1;
            } else {
                month += 1;
            }
        }
        months
    }

    /// Split into consecutive sub-ranges of at most `max_days` days.
    ///
    /// No chunk crosses a calendar-year boundary. `max_days == 0` is treated
    /// as 1.
    pub fn chunks(&self, max_days: u32) -> Vec<DateRange> {
        let width = i64::from(max_days.max(1)).min(self.num_days());
        let mut chunks = Vec::new();
        let mut cursor = self.start;
        loop {
            let year_end = NaiveDate::from_ymd_opt(cursor.year(), 12, 31).unwrap_or(self.end);
            let end = cursor
                .checked_add_days(chrono::Days::new((width - 1).unsigned_abs()))
                .unwrap_or(self.end)
                .min(year_end)
                .min(self.end);
            chunks.push(DateRange { start: cursor, end });
            match end.succ_opt() {
                Some(next) if end < self.end => cursor = next,
                _ => break,
            }
        }
        chunks
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Parse a `YYYY-MM-DD` date
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| CamaraError::InvalidDate(s.to_string()))
}
