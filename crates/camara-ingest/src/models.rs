//! Normalized records, one struct per destination table

use camara_common::Entity;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use serde_json::Value;
use sqlx::types::BigDecimal;

/// Member of the Chamber with the flattened `ultimoStatus`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Deputy {
    pub id: i64,
    pub uri: Option<String>,
    pub civil_name: Option<String>,
    pub cpf: Option<String>,
    pub sex: Option<String>,
    pub website_url: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub death_date: Option<NaiveDate>,
    pub birth_state: Option<String>,
    pub birth_city: Option<String>,
    pub status_id: Option<i64>,
    pub status_name: Option<String>,
    pub status_party: Option<String>,
    pub status_party_uri: Option<String>,
    pub status_state: Option<String>,
    pub status_legislature_id: Option<i32>,
    pub status_photo_url: Option<String>,
    pub status_email: Option<String>,
    pub status_date: Option<NaiveDate>,
    pub status_electoral_name: Option<String>,
    pub status_office: Option<Value>,
    pub status_situation: Option<String>,
    pub status_electoral_condition: Option<String>,
    pub status_description: Option<String>,
}

/// Parliamentary quota expense (CEAP)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Expense {
    pub deputy_id: i64,
    pub year: i32,
    pub month: i32,
    pub document_code: i64,
    pub expense_type: Option<String>,
    pub document_type: Option<String>,
    pub document_type_code: Option<i32>,
    pub document_date: Option<NaiveDate>,
    pub document_number: Option<String>,
    pub document_value: Option<BigDecimal>,
    pub document_url: Option<String>,
    pub supplier_name: Option<String>,
    pub supplier_document: Option<String>,
    pub net_value: Option<BigDecimal>,
    pub disallowed_value: Option<BigDecimal>,
    pub reimbursement_number: Option<String>,
    pub batch_code: Option<i64>,
    pub installment: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Speech {
    pub deputy_id: i64,
    pub started_at: NaiveDateTime,
    pub ended_at: Option<NaiveDateTime>,
    pub event_phase_title: Option<String>,
    pub event_phase_started_at: Option<NaiveDateTime>,
    pub event_phase_ended_at: Option<NaiveDateTime>,
    pub speech_type: Option<String>,
    pub text_url: Option<String>,
    pub audio_url: Option<String>,
    pub video_url: Option<String>,
    pub keywords: Option<String>,
    pub summary: Option<String>,
    pub transcript: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct VotingSession {
    /// Upstream identifier such as "2391371-58"
    pub id: String,
    pub uri: Option<String>,
    pub date: Option<NaiveDate>,
    pub registered_at: Option<NaiveDateTime>,
    pub body_acronym: Option<String>,
    pub body_uri: Option<String>,
    pub event_uri: Option<String>,
    pub description: Option<String>,
    pub proposal: Option<Value>,
    pub proposal_uri: Option<String>,
    pub last_presentation_at: Option<NaiveDateTime>,
    pub last_presentation_description: Option<String>,
    pub last_presentation_proposal_uri: Option<String>,
    pub approved: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Vote {
    pub session_id: String,
    pub deputy_id: i64,
    pub registered_at: Option<NaiveDateTime>,
    pub choice: Option<String>,
}

/// Natural key of a normalized record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKey {
    Deputy(i64),
    Expense {
        deputy_id: i64,
        year: i32,
        month: i32,
        document_code: i64,
    },
    Speech {
        deputy_id: i64,
        started_at: NaiveDateTime,
    },
    VotingSession(String),
    Vote {
        session_id: String,
        deputy_id: i64,
    },
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKey::Deputy(id) => write!(f, "deputy {id}"),
            RecordKey::Expense {
                deputy_id,
                year,
                month,
                document_code,
            } => write!(f, "expense {deputy_id}/{year}-{month:02}/{document_code}"),
            RecordKey::Speech {
                deputy_id,
                started_at,
            } => write!(f, "speech {deputy_id}@{started_at}"),
            RecordKey::VotingSession(id) => write!(f, "voting session {id}"),
            RecordKey::Vote {
                session_id,
                deputy_id,
            } => write!(f, "vote {session_id}/{deputy_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Deputy(Deputy),
    Expense(Expense),
    Speech(Speech),
    VotingSession(VotingSession),
    Vote(Vote),
}

impl Record {
    /// Table the record lands in
    pub fn kind(&self) -> Entity {
        match self {
            Record::Deputy(_) => Entity::Deputies,
            Record::Expense(_) => Entity::Expenses,
            Record::Speech(_) => Entity::Speeches,
            Record::VotingSession(_) => Entity::VotingSessions,
            Record::Vote(_) => Entity::Votes,
        }
    }

    pub fn key(&self) -> RecordKey {
        match self {
            Record::Deputy(d) => RecordKey::Deputy(d.id),
            Record::Expense(e) => RecordKey::Expense {
                deputy_id: e.deputy_id,
                year: e.year,
                month: e.month,
                document_code: e.document_code,
            },
            Record::Speech(s) => RecordKey::Speech {
                deputy_id: s.deputy_id,
                started_at: s.started_at,
            },
            Record::VotingSession(v) => RecordKey::VotingSession(v.id.clone()),
            Record::Vote(v) => RecordKey::Vote {
                session_id: v.session_id.clone(),
                deputy_id: v.deputy_id,
            },
        }
    }

    /// Write order inside a batch: referenced rows first
    pub fn load_rank(&self) -> usize {
        self.kind().wave()
    }
}

/// Records bound for one transaction, attributed to the entity being ingested
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub entity: Entity,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn new(entity: Entity, records: Vec<Record>) -> Self {
        Self { entity, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in write order; relative order within a rank is preserved
    pub fn ordered(&self) -> Vec<&Record> {
        let mut ordered: Vec<&Record> = self.records.iter().collect();
        ordered.sort_by_key(|r| r.load_rank());
        ordered
    }
}
