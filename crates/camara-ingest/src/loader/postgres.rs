//! PostgreSQL loader
//!
//! One transaction per batch and one savepoint per row. SQLSTATE classes 22
//! (data exception) and 23 (integrity constraint violation) roll back to the
//! savepoint and skip the row. Any other database error aborts the batch:
//! class 42 (syntax error or access rule violation) is reported as a schema
//! mismatch, the rest as database failures.

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, warn};

use super::{LoadReport, Loader, SkippedRow};
use crate::{
    error::{IngestError, Result},
    models::{Batch, Deputy, Expense, Record, Speech, Vote, VotingSession},
};

pub struct PgLoader {
    pool: PgPool,
}

impl PgLoader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

enum RowError {
    Skip(String),
    Fatal(IngestError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SqlStateClass {
    /// The row's values are bad
    Row,
    /// The statement does not match the schema
    Schema,
    /// Connection, transaction or server trouble
    Database,
}

fn sqlstate_class(code: &str) -> SqlStateClass {
    match code.get(..2) {
        Some("22" | "23") => SqlStateClass::Row,
        Some("42") => SqlStateClass::Schema,
        _ => SqlStateClass::Database,
    }
}

fn classify(err: sqlx::Error) -> RowError {
    let Some((code, message)) = err.as_database_error().map(|db| {
        (
            db.code().map(|c| c.into_owned()).unwrap_or_default(),
            db.message().to_string(),
        )
    }) else {
        return RowError::Fatal(IngestError::Database(err));
    };
    match sqlstate_class(&code) {
        SqlStateClass::Row => RowError::Skip(format!("{code}: {message}")),
        SqlStateClass::Schema => {
            RowError::Fatal(IngestError::Structural(format!("{code}: {message}")))
        },
        SqlStateClass::Database => RowError::Fatal(IngestError::Database(err)),
    }
}

#[async_trait]
impl Loader for PgLoader {
    async fn upsert_batch(&self, batch: &Batch) -> Result<LoadReport> {
        let mut tx = self.pool.begin().await?;
        let mut report = LoadReport::default();

        for record in batch.ordered() {
            sqlx::query("SAVEPOINT camara_row").execute(&mut *tx).await?;

            match upsert_record(&mut *tx, record).await {
                Ok(()) => {
                    sqlx::query("RELEASE SAVEPOINT camara_row")
                        .execute(&mut *tx)
                        .await?;
                    report.upserted += 1;
                },
                Err(err) => match classify(err) {
                    RowError::Skip(reason) => {
                        sqlx::query("ROLLBACK TO SAVEPOINT camara_row")
                            .execute(&mut *tx)
                            .await?;
                        warn!(entity = %batch.entity, key = %record.key(), %reason, "Skipping row");
                        report.skipped.push(SkippedRow {
                            key: record.key(),
                            reason,
                        });
                    },
                    // dropping `tx` rolls the whole batch back
                    RowError::Fatal(err) => return Err(err),
                },
            }
        }

        tx.commit().await?;
        debug!(
            entity = %batch.entity,
            upserted = report.upserted,
            skipped = report.skipped.len(),
            "Batch committed"
        );
        Ok(report)
    }

    async fn deputy_ids(&self) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM deputies ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

async fn upsert_record(conn: &mut PgConnection, record: &Record) -> sqlx::Result<()> {
    match record {
        Record::Deputy(d) => upsert_deputy(conn, d).await,
        Record::Expense(e) => upsert_expense(conn, e).await,
        Record::Speech(s) => upsert_speech(conn, s).await,
        Record::VotingSession(v) => upsert_voting_session(conn, v).await,
        Record::Vote(v) => upsert_vote(conn, v).await,
    }
}

async fn upsert_deputy(conn: &mut PgConnection, d: &Deputy) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO deputies (
            id, uri, civil_name, cpf, sex, website_url, birth_date, death_date,
            birth_state, birth_city, status_id, status_name, status_party,
            status_party_uri, status_state, status_legislature_id, status_photo_url,
            status_email, status_date, status_electoral_name, status_office,
            status_situation, status_electoral_condition, status_description
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19, $20, $21, $22, $23, $24)
        ON CONFLICT (id) DO UPDATE SET
            uri = EXCLUDED.uri,
            civil_name = EXCLUDED.civil_name,
            cpf = EXCLUDED.cpf,
            sex = EXCLUDED.sex,
            website_url = EXCLUDED.website_url,
            birth_date = EXCLUDED.birth_date,
            death_date = EXCLUDED.death_date,
            birth_state = EXCLUDED.birth_state,
            birth_city = EXCLUDED.birth_city,
            status_id = EXCLUDED.status_id,
            status_name = EXCLUDED.status_name,
            status_party = EXCLUDED.status_party,
            status_party_uri = EXCLUDED.status_party_uri,
            status_state = EXCLUDED.status_state,
            status_legislature_id = EXCLUDED.status_legislature_id,
            status_photo_url = EXCLUDED.status_photo_url,
            status_email = EXCLUDED.status_email,
            status_date = EXCLUDED.status_date,
            status_electoral_name = EXCLUDED.status_electoral_name,
            status_office = EXCLUDED.status_office,
            status_situation = EXCLUDED.status_situation,
            status_electoral_condition = EXCLUDED.status_electoral_condition,
            status_description = EXCLUDED.status_description,
            ingested_at = now()
        "#,
    )
    .bind(d.id)
    .bind(&d.uri)
    .bind(&d.civil_name)
    .bind(&d.cpf)
    .bind(&d.sex)
    .bind(&d.website_url)
    .bind(d.birth_date)
    .bind(d.death_date)
    .bind(&d.birth_state)
    .bind(&d.birth_city)
    .bind(d.status_id)
    .bind(&d.status_name)
    .bind(&d.status_party)
    .bind(&d.status_party_uri)
    .bind(&d.status_state)
    .bind(d.status_legislature_id)
    .bind(&d.status_photo_url)
    .bind(&d.status_email)
    .bind(d.status_date)
    .bind(&d.status_electoral_name)
    .bind(&d.status_office)
    .bind(&d.status_situation)
    .bind(&d.status_electoral_condition)
    .bind(&d.status_description)
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_expense(conn: &mut PgConnection, e: &Expense) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO expenses (
            deputy_id, year, month, document_code, expense_type, document_type,
            document_type_code, document_date, document_number, document_value,
            document_url, supplier_name, supplier_document, net_value,
            disallowed_value, reimbursement_number, batch_code, installment
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18)
        ON CONFLICT ON CONSTRAINT expenses_natural_key DO UPDATE SET
            expense_type = EXCLUDED.expense_type,
            document_type = EXCLUDED.document_type,
            document_type_code = EXCLUDED.document_type_code,
            document_date = EXCLUDED.document_date,
            document_number = EXCLUDED.document_number,
            document_value = EXCLUDED.document_value,
            document_url = EXCLUDED.document_url,
            supplier_name = EXCLUDED.supplier_name,
            supplier_document = EXCLUDED.supplier_document,
            net_value = EXCLUDED.net_value,
            disallowed_value = EXCLUDED.disallowed_value,
            reimbursement_number = EXCLUDED.reimbursement_number,
            batch_code = EXCLUDED.batch_code,
            installment = EXCLUDED.installment,
            ingested_at = now()
        "#,
    )
    .bind(e.deputy_id)
    .bind(e.year)
    .bind(e.month)
    .bind(e.document_code)
    .bind(&e.expense_type)
    .bind(&e.document_type)
    .bind(e.document_type_code)
    .bind(e.document_date)
    .bind(&e.document_number)
    .bind(&e.document_value)
    .bind(&e.document_url)
    .bind(&e.supplier_name)
    .bind(&e.supplier_document)
    .bind(&e.net_value)
    .bind(&e.disallowed_value)
    .bind(&e.reimbursement_number)
    .bind(e.batch_code)
    .bind(e.installment)
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_speech(conn: &mut PgConnection, s: &Speech) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO speeches (
            deputy_id, started_at, ended_at, event_phase_title, event_phase_started_at,
            event_phase_ended_at, speech_type, text_url, audio_url, video_url,
            keywords, summary, transcript
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT ON CONSTRAINT speeches_natural_key DO UPDATE SET
            ended_at = EXCLUDED.ended_at,
            event_phase_title = EXCLUDED.event_phase_title,
            event_phase_started_at = EXCLUDED.event_phase_started_at,
            event_phase_ended_at = EXCLUDED.event_phase_ended_at,
            speech_type = EXCLUDED.speech_type,
            text_url = EXCLUDED.text_url,
            audio_url = EXCLUDED.audio_url,
            video_url = EXCLUDED.video_url,
            keywords = EXCLUDED.keywords,
            summary = EXCLUDED.summary,
            transcript = EXCLUDED.transcript,
            ingested_at = now()
        "#,
    )
    .bind(s.deputy_id)
    .bind(s.started_at)
    .bind(s.ended_at)
    .bind(&s.event_phase_title)
    .bind(s.event_phase_started_at)
    .bind(s.event_phase_ended_at)
    .bind(&s.speech_type)
    .bind(&s.text_url)
    .bind(&s.audio_url)
    .bind(&s.video_url)
    .bind(&s.keywords)
    .bind(&s.summary)
    .bind(&s.transcript)
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_voting_session(conn: &mut PgConnection, v: &VotingSession) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO voting_sessions (
            id, uri, date, registered_at, body_acronym, body_uri, event_uri,
            description, proposal, proposal_uri, last_presentation_at,
            last_presentation_description, last_presentation_proposal_uri, approved
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (id) DO UPDATE SET
            uri = EXCLUDED.uri,
            date = EXCLUDED.date,
            registered_at = EXCLUDED.registered_at,
            body_acronym = EXCLUDED.body_acronym,
            body_uri = EXCLUDED.body_uri,
            event_uri = EXCLUDED.event_uri,
            description = EXCLUDED.description,
            proposal = EXCLUDED.proposal,
            proposal_uri = EXCLUDED.proposal_uri,
            last_presentation_at = EXCLUDED.last_presentation_at,
            last_presentation_description = EXCLUDED.last_presentation_description,
            last_presentation_proposal_uri = EXCLUDED.last_presentation_proposal_uri,
            approved = EXCLUDED.approved,
            ingested_at = now()
        "#,
    )
    .bind(&v.id)
    .bind(&v.uri)
    .bind(v.date)
    .bind(v.registered_at)
    .bind(&v.body_acronym)
    .bind(&v.body_uri)
    .bind(&v.event_uri)
    .bind(&v.description)
    .bind(&v.proposal)
    .bind(&v.proposal_uri)
    .bind(v.last_presentation_at)
    .bind(&v.last_presentation_description)
    .bind(&v.last_presentation_proposal_uri)
    .bind(v.approved)
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_vote(conn: &mut PgConnection, v: &Vote) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO votes (session_id, deputy_id, registered_at, choice)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT ON CONSTRAINT votes_natural_key DO UPDATE SET
            registered_at = EXCLUDED.registered_at,
            choice = EXCLUDED.choice,
            ingested_at = now()
        "#,
    )
    .bind(&v.session_id)
    .bind(v.deputy_id)
    .bind(v.registered_at)
    .bind(&v.choice)
    .execute(conn)
    .await?;
    Ok(())
}
