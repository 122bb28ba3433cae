//! Raw API records to normalized rows
//!
//! Every function here is pure and never fails. Each raw field is declared
//! as [`Field<T>`]: a value of the wrong shape is kept aside, turned into
//! `None` and reported as a [`TransformWarning`]. A record without its key
//! yields no rows at all.

use camara_common::Entity;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use sqlx::types::BigDecimal;
use std::str::FromStr;

use crate::models::{Deputy, Expense, Record, Speech, Vote, VotingSession};

const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"];

/// Data-quality note produced while flattening one raw record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformWarning {
    pub entity: Entity,
    pub field: &'static str,
    pub detail: String,
}

impl std::fmt::Display for TransformWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}: {}", self.entity, self.field, self.detail)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transformed {
    pub records: Vec<Record>,
    pub warnings: Vec<TransformWarning>,
}

impl Transformed {
    pub fn extend(&mut self, other: Transformed) {
        self.records.extend(other.records);
        self.warnings.extend(other.warnings);
    }
}

/// A raw field that either matched its expected type or did not
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Field<T> {
    Valid(T),
    Invalid(Value),
}

// ============================================================================
// Raw shapes
// ============================================================================

/// Both `/deputados` list items and `/deputados/{id}` details
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawDeputy {
    id: Option<Field<i64>>,
    uri: Option<Field<String>>,
    nome_civil: Option<Field<String>>,
    cpf: Option<Field<String>>,
    sexo: Option<Field<String>>,
    url_website: Option<Field<String>>,
    data_nascimento: Option<Field<String>>,
    data_falecimento: Option<Field<String>>,
    uf_nascimento: Option<Field<String>>,
    municipio_nascimento: Option<Field<String>>,
    ultimo_status: Option<Field<RawDeputyStatus>>,
    // list items carry the status inline
    nome: Option<Field<String>>,
    sigla_partido: Option<Field<String>>,
    uri_partido: Option<Field<String>>,
    sigla_uf: Option<Field<String>>,
    id_legislatura: Option<Field<i32>>,
    url_foto: Option<Field<String>>,
    email: Option<Field<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawDeputyStatus {
    id: Option<Field<i64>>,
    nome: Option<Field<String>>,
    sigla_partido: Option<Field<String>>,
    uri_partido: Option<Field<String>>,
    sigla_uf: Option<Field<String>>,
    id_legislatura: Option<Field<i32>>,
    url_foto: Option<Field<String>>,
    email: Option<Field<String>>,
    data: Option<Field<String>>,
    nome_eleitoral: Option<Field<String>>,
    gabinete: Option<Value>,
    situacao: Option<Field<String>>,
    condicao_eleitoral: Option<Field<String>>,
    descricao_status: Option<Field<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawExpense {
    ano: Option<Field<i32>>,
    mes: Option<Field<i32>>,
    tipo_despesa: Option<Field<String>>,
    cod_documento: Option<Field<i64>>,
    tipo_documento: Option<Field<String>>,
    cod_tipo_documento: Option<Field<i32>>,
    data_documento: Option<Field<String>>,
    num_documento: Option<Field<String>>,
    valor_documento: Option<Value>,
    url_documento: Option<Field<String>>,
    nome_fornecedor: Option<Field<String>>,
    cnpj_cpf_fornecedor: Option<Field<String>>,
    valor_liquido: Option<Value>,
    valor_glosa: Option<Value>,
    num_ressarcimento: Option<Field<String>>,
    cod_lote: Option<Field<i64>>,
    parcela: Option<Field<i32>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawSpeech {
    data_hora_inicio: Option<Field<String>>,
    data_hora_fim: Option<Field<String>>,
    fase_evento: Option<Field<RawEventPhase>>,
    tipo_discurso: Option<Field<String>>,
    url_texto: Option<Field<String>>,
    url_audio: Option<Field<String>>,
    url_video: Option<Field<String>>,
    keywords: Option<Field<String>>,
    sumario: Option<Field<String>>,
    transcricao: Option<Field<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawEventPhase {
    titulo: Option<Field<String>>,
    data_hora_inicio: Option<Field<String>>,
    data_hora_fim: Option<Field<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawVotingSession {
    id: Option<Field<String>>,
    uri: Option<Field<String>>,
    data: Option<Field<String>>,
    data_hora_registro: Option<Field<String>>,
    sigla_orgao: Option<Field<String>>,
    uri_orgao: Option<Field<String>>,
    uri_evento: Option<Field<String>>,
    descricao: Option<Field<String>>,
    proposicao_objeto: Option<Value>,
    uri_proposicao_objeto: Option<Field<String>>,
    ultima_apresentacao_proposicao: Option<Field<RawLastPresentation>>,
    aprovacao: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawLastPresentation {
    data_hora_registro: Option<Field<String>>,
    descricao: Option<Field<String>>,
    uri_proposicao: Option<Field<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawVote {
    tipo_voto: Option<Field<String>>,
    data_registro_voto: Option<Field<String>>,
    #[serde(rename = "deputado_", alias = "deputado")]
    deputado: Option<Field<RawVoteDeputy>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawVoteDeputy {
    id: Option<Field<i64>>,
}

// ============================================================================
// Field coercion
// ============================================================================

/// Collects warnings for one raw record
struct Coercer {
    entity: Entity,
    warnings: Vec<TransformWarning>,
}

impl Coercer {
    fn new(entity: Entity) -> Self {
        Self {
            entity,
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, field: &'static str, detail: impl Into<String>) {
        self.warnings.push(TransformWarning {
            entity: self.entity,
            field,
            detail: detail.into(),
        });
    }

    fn take<T>(&mut self, field: &'static str, raw: Option<Field<T>>) -> Option<T> {
        match raw? {
            Field::Valid(value) => Some(value),
            Field::Invalid(value) => {
                self.warn(field, format!("unexpected value {value}"));
                None
            },
        }
    }

    /// Present, non-blank string
    fn text(&mut self, field: &'static str, raw: Option<Field<String>>) -> Option<String> {
        self.take(field, raw).filter(|s| !s.trim().is_empty())
    }

    fn date(&mut self, field: &'static str, raw: Option<Field<String>>) -> Option<NaiveDate> {
        let text = self.text(field, raw)?;
        let prefix = text.get(..10).unwrap_or(&text);
        match NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            Ok(date) => Some(date),
            Err(_) => {
                self.warn(field, format!("unparsable date '{text}'"));
                None
            },
        }
    }

    fn timestamp(
        &mut self,
        field: &'static str,
        raw: Option<Field<String>>,
    ) -> Option<NaiveDateTime> {
        let text = self.text(field, raw)?;
        let parsed = TIMESTAMP_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(&text, format).ok())
            .or_else(|| {
                NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            });
        if parsed.is_none() {
            self.warn(field, format!("unparsable timestamp '{text}'"));
        }
        parsed
    }

    /// Exact decimal from a JSON number or numeric string
    fn decimal(&mut self, field: &'static str, raw: Option<Value>) -> Option<BigDecimal> {
        let text = match raw? {
            Value::Null => return None,
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.trim().replace(',', "."),
            other => {
                self.warn(field, format!("unexpected value {other}"));
                return None;
            },
        };
        match BigDecimal::from_str(&text) {
            Ok(value) => Some(value),
            Err(_) => {
                self.warn(field, format!("not a decimal '{text}'"));
                None
            },
        }
    }

    /// `true`/`false`, `1`/`0`
    fn flag(&mut self, field: &'static str, raw: Option<Value>) -> Option<bool> {
        match raw? {
            Value::Null => None,
            Value::Bool(b) => Some(b),
            Value::Number(n) if n.as_i64() == Some(1) => Some(true),
            Value::Number(n) if n.as_i64() == Some(0) => Some(false),
            other => {
                self.warn(field, format!("not a 0/1 flag: {other}"));
                None
            },
        }
    }

    /// Nested object; an object of the wrong shape degrades to all-`None`
    fn nested<T: Default>(&mut self, field: &'static str, raw: Option<Field<T>>) -> T {
        self.take(field, raw).unwrap_or_default()
    }

    fn finish(self, record: Option<Record>) -> Transformed {
        Transformed {
            records: record.into_iter().collect(),
            warnings: self.warnings,
        }
    }
}

fn parse_raw<T: DeserializeOwned + Default>(coercer: &mut Coercer, raw: &Value) -> Option<T> {
    if !raw.is_object() {
        coercer.warn("record", format!("expected a JSON object, got {raw}"));
        return None;
    }
    match T::deserialize(raw) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            coercer.warn("record", format!("unreadable record: {e}"));
            None
        },
    }
}

// ============================================================================
// Transformers
// ============================================================================

/// `/deputados` item or `/deputados/{id}` detail
pub fn transform_deputy(raw: &Value) -> Transformed {
    let mut c = Coercer::new(Entity::Deputies);
    let Some(r) = parse_raw::<RawDeputy>(&mut c, raw) else {
        return c.finish(None);
    };
    let Some(id) = c.take("id", r.id) else {
        c.warn("id", "missing deputy id, record dropped");
        return c.finish(None);
    };

    let mut deputy = Deputy {
        id,
        uri: c.text("uri", r.uri),
        civil_name: c.text("nomeCivil", r.nome_civil),
        cpf: c.text("cpf", r.cpf),
        sex: c.text("sexo", r.sexo),
        website_url: c.text("urlWebsite", r.url_website),
        birth_date: c.date("dataNascimento", r.data_nascimento),
        death_date: c.date("dataFalecimento", r.data_falecimento),
        birth_state: c.text("ufNascimento", r.uf_nascimento),
        birth_city: c.text("municipioNascimento", r.municipio_nascimento),
        ..Deputy::default()
    };

    if r.ultimo_status.is_some() {
        let s: RawDeputyStatus = c.nested("ultimoStatus", r.ultimo_status);
        deputy.status_id = c.take("ultimoStatus.id", s.id);
        deputy.status_name = c.text("ultimoStatus.nome", s.nome);
        deputy.status_party = c.text("ultimoStatus.siglaPartido", s.sigla_partido);
        deputy.status_party_uri = c.text("ultimoStatus.uriPartido", s.uri_partido);
        deputy.status_state = c.text("ultimoStatus.siglaUf", s.sigla_uf);
        deputy.status_legislature_id = c.take("ultimoStatus.idLegislatura", s.id_legislatura);
        deputy.status_photo_url = c.text("ultimoStatus.urlFoto", s.url_foto);
        deputy.status_email = c.text("ultimoStatus.email", s.email);
        deputy.status_date = c.date("ultimoStatus.data", s.data);
        deputy.status_electoral_name = c.text("ultimoStatus.nomeEleitoral", s.nome_eleitoral);
        deputy.status_office = s.gabinete.filter(|v| !v.is_null());
        deputy.status_situation = c.text("ultimoStatus.situacao", s.situacao);
        deputy.status_electoral_condition =
            c.text("ultimoStatus.condicaoEleitoral", s.condicao_eleitoral);
        deputy.status_description = c.text("ultimoStatus.descricaoStatus", s.descricao_status);
    } else {
        deputy.status_name = c.text("nome", r.nome);
        deputy.status_party = c.text("siglaPartido", r.sigla_partido);
        deputy.status_party_uri = c.text("uriPartido", r.uri_partido);
        deputy.status_state = c.text("siglaUf", r.sigla_uf);
        deputy.status_legislature_id = c.take("idLegislatura", r.id_legislatura);
        deputy.status_photo_url = c.text("urlFoto", r.url_foto);
        deputy.status_email = c.text("email", r.email);
    }

    c.finish(Some(Record::Deputy(deputy)))
}

/// `/deputados/{id}/despesas` item
pub fn transform_expense(raw: &Value, deputy_id: i64) -> Transformed {
    let mut c = Coercer::new(Entity::Expenses);
    let Some(r) = parse_raw::<RawExpense>(&mut c, raw) else {
        return c.finish(None);
    };
    let year = c.take("ano", r.ano);
    let month = c.take("mes", r.mes);
    let document_code = c.take("codDocumento", r.cod_documento);
    let (Some(year), Some(month), Some(document_code)) = (year, month, document_code) else {
        c.warn("codDocumento", "incomplete expense key, record dropped");
        return c.finish(None);
    };

    let expense = Expense {
        deputy_id,
        year,
        month,
        document_code,
        expense_type: c.text("tipoDespesa", r.tipo_despesa),
        document_type: c.text("tipoDocumento", r.tipo_documento),
        document_type_code: c.take("codTipoDocumento", r.cod_tipo_documento),
        document_date: c.date("dataDocumento", r.data_documento),
        document_number: c.text("numDocumento", r.num_documento),
        document_value: c.decimal("valorDocumento", r.valor_documento),
        document_url: c.text("urlDocumento", r.url_documento),
        supplier_name: c.text("nomeFornecedor", r.nome_fornecedor),
        supplier_document: c.text("cnpjCpfFornecedor", r.cnpj_cpf_fornecedor),
        net_value: c.decimal("valorLiquido", r.valor_liquido),
        disallowed_value: c.decimal("valorGlosa", r.valor_glosa),
        reimbursement_number: c.text("numRessarcimento", r.num_ressarcimento),
        batch_code: c.take("codLote", r.cod_lote),
        installment: c.take("parcela", r.parcela),
    };
    c.finish(Some(Record::Expense(expense)))
}

/// `/deputados/{id}/discursos` item
pub fn transform_speech(raw: &Value, deputy_id: i64) -> Transformed {
    let mut c = Coercer::new(Entity::Speeches);
    let Some(r) = parse_raw::<RawSpeech>(&mut c, raw) else {
        return c.finish(None);
    };
    let Some(started_at) = c.timestamp("dataHoraInicio", r.data_hora_inicio) else {
        c.warn("dataHoraInicio", "missing speech start, record dropped");
        return c.finish(None);
    };

    let phase: RawEventPhase = c.nested("faseEvento", r.fase_evento);
    let speech = Speech {
        deputy_id,
        started_at,
        ended_at: c.timestamp("dataHoraFim", r.data_hora_fim),
        event_phase_title: c.text("faseEvento.titulo", phase.titulo),
        event_phase_started_at: c.timestamp("faseEvento.dataHoraInicio", phase.data_hora_inicio),
        event_phase_ended_at: c.timestamp("faseEvento.dataHoraFim", phase.data_hora_fim),
        speech_type: c.text("tipoDiscurso", r.tipo_discurso),
        text_url: c.text("urlTexto", r.url_texto),
        audio_url: c.text("urlAudio", r.url_audio),
        video_url: c.text("urlVideo", r.url_video),
        keywords: c.text("keywords", r.keywords),
        summary: c.text("sumario", r.sumario),
        transcript: c.text("transcricao", r.transcricao),
    };
    c.finish(Some(Record::Speech(speech)))
}

/// `/votacoes` item
pub fn transform_voting_session(raw: &Value) -> Transformed {
    let mut c = Coercer::new(Entity::VotingSessions);
    let Some(r) = parse_raw::<RawVotingSession>(&mut c, raw) else {
        return c.finish(None);
    };
    let Some(id) = c.text("id", r.id) else {
        c.warn("id", "missing voting session id, record dropped");
        return c.finish(None);
    };

    let last: RawLastPresentation =
        c.nested("ultimaApresentacaoProposicao", r.ultima_apresentacao_proposicao);
    let session = VotingSession {
        id,
        uri: c.text("uri", r.uri),
        date: c.date("data", r.data),
        registered_at: c.timestamp("dataHoraRegistro", r.data_hora_registro),
        body_acronym: c.text("siglaOrgao", r.sigla_orgao),
        body_uri: c.text("uriOrgao", r.uri_orgao),
        event_uri: c.text("uriEvento", r.uri_evento),
        description: c.text("descricao", r.descricao),
        proposal: r.proposicao_objeto.filter(|v| !v.is_null()),
        proposal_uri: c.text("uriProposicaoObjeto", r.uri_proposicao_objeto),
        last_presentation_at: c.timestamp(
            "ultimaApresentacaoProposicao.dataHoraRegistro",
            last.data_hora_registro,
        ),
        last_presentation_description: c.text(
            "ultimaApresentacaoProposicao.descricao",
            last.descricao,
        ),
        last_presentation_proposal_uri: c.text(
            "ultimaApresentacaoProposicao.uriProposicao",
            last.uri_proposicao,
        ),
        approved: c.flag("aprovacao", r.aprovacao),
    };
    c.finish(Some(Record::VotingSession(session)))
}

/// `/votacoes/{id}/votos` item
pub fn transform_vote(raw: &Value, session_id: &str) -> Transformed {
    let mut c = Coercer::new(Entity::Votes);
    let Some(r) = parse_raw::<RawVote>(&mut c, raw) else {
        return c.finish(None);
    };
    let deputy: RawVoteDeputy = c.nested("deputado_", r.deputado);
    let Some(deputy_id) = c.take("deputado_.id", deputy.id) else {
        c.warn("deputado_.id", "vote without deputy, record dropped");
        return c.finish(None);
    };

    let vote = Vote {
        session_id: session_id.to_string(),
        deputy_id,
        registered_at: c.timestamp("dataRegistroVoto", r.data_registro_voto),
        choice: c.text("tipoVoto", r.tipo_voto),
    };
    c.finish(Some(Record::Vote(vote)))
}

/// Transform every raw record of a page
pub fn transform_all<'a, I, F>(raws: I, f: F) -> Transformed
where
    I: IntoIterator<Item = &'a Value>,
    F: Fn(&Value) -> Transformed,
{
    let mut out = Transformed::default();
    for raw in raws {
        out.extend(f(raw));
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn only(t: &Transformed) -> &Record {
        assert_eq!(t.records.len(), 1, "warnings: {:?}", t.warnings);
        &t.records[0]
    }

    #[test]
    fn test_deputy_detail_flattens_status() {
        let raw = json!({
            "id": 204554,
            "uri": "https://dadosabertos.camara.leg.br/api/v2/deputados/204554",
            "nomeCivil": "Fulana de Tal",
            "sexo": "F",
            "dataNascimento": "1980-05-17",
            "dataFalecimento": null,
            "ultimoStatus": {
                "id": 204554,
                "nome": "Fulana",
                "siglaPartido": "PXX",
                "siglaUf": "SP",
                "idLegislatura": 57,
                "data": "2023-02-01",
                "gabinete": {"sala": "123", "predio": "4"},
                "situacao": "Exercício"
            }
        });
        let t = transform_deputy(&raw);
        let Record::Deputy(d) = only(&t) else { panic!("not a deputy") };
        assert_eq!(d.id, 204554);
        assert_eq!(d.birth_date, NaiveDate::from_ymd_opt(1980, 5, 17));
        assert_eq!(d.death_date, None);
        assert_eq!(d.status_party.as_deref(), Some("PXX"));
        assert_eq!(d.status_legislature_id, Some(57));
        assert_eq!(d.status_office, Some(json!({"sala": "123", "predio": "4"})));
        assert!(t.warnings.is_empty());
    }

    #[test]
    fn test_deputy_list_item_fills_status_from_top_level() {
        let raw = json!({"id": 1, "nome": "Beltrano", "siglaPartido": "PYY", "siglaUf": "RJ", "idLegislatura": 57});
        let t = transform_deputy(&raw);
        let Record::Deputy(d) = only(&t) else { panic!("not a deputy") };
        assert_eq!(d.status_name.as_deref(), Some("Beltrano"));
        assert_eq!(d.status_state.as_deref(), Some("RJ"));
        assert_eq!(d.civil_name, None);
    }

    #[test]
    fn test_malformed_sub_field_becomes_null_with_warning() {
        let raw = json!({"id": 1, "dataNascimento": "17/05/1980", "ultimoStatus": "gone"});
        let t = transform_deputy(&raw);
        let Record::Deputy(d) = only(&t) else { panic!("not a deputy") };
        assert_eq!(d.birth_date, None);
        assert_eq!(d.status_party, None);
        let fields: Vec<&str> = t.warnings.iter().map(|w| w.field).collect();
        assert_eq!(fields, vec!["dataNascimento", "ultimoStatus"]);
    }

    #[test]
    fn test_missing_key_yields_no_records() {
        let t = transform_deputy(&json!({"nome": "sem id"}));
        assert!(t.records.is_empty());
        assert_eq!(t.warnings.len(), 1);

        let t = transform_deputy(&json!("not an object"));
        assert!(t.records.is_empty());
        assert_eq!(t.warnings[0].field, "record");
    }

    #[test]
    fn test_expense_decimals_are_exact() {
        let raw = json!({
            "ano": 2024, "mes": 3, "codDocumento": 7712,
            "tipoDespesa": "COMBUSTÍVEIS", "dataDocumento": "2024-03-05T00:00:00",
            "valorDocumento": 150.1, "valorLiquido": "149.99", "valorGlosa": 0,
            "codLote": 1999, "parcela": 0
        });
        let t = transform_expense(&raw, 204554);
        let Record::Expense(e) = only(&t) else { panic!("not an expense") };
        assert_eq!(e.deputy_id, 204554);
        assert_eq!(e.document_value, Some(BigDecimal::from_str("150.1").unwrap()));
        assert_eq!(e.net_value, Some(BigDecimal::from_str("149.99").unwrap()));
        assert_eq!(e.document_date, NaiveDate::from_ymd_opt(2024, 3, 5));
        assert!(t.warnings.is_empty());
    }

    #[test]
    fn test_expense_without_document_code_is_dropped() {
        let t = transform_expense(&json!({"ano": 2024, "mes": 3}), 1);
        assert!(t.records.is_empty());
        assert!(!t.warnings.is_empty());
    }

    #[test]
    fn test_speech_flattens_event_phase() {
        let raw = json!({
            "dataHoraInicio": "2024-01-10T14:05",
            "faseEvento": {"titulo": "Pequeno Expediente", "dataHoraInicio": "2024-01-10T14:00"},
            "tipoDiscurso": "BREVES COMUNICAÇÕES",
            "sumario": "Homenagem."
        });
        let t = transform_speech(&raw, 9);
        let Record::Speech(s) = only(&t) else { panic!("not a speech") };
        assert_eq!(s.started_at.to_string(), "2024-01-10 14:05:00");
        assert_eq!(s.event_phase_title.as_deref(), Some("Pequeno Expediente"));
        assert_eq!(s.transcript, None);
    }

    #[test]
    fn test_voting_session_flag_and_proposal() {
        let raw = json!({
            "id": "2391371-58",
            "data": "2024-01-10",
            "dataHoraRegistro": "2024-01-10T18:33:12",
            "siglaOrgao": "PLEN",
            "proposicaoObjeto": "PL 1234/2023",
            "aprovacao": 1,
            "ultimaApresentacaoProposicao": {"descricao": "Parecer", "uriProposicao": null}
        });
        let t = transform_voting_session(&raw);
        let Record::VotingSession(v) = only(&t) else { panic!("not a voting session") };
        assert_eq!(v.approved, Some(true));
        assert_eq!(v.proposal, Some(json!("PL 1234/2023")));
        assert_eq!(v.last_presentation_description.as_deref(), Some("Parecer"));
        assert_eq!(v.last_presentation_proposal_uri, None);

        let t = transform_voting_session(&json!({"id": "1-1", "aprovacao": "sim"}));
        let Record::VotingSession(v) = only(&t) else { panic!("not a voting session") };
        assert_eq!(v.approved, None);
        assert_eq!(t.warnings[0].field, "aprovacao");
    }

    #[test]
    fn test_vote_reads_deputy_under_either_name() {
        let modern = json!({"tipoVoto": "Sim", "dataRegistroVoto": "2024-01-10T18:30:00", "deputado_": {"id": 5}});
        let legacy = json!({"tipoVoto": "Não", "deputado": {"id": 6}});

        let t = transform_vote(&modern, "1-1");
        let Record::Vote(v) = only(&t) else { panic!("not a vote") };
        assert_eq!((v.session_id.as_str(), v.deputy_id), ("1-1", 5));
        assert!(v.registered_at.is_some());

        let t = transform_vote(&legacy, "1-1");
        let Record::Vote(v) = only(&t) else { panic!("not a vote") };
        assert_eq!(v.deputy_id, 6);

        let t = transform_vote(&json!({"tipoVoto": "Sim"}), "1-1");
        assert!(t.records.is_empty());
    }

    #[test]
    fn test_transform_all_collects_records_and_warnings() {
        let raws = vec![json!({"id": 1}), json!({}), json!({"id": 2})];
        let t = transform_all(&raws, transform_deputy);
        assert_eq!(t.records.len(), 2);
        assert_eq!(t.warnings.len(), 1);
    }
}
