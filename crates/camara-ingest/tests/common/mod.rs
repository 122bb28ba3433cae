//! Shared fixtures for camara-ingest integration tests
//!
//! [`SimulatedApi`] is an in-process [`PageSource`] serving a configurable
//! data set with the same paging and filtering rules as the upstream API.
//! It records every request so tests can assert on request counts.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use camara_common::Entity;
use camara_ingest::{
    api::{Endpoint, Page, PageRequest, PageSource},
    clock::FixedClock,
    error::{IngestError, Result},
    loader::InMemoryStore,
    orchestrator::{ExtractionOrchestrator, OrchestratorSettings},
    watermark::MemoryWatermarkStore,
};
use chrono::{Datelike, NaiveDate};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio_util::sync::CancellationToken;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

// ============================================================================
// Raw records, shaped like the upstream payloads
// ============================================================================

pub fn deputy_json(id: i64) -> Value {
    json!({
        "id": id,
        "uri": format!("https://dadosabertos.camara.leg.br/api/v2/deputados/{id}"),
        "nome": format!("Deputado {id}"),
        "siglaPartido": "PT",
        "siglaUf": "SP",
        "idLegislatura": 57,
        "email": format!("dep.{id}@camara.leg.br")
    })
}

pub fn deputy_detail_json(id: i64) -> Value {
    json!({
        "id": id,
        "uri": format!("https://dadosabertos.camara.leg.br/api/v2/deputados/{id}"),
        "nomeCivil": format!("Nome Civil {id}"),
        "cpf": "00000000000",
        "sexo": "F",
        "dataNascimento": "1970-05-17",
        "ufNascimento": "SP",
        "municipioNascimento": "Campinas",
        "ultimoStatus": {
            "id": id,
            "nome": format!("Deputada {id}"),
            "siglaPartido": "PSOL",
            "siglaUf": "SP",
            "idLegislatura": 57,
            "data": "2023-02-01",
            "situacao": "Exercício",
            "condicaoEleitoral": "Titular",
            "gabinete": { "nome": "301", "predio": "4" }
        }
    })
}

pub fn session_json(id: &str, day: NaiveDate) -> Value {
    json!({
        "id": id,
        "uri": format!("https://dadosabertos.camara.leg.br/api/v2/votacoes/{id}"),
        "data": day.format("%Y-%m-%d").to_string(),
        "dataHoraRegistro": format!("{}T18:30:00", day.format("%Y-%m-%d")),
        "siglaOrgao": "PLEN",
        "descricao": "Aprovado o requerimento",
        "aprovacao": 1
    })
}

pub fn vote_json(deputy_id: i64, choice: &str) -> Value {
    json!({
        "tipoVoto": choice,
        "dataRegistroVoto": "2024-01-10T18:31:12",
        "deputado_": { "id": deputy_id, "nome": format!("Deputado {deputy_id}") }
    })
}

pub fn expense_json(year: i32, month: u32, code: i64) -> Value {
    json!({
        "ano": year,
        "mes": month,
        "tipoDespesa": "COMBUSTÍVEIS E LUBRIFICANTES.",
        "codDocumento": code,
        "tipoDocumento": "Nota Fiscal",
        "dataDocumento": format!("{year}-{month:02}-05T00:00:00"),
        "valorDocumento": 250.37,
        "valorLiquido": 250.37,
        "valorGlosa": 0,
        "nomeFornecedor": "Posto Central",
        "parcela": 0
    })
}

pub fn speech_json(day: NaiveDate, hour: u32) -> Value {
    json!({
        "dataHoraInicio": format!("{}T{hour:02}:00", day.format("%Y-%m-%d")),
        "tipoDiscurso": "BREVES COMUNICAÇÕES",
        "faseEvento": { "titulo": "Pequeno Expediente" },
        "sumario": "Comentários sobre a pauta"
    })
}

// ============================================================================
// Simulated upstream
// ============================================================================

/// Short name of the endpoint family a request targets
pub fn kind(endpoint: &Endpoint) -> &'static str {
    match endpoint {
        Endpoint::Deputies => "deputados",
        Endpoint::DeputyDetail(_) => "deputado",
        Endpoint::Expenses { .. } => "despesas",
        Endpoint::Speeches { .. } => "discursos",
        Endpoint::VotingSessions { .. } => "votacoes",
        Endpoint::Votes { .. } => "votos",
    }
}

#[derive(Default)]
struct Data {
    deputies: Vec<Value>,
    sessions: Vec<(NaiveDate, Value)>,
    votes: HashMap<String, Vec<Value>>,
    expenses: Vec<((i64, i32, u32), Value)>,
    speeches: Vec<(i64, NaiveDate, Value)>,
}

pub struct SimulatedApi {
    page_size: u32,
    data: Mutex<Data>,
    requests: Mutex<Vec<PageRequest>>,
    failures: Mutex<HashMap<&'static str, u16>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl SimulatedApi {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            data: Mutex::new(Data::default()),
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            cancel_after: Mutex::new(None),
        }
    }

    pub fn with_deputies(self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.data
            .lock()
            .unwrap()
            .deputies
            .extend(ids.into_iter().map(deputy_json));
        self
    }

    /// Voting session on `day` with one vote per `(deputy, choice)`
    pub fn with_session(self, id: &str, day: NaiveDate, votes: &[(i64, &str)]) -> Self {
        {
            let mut data = self.data.lock().unwrap();
            data.sessions.push((day, session_json(id, day)));
            data.votes.insert(
                id.to_string(),
                votes.iter().map(|(d, c)| vote_json(*d, c)).collect(),
            );
        }
        self
    }

    pub fn with_expense(self, deputy_id: i64, year: i32, month: u32, code: i64) -> Self {
        self.data
            .lock()
            .unwrap()
            .expenses
            .push(((deputy_id, year, month), expense_json(year, month, code)));
        self
    }

    pub fn with_speech(self, deputy_id: i64, day: NaiveDate, hour: u32) -> Self {
        self.data
            .lock()
            .unwrap()
            .speeches
            .push((deputy_id, day, speech_json(day, hour)));
        self
    }

    /// Answer every request of the `kind` family with HTTP `status`
    pub fn fail(&self, kind: &'static str, status: u16) {
        self.failures.lock().unwrap().insert(kind, status);
    }

    /// Cancel `token` once `requests` requests have been served
    pub fn cancel_after(&self, requests: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((requests, token));
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, kind_name: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| kind(&r.endpoint) == kind_name)
            .count()
    }

    fn matching(&self, endpoint: &Endpoint) -> Option<Vec<Value>> {
        let data = self.data.lock().unwrap();
        let records = match endpoint {
            Endpoint::Deputies => data.deputies.clone(),
            Endpoint::DeputyDetail(id) => {
                let listed = data
                    .deputies
                    .iter()
                    .any(|d| d.get("id").and_then(Value::as_i64) == Some(*id));
                if !listed {
                    return None;
                }
                vec![deputy_detail_json(*id)]
            },
            Endpoint::Expenses {
                deputy_id,
                year,
                month,
            } => data
                .expenses
                .iter()
                .filter(|(key, _)| *key == (*deputy_id, *year, *month))
                .map(|(_, v)| v.clone())
                .collect(),
            Endpoint::Speeches { deputy_id, range } => data
                .speeches
                .iter()
                .filter(|(d, day, _)| d == deputy_id && range.contains(*day))
                .map(|(_, _, v)| v.clone())
                .collect(),
            Endpoint::VotingSessions { range } => {
                assert_eq!(
                    range.start().year(),
                    range.end().year(),
                    "voting session ranges must not cross a year"
                );
                data.sessions
                    .iter()
                    .filter(|(day, _)| range.contains(*day))
                    .map(|(_, v)| v.clone())
                    .collect()
            },
            Endpoint::Votes { session_id } => data.votes.get(session_id)?.clone(),
        };
        Some(records)
    }
}

#[async_trait]
impl PageSource for SimulatedApi {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        let served = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };
        if let Some((after, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if served >= *after {
                token.cancel();
            }
        }

        if let Some(status) = self.failures.lock().unwrap().get(kind(&request.endpoint)) {
            return Err(IngestError::Client {
                status: *status,
                message: format!("{} rejected", request.endpoint),
            });
        }

        let Some(records) = self.matching(&request.endpoint) else {
            return Err(IngestError::Client {
                status: 404,
                message: format!("{} not found", request.endpoint),
            });
        };

        if !request.endpoint.is_paginated() {
            return Ok(Page {
                records,
                has_more: false,
            });
        }

        let size = self.page_size as usize;
        let offset = (request.page as usize - 1) * size;
        let page: Vec<Value> = records.iter().skip(offset).take(size).cloned().collect();
        Ok(Page {
            has_more: offset + page.len() < records.len(),
            records: page,
        })
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub struct Harness {
    pub api: Arc<SimulatedApi>,
    pub store: Arc<InMemoryStore>,
    pub watermarks: Arc<MemoryWatermarkStore>,
    pub clock: Arc<FixedClock>,
    pub orchestrator: Arc<ExtractionOrchestrator>,
}

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        history_start: date(2024, 1, 1),
        floors: Default::default(),
        max_window_days: 30,
        concurrency: 2,
        run_timeout: None,
        fetch_deputy_details: false,
    }
}

impl Harness {
    pub fn new(api: SimulatedApi, today: NaiveDate) -> Self {
        Self::with_settings(api, today, settings())
    }

    pub fn with_settings(api: SimulatedApi, today: NaiveDate, settings: OrchestratorSettings) -> Self {
        let api = Arc::new(api);
        let store = Arc::new(InMemoryStore::new());
        let watermarks = Arc::new(MemoryWatermarkStore::new());
        let clock = Arc::new(FixedClock::at_date(today));

        let orchestrator = Arc::new(
            ExtractionOrchestrator::new(api.clone(), store.clone(), watermarks.clone(), settings)
                .with_clock(clock.clone()),
        );

        Self {
            api,
            store,
            watermarks,
            clock,
            orchestrator,
        }
    }

    /// Move the pinned clock to midnight of `day`
    pub fn set_today(&self, day: NaiveDate) {
        self.clock.set(day.and_hms_opt(0, 0, 0).unwrap().and_utc());
    }
}

/// Entity whose rows a request family writes
pub fn entity_of(kind_name: &str) -> Entity {
    match kind_name {
        "deputados" | "deputado" => Entity::Deputies,
        "despesas" => Entity::Expenses,
        "discursos" => Entity::Speeches,
        "votacoes" => Entity::VotingSessions,
        _ => Entity::Votes,
    }
}
