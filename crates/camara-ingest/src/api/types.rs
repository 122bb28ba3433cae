//! Upstream request and response shapes

use camara_common::DateRange;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IngestError, Result};

/// One logical endpoint of the open data API, with its filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `/deputados`: current legislature, no date filter
    Deputies,
    /// `/deputados/{id}`: single object
    DeputyDetail(i64),
    /// `/deputados/{id}/despesas?ano&mes`
    Expenses { deputy_id: i64, year: i32, month: u32 },
    /// `/deputados/{id}/discursos?dataInicio&dataFim`
    Speeches { deputy_id: i64, range: DateRange },
    /// `/votacoes?dataInicio&dataFim`
    VotingSessions { range: DateRange },
    /// `/votacoes/{id}/votos`: unpaginated
    Votes { session_id: String },
}

impl Endpoint {
    pub fn path(&self) -> String {
        match self {
            Endpoint::Deputies => "/deputados".to_string(),
            Endpoint::DeputyDetail(id) => format!("/deputados/{id}"),
            Endpoint::Expenses { deputy_id, .. } => format!("/deputados/{deputy_id}/despesas"),
            Endpoint::Speeches { deputy_id, .. } => format!("/deputados/{deputy_id}/discursos"),
            Endpoint::VotingSessions { .. } => "/votacoes".to_string(),
            Endpoint::Votes { session_id } => format!("/votacoes/{session_id}/votos"),
        }
    }

    /// Whether `pagina`/`itens` apply
    pub fn is_paginated(&self) -> bool {
        !matches!(self, Endpoint::DeputyDetail(_) | Endpoint::Votes { .. })
    }

    /// Filter and ordering parameters, excluding paging
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let ascending = |field: &str| {
            vec![
                ("ordem", "ASC".to_string()),
                ("ordenarPor", field.to_string()),
            ]
        };
        match self {
            Endpoint::Deputies => ascending("nome"),
            Endpoint::DeputyDetail(_) | Endpoint::Votes { .. } => Vec::new(),
            Endpoint::Expenses { year, month, .. } => {
                let mut query = vec![("ano", year.to_string()), ("mes", month.to_string())];
                query.extend(ascending("ano"));
                query
            },
            Endpoint::Speeches { range, .. } => {
                let mut query = date_filter(range);
                query.extend(ascending("dataHoraInicio"));
                query
            },
            Endpoint::VotingSessions { range } => {
                let mut query = date_filter(range);
                query.extend(ascending("dataHoraRegistro"));
                query
            },
        }
    }
}

fn date_filter(range: &DateRange) -> Vec<(&'static str, String)> {
    vec![
        ("dataInicio", range.start().format("%Y-%m-%d").to_string()),
        ("dataFim", range.end().format("%Y-%m-%d").to_string()),
    ]
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path())?;
        let query = self.query();
        let filters: Vec<String> = query
            .iter()
            .filter(|(k, _)| !k.starts_with("orde"))
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if !filters.is_empty() {
            write!(f, "?{}", filters.join("&"))?;
        }
        Ok(())
    }
}

/// A page of one endpoint (1-based)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub endpoint: Endpoint,
    pub page: u32,
}

impl PageRequest {
    pub fn first(endpoint: Endpoint) -> Self {
        Self { endpoint, page: 1 }
    }

    pub fn next(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            page: self.page + 1,
        }
    }
}

/// Raw records of one page and whether another page should be requested
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<Value>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
}

/// `{"dados": ..., "links": [...]}`
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub dados: Value,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl Envelope {
    fn has_next_link(&self) -> bool {
        self.links.iter().any(|link| link.rel == "next")
    }

    /// Turn the envelope into a [`Page`].
    ///
    /// A short page always ends pagination. A full page continues unless the
    /// envelope carries links and none of them is `rel="next"`.
    pub fn into_page(self, request: &PageRequest, page_size: u32) -> Result<Page> {
        let has_next = self.has_next_link();
        let links_present = !self.links.is_empty();

        let records = match self.dados {
            Value::Array(records) => records,
            Value::Object(record) => vec![Value::Object(record)],
            Value::Null => Vec::new(),
            other => {
                return Err(IngestError::Decode(format!(
                    "{}: expected array or object in 'dados', got {}",
                    request.endpoint,
                    json_kind(&other)
                )))
            },
        };

        let full_page = records.len() >= page_size as usize;
        let has_more =
            request.endpoint.is_paginated() && full_page && (!links_present || has_next);

        Ok(Page { records, has_more })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn envelope(value: Value) -> Envelope {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_full_page_with_next_link_continues() {
        let request = PageRequest::first(Endpoint::Deputies);
        let page = envelope(json!({
            "dados": [{"id": 1}, {"id": 2}],
            "links": [{"rel": "self", "href": "x"}, {"rel": "next", "href": "y"}]
        }))
        .into_page(&request, 2)
        .unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(page.has_more);
    }

    #[test]
    fn test_full_page_without_next_link_stops() {
        let request = PageRequest::first(Endpoint::Deputies);
        let page = envelope(json!({
            "dados": [{"id": 1}, {"id": 2}],
            "links": [{"rel": "self", "href": "x"}, {"rel": "last", "href": "x"}]
        }))
        .into_page(&request, 2)
        .unwrap();
        assert!(!page.has_more);
    }

    #[test]
    fn test_short_page_stops_even_with_next_link() {
        let request = PageRequest::first(Endpoint::Deputies);
        let page = envelope(json!({
            "dados": [{"id": 1}],
            "links": [{"rel": "next", "href": "y"}]
        }))
        .into_page(&request, 2)
        .unwrap();
        assert!(!page.has_more);
    }

    #[test]
    fn test_detail_object_becomes_single_record() {
        let request = PageRequest::first(Endpoint::DeputyDetail(204554));
        let page = envelope(json!({"dados": {"id": 204554}, "links": []}))
            .into_page(&request, 1)
            .unwrap();
        assert_eq!(page.records, vec![json!({"id": 204554})]);
        assert!(!page.has_more);
    }

    #[test]
    fn test_scalar_dados_is_decode_error() {
        let request = PageRequest::first(Endpoint::Deputies);
        let err = envelope(json!({"dados": "oops"}))
            .into_page(&request, 100)
            .unwrap_err();
        assert!(matches!(err, IngestError::Decode(_)));
    }

    #[test]
    fn test_endpoint_query_and_display() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        )
        .unwrap();
        let endpoint = Endpoint::VotingSessions { range };
        assert_eq!(endpoint.path(), "/votacoes");
        assert!(endpoint
            .query()
            .contains(&("dataInicio", "2024-01-10".to_string())));
        assert_eq!(
            endpoint.to_string(),
            "/votacoes?dataInicio=2024-01-10&dataFim=2024-01-15"
        );

        let expenses = Endpoint::Expenses {
            deputy_id: 7,
            year: 2024,
            month: 3,
        };
        assert_eq!(expenses.to_string(), "/deputados/7/despesas?ano=2024&mes=3");
        assert!(!Endpoint::Votes { session_id: "1-2".into() }.is_paginated());
    }
}
