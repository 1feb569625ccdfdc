//! Freshservice REST client.
//!
//! Auth is HTTP Basic with the API key as username and `X` as password.
//! Every listing is page-numbered with `per_page=100`.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{
    Conversation, Department, PsaConfig, RemoteTicket, Requester, TicketingSource, TimeEntry,
    ACCOUNT_NUMBER_FIELD, CLOSED_STATUS_IDS, PER_PAGE,
};
use crate::remote::{Page, PageCursor, RemoteClient, RemoteError};

/// Conversation threads longer than this many pages are truncated.
const MAX_CONVERSATION_PAGES: u32 = 50;

pub struct FreshserviceClient {
    remote: RemoteClient,
    base_url: String,
    authorization: String,
}

impl FreshserviceClient {
    pub fn new(config: &PsaConfig) -> Result<Self, RemoteError> {
        if config.api_key.trim().is_empty() {
            return Err(RemoteError::Auth("Freshservice API key is not configured".to_string()));
        }
        let remote = RemoteClient::new("freshservice", config.requests_per_second, config.retry.clone())?;
        let credentials = base64::engine::general_purpose::STANDARD.encode(format!("{}:X", config.api_key));
        Ok(Self {
            remote,
            base_url: config.base_url(),
            authorization: format!("Basic {}", credentials),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v2{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.remote
            .http()
            .request(method, self.url(path))
            .header(AUTHORIZATION, &self.authorization)
            .header(CONTENT_TYPE, "application/json")
    }

    /// GET `path` and pull the array under `key` out of the envelope.
    async fn fetch_list<T: DeserializeOwned>(
        &self,
        path: &str,
        key: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, RemoteError> {
        let request = self.request(reqwest::Method::GET, path).query(query);
        let body: serde_json::Value = self.remote.get_json(request).await?;
        match body.get(key) {
            Some(serde_json::Value::Null) => Ok(Vec::new()),
            Some(items) => serde_json::from_value(items.clone())
                .map_err(|e| RemoteError::Decode(format!("{} in '{}': {}", key, path, e))),
            None => Err(RemoteError::Decode(format!(
                "response from '{}' has no '{}' field",
                path, key
            ))),
        }
    }

    fn page_query(page: u32) -> Vec<(&'static str, String)> {
        vec![("page", page.to_string()), ("per_page", PER_PAGE.to_string())]
    }
}

/// Filter expression for closed tickets updated after `since`.
pub fn closed_tickets_query(since: DateTime<Utc>) -> String {
    let statuses = CLOSED_STATUS_IDS
        .iter()
        .map(|id| format!("status:{}", id))
        .collect::<Vec<_>>()
        .join(" OR ");
    format!(
        "\"({}) AND updated_at:>'{}'\"",
        statuses,
        since.format("%Y-%m-%dT%H:%M:%SZ")
    )
}

#[async_trait]
impl TicketingSource for FreshserviceClient {
    async fn departments_page(&self, cursor: PageCursor) -> Result<Page<Department>, RemoteError> {
        let page = cursor.page_number();
        let items = self
            .fetch_list("/departments", "departments", &Self::page_query(page))
            .await?;
        Ok(Page::numbered(items, page, PER_PAGE))
    }

    async fn requesters_page(&self, cursor: PageCursor) -> Result<Page<Requester>, RemoteError> {
        let page = cursor.page_number();
        let items = self
            .fetch_list("/requesters", "requesters", &Self::page_query(page))
            .await?;
        Ok(Page::numbered(items, page, PER_PAGE))
    }

    async fn closed_tickets_page(
        &self,
        since: DateTime<Utc>,
        cursor: PageCursor,
    ) -> Result<Page<RemoteTicket>, RemoteError> {
        let page = cursor.page_number();
        let mut query = Self::page_query(page);
        query.push(("query", closed_tickets_query(since)));
        let items = self.fetch_list("/tickets/filter", "tickets", &query).await?;
        // The filter endpoint caps its page size, so only an empty page ends it.
        Ok(Page::until_empty(items, page))
    }

    async fn ticket_conversations(&self, ticket_id: i64) -> Result<Vec<Conversation>, RemoteError> {
        let path = format!("/tickets/{}/conversations", ticket_id);
        let mut all = Vec::new();
        for page in 1..=MAX_CONVERSATION_PAGES {
            let items: Vec<Conversation> = match self
                .fetch_list(&path, "conversations", &Self::page_query(page))
                .await
            {
                Ok(items) => items,
                Err(e) if e.is_not_found() => return Ok(all),
                Err(e) => return Err(e),
            };
            let short = items.len() < PER_PAGE;
            all.extend(items);
            if short {
                return Ok(all);
            }
        }
        log::warn!(
            "Ticket #{}: conversation thread exceeds {} pages, truncated",
            ticket_id,
            MAX_CONVERSATION_PAGES
        );
        Ok(all)
    }

    async fn ticket_time_entries(&self, ticket_id: i64) -> Result<Vec<TimeEntry>, RemoteError> {
        let path = format!("/tickets/{}/time_entries", ticket_id);
        match self.fetch_list(&path, "time_entries", &[]).await {
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            other => other,
        }
    }

    async fn set_department_account_number(
        &self,
        department_id: i64,
        account_number: &str,
    ) -> Result<(), RemoteError> {
        let path = format!("/departments/{}", department_id);
        let request = self
            .request(reqwest::Method::PUT, &path)
            .json(&json!({ "custom_fields": { ACCOUNT_NUMBER_FIELD: account_number } }));
        self.remote.send(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{Paginator, RetryPolicy};
    use chrono::TimeZone;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> FreshserviceClient {
        FreshserviceClient::new(&PsaConfig {
            domain: server.uri(),
            api_key: "secret".to_string(),
            requests_per_second: 0.0,
            retry: RetryPolicy {
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                ..RetryPolicy::default()
            },
        })
        .unwrap()
    }

    fn departments(range: std::ops::Range<i64>) -> serde_json::Value {
        let items: Vec<_> = range
            .map(|id| json!({"id": id, "name": format!("Dept {}", id)}))
            .collect();
        json!({ "departments": items })
    }

    #[tokio::test]
    async fn test_departments_paginate_until_short_page() {
        let server = MockServer::start().await;
        // "secret:X" in base64.
        Mock::given(method("GET"))
            .and(path("/api/v2/departments"))
            .and(query_param("page", "1"))
            .and(query_param("per_page", "100"))
            .and(header("Authorization", "Basic c2VjcmV0Olg="))
            .respond_with(ResponseTemplate::new(200).set_body_json(departments(0..100)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/departments"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(departments(100..130)))
            .expect(1)
            .mount(&server)
            .await;

        let fs = client(&server);
        let mut pages = Paginator::new("/departments");
        let mut total = 0;
        while let Some(items) = pages.next_page(|c| fs.departments_page(c)).await.unwrap() {
            total += items.len();
        }
        assert_eq!(total, 130);
        assert_eq!(pages.pages_fetched(), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_page_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/requesters"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/requesters"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "requesters": [{"id": 9, "first_name": "Ana", "primary_email": "ana@acme.example",
                                "department_ids": [17]}]
            })))
            .mount(&server)
            .await;

        let page = client(&server).requesters_page(PageCursor::Start).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].department_ids(), &[17]);
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn test_closed_ticket_filter_query() {
        let server = MockServer::start().await;
        let since = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        Mock::given(method("GET"))
            .and(path("/api/v2/tickets/filter"))
            .and(query_param(
                "query",
                "\"(status:4 OR status:5) AND updated_at:>'2025-01-02T03:04:05Z'\"",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tickets": [{"id": 1, "status": 5, "priority": 2, "updated_at": "2025-01-03T00:00:00Z"}],
                "total": 1
            })))
            .mount(&server)
            .await;

        let page = client(&server)
            .closed_tickets_page(since, PageCursor::Start)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next, Some(PageCursor::Number(2)));
    }

    #[tokio::test]
    async fn test_missing_ticket_has_no_conversations_or_time() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fs = client(&server);
        assert!(fs.ticket_conversations(77).await.unwrap().is_empty());
        assert!(fs.ticket_time_entries(77).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sub_resource_server_error_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/tickets/5/time_entries"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client(&server).ticket_time_entries(5).await.unwrap_err();
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test]
    async fn test_set_department_account_number() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v2/departments/17"))
            .and(body_json(json!({"custom_fields": {"account_number": "482913"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"department": {"id": 17}})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .set_department_account_number(17, "482913")
            .await
            .unwrap();
    }

    #[test]
    fn test_missing_api_key_rejected() {
        let result = FreshserviceClient::new(&PsaConfig {
            domain: "acme.freshservice.com".into(),
            api_key: " ".into(),
            requests_per_second: 1.0,
            retry: RetryPolicy::default(),
        });
        assert!(matches!(result, Err(RemoteError::Auth(_))));
    }
}
