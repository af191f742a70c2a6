//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use member_sync::config::{RetryConfig, UpstreamConfig};
use member_sync::database::{Database, SqliteDatabase};
use member_sync::models::MembershipDiff;
use regex_lite::Regex;
use serde_json::{json, Map, Value};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Create an in-memory database for testing
pub async fn create_test_database() -> Arc<SqliteDatabase> {
    Arc::new(
        SqliteDatabase::new(":memory:")
            .await
            .expect("Failed to create test database"),
    )
}

/// Store `members` as the current membership of `group_id`
pub async fn seed_members(db: &SqliteDatabase, group_id: i64, members: &[i64]) {
    let diff = MembershipDiff {
        left: vec![],
        joined: members.to_vec(),
    };
    db.apply_membership_diff(group_id, &diff)
        .await
        .expect("Failed to seed members");
}

/// Upstream configuration pointing at a mock server
pub fn upstream_config(server: &MockServer) -> UpstreamConfig {
    UpstreamConfig {
        base_url: server.uri(),
        request_timeout_secs: 5,
        ..Default::default()
    }
}

/// Retry configuration with a short quota window
pub fn fast_retry() -> RetryConfig {
    RetryConfig { quota_window_ms: 20 }
}

/// One request received by the fake upstream
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: String,
    pub token: Option<String>,
    /// Sub-calls of an `execute`, 1 for a plain method call
    pub calls: usize,
}

/// State of the fake upstream
#[derive(Debug, Default)]
pub struct UpstreamState {
    /// Member lists by group id
    pub groups: HashMap<i64, Vec<i64>>,
    /// Groups hidden by privacy settings
    pub private_groups: HashSet<i64>,
    /// Number of upcoming requests answered with a rate-limit error
    pub rate_limit_next: u32,
    pub requests: Vec<RecordedRequest>,
}

impl UpstreamState {
    pub fn execute_requests(&self) -> usize {
        self.requests.iter().filter(|r| r.method == "execute").count()
    }

    fn answer(&self, method: &str, params: &Map<String, Value>) -> Result<Value, (i64, String)> {
        match method {
            "groups.getMembers" => {
                let group_id = param_i64(params, "group_id");
                if self.private_groups.contains(&group_id) {
                    return Err((260, "Group members are hidden".to_string()));
                }
                let members = self
                    .groups
                    .get(&group_id)
                    .ok_or((100, "group not found".to_string()))?;

                let offset = (param_i64(params, "offset") as usize).min(members.len());
                let count = param_i64(params, "count") as usize;
                let end = (offset + count).min(members.len());
                Ok(json!({"count": members.len(), "items": &members[offset..end]}))
            }
            other => Err((3, format!("Unknown method passed: {}", other))),
        }
    }
}

/// Numeric parameter given either as a JSON number or as a form string
fn param_i64(params: &Map<String, Value>, key: &str) -> i64 {
    match params.get(key) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// wiremock responder speaking the upstream method and `execute` protocol
pub struct FakeUpstream {
    state: Arc<Mutex<UpstreamState>>,
    call_pattern: Regex,
}

impl FakeUpstream {
    pub fn new(state: Arc<Mutex<UpstreamState>>) -> Self {
        Self {
            state,
            call_pattern: Regex::new(r"API\.([A-Za-z.]+)\((\{[^}]*\})\)").unwrap(),
        }
    }

    fn parse_calls(&self, code: &str) -> Vec<(String, Map<String, Value>)> {
        self.call_pattern
            .captures_iter(code)
            .map(|caps| {
                let params: Map<String, Value> = serde_json::from_str(&caps[2]).unwrap();
                (caps[1].to_string(), params)
            })
            .collect()
    }
}

/// Decode an `application/x-www-form-urlencoded` body
fn parse_form(request: &Request) -> HashMap<String, String> {
    let body = String::from_utf8_lossy(&request.body);
    request
        .url
        .join(&format!("?{}", body))
        .map(|url| url.query_pairs().into_owned().collect())
        .unwrap_or_default()
}

impl Respond for FakeUpstream {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let method = request
            .url
            .path()
            .trim_start_matches("/method/")
            .to_string();
        let form = parse_form(request);
        let token = request
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_start_matches("Bearer ").to_string());

        let mut state = self.state.lock().unwrap();

        let calls = if method == "execute" {
            self.parse_calls(form.get("code").map(String::as_str).unwrap_or_default())
        } else {
            let params = form
                .iter()
                .filter(|(key, _)| key.as_str() != "v")
                .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                .collect();
            vec![(method.clone(), params)]
        };

        state.requests.push(RecordedRequest {
            method: method.clone(),
            token,
            calls: calls.len(),
        });

        if state.rate_limit_next > 0 {
            state.rate_limit_next -= 1;
            return ResponseTemplate::new(200).set_body_json(json!({
                "error": {"error_code": 6, "error_msg": "Too many requests per second"}
            }));
        }

        if method != "execute" {
            let (name, params) = &calls[0];
            let body = match state.answer(name, params) {
                Ok(response) => json!({ "response": response }),
                Err((code, message)) => json!({
                    "error": {"error_code": code, "error_msg": message}
                }),
            };
            return ResponseTemplate::new(200).set_body_json(body);
        }

        let mut results = Vec::new();
        let mut errors = Vec::new();
        for (name, params) in &calls {
            match state.answer(name, params) {
                Ok(response) => results.push(response),
                Err((code, message)) => {
                    results.push(Value::Bool(false));
                    errors.push(json!({"method": name, "error_code": code, "error_msg": message}));
                }
            }
        }

        ResponseTemplate::new(200).set_body_json(json!({
            "response": results,
            "execute_errors": errors,
        }))
    }
}

/// Start a mock upstream backed by `state`
pub async fn start_upstream(state: Arc<Mutex<UpstreamState>>) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(FakeUpstream::new(state))
        .mount(&server)
        .await;
    server
}
