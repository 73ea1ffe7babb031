/// External collaborators used by activity nodes
///
/// The engine only knows these traits. Record storage, outbound HTTP, script
/// execution and named connectors are injected through [`Collaborators`].

use crate::error::ActionError;
use crate::runtime::expression;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Record CRUD used by create/update/delete/get_record nodes
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create(&self, object: &str, data: Value) -> Result<Value, ActionError>;
    async fn update(&self, object: &str, id: &str, data: Value) -> Result<Value, ActionError>;
    async fn delete(&self, object: &str, id: &str) -> Result<bool, ActionError>;
    async fn get(&self, object: &str, id: &str) -> Result<Option<Value>, ActionError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

/// Outbound HTTP used by http_request nodes
///
/// Transport-level failures (connect, timeout) come back as retryable errors;
/// any response, whatever its status, is returned as `Ok`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ActionError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptOutcome {
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Script execution used by script nodes
#[async_trait]
pub trait ScriptSandbox: Send + Sync {
    async fn run(&self, source: &str, variables: &Map<String, Value>) -> ScriptOutcome;
}

/// Named integration invoked by connector_action nodes
#[async_trait]
pub trait Connector: Send + Sync {
    async fn invoke(&self, operation: &str, input: Value) -> Result<Value, ActionError>;
}

/// Bundle of collaborators handed to every action
#[derive(Clone)]
pub struct Collaborators {
    pub records: Arc<dyn RecordStore>,
    pub http: Arc<dyn HttpTransport>,
    pub scripts: Arc<dyn ScriptSandbox>,
    pub connectors: HashMap<String, Arc<dyn Connector>>,
}

impl Collaborators {
    pub fn with_records(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = records;
        self
    }

    pub fn with_http(mut self, http: Arc<dyn HttpTransport>) -> Self {
        self.http = http;
        self
    }

    pub fn with_scripts(mut self, scripts: Arc<dyn ScriptSandbox>) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn with_connector(mut self, name: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        self.connectors.insert(name.into(), connector);
        self
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            records: Arc::new(InMemoryRecordStore::default()),
            http: Arc::new(ReqwestTransport::default()),
            scripts: Arc::new(LuaSandbox),
            connectors: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("connectors", &self.connectors.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Process-local record store keyed by object then id
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    objects: RwLock<HashMap<String, HashMap<String, Value>>>,
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create(&self, object: &str, data: Value) -> Result<Value, ActionError> {
        let Value::Object(mut fields) = data else {
            return Err(ActionError::new("invalid_record", "record data must be an object"));
        };
        let id = match fields.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                fields.insert("id".into(), Value::String(id.clone()));
                id
            }
        };

        let record = Value::Object(fields);
        self.objects
            .write()
            .await
            .entry(object.to_string())
            .or_default()
            .insert(id, record.clone());
        Ok(record)
    }

    async fn update(&self, object: &str, id: &str, data: Value) -> Result<Value, ActionError> {
        let Value::Object(changes) = data else {
            return Err(ActionError::new("invalid_record", "record data must be an object"));
        };
        let mut objects = self.objects.write().await;
        let record = objects
            .get_mut(object)
            .and_then(|records| records.get_mut(id))
            .ok_or_else(|| ActionError::new("record_not_found", format!("{object}/{id} does not exist")))?;

        if let Value::Object(fields) = record {
            for (key, value) in changes {
                if key != "id" {
                    fields.insert(key, value);
                }
            }
        }
        Ok(record.clone())
    }

    async fn delete(&self, object: &str, id: &str) -> Result<bool, ActionError> {
        Ok(self
            .objects
            .write()
            .await
            .get_mut(object)
            .and_then(|records| records.remove(id))
            .is_some())
    }

    async fn get(&self, object: &str, id: &str) -> Result<Option<Value>, ActionError> {
        Ok(self
            .objects
            .read()
            .await
            .get(object)
            .and_then(|records| records.get(id))
            .cloned())
    }
}

/// HTTP transport over a shared reqwest client
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ActionError> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| ActionError::config(format!("invalid HTTP method '{}'", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout_ms) = request.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }

        let response = builder.send().await.map_err(|e| {
            let code = if e.is_timeout() { "http_timeout" } else { "http_transport_error" };
            ActionError::retryable(code, e.to_string())
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| ActionError::retryable("http_transport_error", e.to_string()))?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(HttpResponse { status, headers, body })
    }
}

/// Script sandbox on an embedded Lua state
///
/// Scripts run on the blocking pool so a long script never stalls the runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct LuaSandbox;

#[async_trait]
impl ScriptSandbox for LuaSandbox {
    async fn run(&self, source: &str, variables: &Map<String, Value>) -> ScriptOutcome {
        let source = source.to_string();
        let variables = variables.clone();
        let result = tokio::task::spawn_blocking(move || expression::run_script(&source, &variables)).await;

        match result {
            Ok(Ok(output)) => ScriptOutcome { output, error: None },
            Ok(Err(e)) => ScriptOutcome {
                output: Value::Null,
                error: Some(e.message),
            },
            Err(join) => ScriptOutcome {
                output: Value::Null,
                error: Some(format!("script task aborted: {join}")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn in_memory_records_round_trip() {
        let store = InMemoryRecordStore::default();
        let created = store.create("order", json!({ "amount": 10 })).await.unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let updated = store.update("order", &id, json!({ "amount": 20, "id": "ignored" })).await.unwrap();
        assert_eq!(updated["amount"], 20);
        assert_eq!(updated["id"], id.as_str());

        assert!(store.get("order", &id).await.unwrap().is_some());
        assert!(store.delete("order", &id).await.unwrap());
        assert!(!store.delete("order", &id).await.unwrap());

        let missing = store.update("order", &id, json!({})).await.unwrap_err();
        assert_eq!(missing.code, "record_not_found");
    }

    #[tokio::test]
    async fn lua_sandbox_reports_errors() {
        let mut variables = Map::new();
        variables.insert("n".into(), json!(4));

        let ok = LuaSandbox.run("return n * n", &variables).await;
        assert_eq!(ok.output, json!(16));
        assert!(ok.error.is_none());

        let failed = LuaSandbox.run("error('boom')", &variables).await;
        assert!(failed.error.unwrap().contains("boom"));
    }
}
