//! The HTTP activity runner.

use super::{
    resolve_authentication, resolve_endpoint, resolve_secret_value, value_as_string,
    ActivityContext, ActivityRunner,
};
use crate::error::WorkflowError;
use async_trait::async_trait;
use base64::Engine as _;
use serde_json::Value;

/// Supported request methods; the DSL call shape allows exactly these.
const METHODS: &[&str] = &["get", "post", "put", "delete"];

#[derive(Debug)]
pub struct HttpRunner {
    client: reqwest::Client,
}

impl Default for HttpRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRunner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ActivityRunner for HttpRunner {
    async fn execute(&self, context: ActivityContext) -> Result<Value, WorkflowError> {
        let arguments = context.arguments.as_object().ok_or_else(|| {
            WorkflowError::configuration("HTTP call has no arguments")
                .with_details("the 'with' block is required for call: http")
        })?;

        let method = arguments
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("get")
            .to_lowercase();
        if !METHODS.contains(&method.as_str()) {
            return Err(WorkflowError::configuration("Unsupported HTTP method")
                .with_details(format!("'{method}' is not one of GET/POST/PUT/DELETE")));
        }

        let endpoint_value = arguments.get("endpoint").ok_or_else(|| {
            WorkflowError::configuration("HTTP call has no endpoint")
        })?;
        let (uri, endpoint_auth) = resolve_endpoint(endpoint_value, &context.input)?;

        let output_mode = arguments
            .get("output")
            .and_then(Value::as_str)
            .unwrap_or("content");
        let follow_redirects = arguments
            .get("redirect")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let client = if follow_redirects {
            self.client.clone()
        } else {
            reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .map_err(|e| {
                    WorkflowError::runtime("Failed to build HTTP client")
                        .with_details(e.to_string())
                })?
        };

        let mut request = match method.as_str() {
            "post" => client.post(&uri),
            "put" => client.put(&uri),
            "delete" => client.delete(&uri),
            _ => client.get(&uri),
        };

        if let Some(Value::Object(headers)) = arguments.get("headers") {
            for (name, value) in headers {
                request = request.header(name.as_str(), value_as_string(value));
            }
        }
        if let Some(Value::Object(query)) = arguments.get("query") {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(name, value)| (name.clone(), value_as_string(value)))
                .collect();
            request = request.query(&pairs);
        }
        if let Some(body) = arguments.get("body") {
            if matches!(method.as_str(), "post" | "put") {
                request = request.json(body);
            }
        }

        if let Some(policy) = endpoint_auth {
            let policy = resolve_authentication(&policy, &context.workflow)?;
            if let Some(basic) = &policy.basic {
                let username = value_as_string(&resolve_secret_value(&basic.username, &context)?);
                let password = value_as_string(&resolve_secret_value(&basic.password, &context)?);
                request = request.basic_auth(username, Some(password));
            } else if let Some(bearer) = &policy.bearer {
                let token = value_as_string(&resolve_secret_value(&bearer.token, &context)?);
                request = request.bearer_auth(token);
            }
        }

        tracing::debug!(%uri, method, "dispatching http call");
        let response = request.send().await.map_err(|e| {
            WorkflowError::communication("HTTP request failed")
                .with_details(format!("{} {uri}: {e}", method.to_uppercase()))
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| {
            WorkflowError::communication("Failed to read HTTP response body")
                .with_details(e.to_string())
        })?;

        if !status.is_success() && (follow_redirects || !status.is_redirection()) {
            return Err(WorkflowError::communication(format!(
                "HTTP {} error",
                status.as_u16()
            ))
            .with_status(status.as_u16())
            .with_details(format!(
                "{} {uri} returned status {status}",
                method.to_uppercase()
            )));
        }

        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let content = if content_type.contains("application/json") {
            serde_json::from_slice(&body)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
        } else {
            Value::String(String::from_utf8_lossy(&body).into_owned())
        };

        let result = match output_mode {
            "raw" => Value::String(base64::engine::general_purpose::STANDARD.encode(&body)),
            "response" => {
                let header_map: serde_json::Map<String, Value> = headers
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.to_string(),
                            Value::String(value.to_str().unwrap_or("").to_string()),
                        )
                    })
                    .collect();
                serde_json::json!({
                    "request": {"method": method.to_uppercase(), "uri": uri},
                    "statusCode": status.as_u16(),
                    "headers": header_map,
                    "content": content,
                })
            }
            _ => content,
        };
        Ok(result)
    }
}
