use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Settings;
use crate::error::ApiError;

/// The remote API's response envelope. Failures of any kind, including transport errors,
/// are reported through `error` and `message` rather than returned as `Err`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        ApiResponse {
            error: false,
            message: String::new(),
            body,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        ApiResponse {
            error: true,
            message: message.into(),
            body: Value::Null,
        }
    }

    pub fn into_body(self) -> Result<Value, String> {
        if self.error {
            Err(if self.message.is_empty() {
                "Error loading data".to_string()
            } else {
                self.message
            })
        } else {
            Ok(self.body)
        }
    }
}

/// The local file API's response envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub results: Vec<Value>,
    /// Set by list requests when more pages follow this one.
    #[serde(default)]
    pub next_page: Option<u32>,
}

impl LocalResponse {
    pub fn failure(reason: impl Into<String>) -> Self {
        LocalResponse {
            success: false,
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn into_results(self) -> Result<Vec<Value>, String> {
        if self.success {
            Ok(self.results)
        } else {
            Err(self.reason.unwrap_or_else(|| "Error loading data".to_string()))
        }
    }
}

/// Build `path?a=b&c=d`, percent-encoding each key and value.
pub fn with_query(path: &str, params: &[(String, String)]) -> String {
    if params.is_empty() {
        return path.to_string();
    }

    let query: Vec<String> = params
        .iter()
        .map(|(key, value)| format!("{}={}", urlencoding::encode(key), urlencoding::encode(value)))
        .collect();
    let separator = if path.contains('?') { '&' } else { '?' };
    format!("{path}{separator}{}", query.join("&"))
}

#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Request JSON from `path`, relative to the API's base URL.
    async fn get(&self, path: &str, params: &[(String, String)]) -> ApiResponse;

    /// Request an HTML page. The page text is returned as a string body.
    async fn get_html(&self, path: &str, params: &[(String, String)]) -> ApiResponse;
}

#[async_trait]
pub trait LocalApi: Send + Sync {
    async fn request(&self, path: &str, args: Value) -> LocalResponse;
}

fn build_client(settings: &Settings) -> Result<reqwest::Client, ApiError> {
    Ok(reqwest::Client::builder()
        .user_agent(settings.user_agent.clone())
        .build()?)
}

pub struct HttpApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpApiClient {
    pub fn new(settings: &Settings) -> Result<Self, ApiError> {
        Ok(HttpApiClient {
            client: build_client(settings)?,
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn try_get(&self, path: &str, params: &[(String, String)]) -> Result<ApiResponse, ApiError> {
        let url = format!("{}{}", self.base_url, with_query(path, params));
        let response = self.client.get(&url).send().await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn try_get_html(&self, path: &str, params: &[(String, String)]) -> Result<String, ApiError> {
        let url = format!("{}{}", self.base_url, with_query(path, params));
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::Api(format!("{url} returned {}", response.status())));
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn get(&self, path: &str, params: &[(String, String)]) -> ApiResponse {
        match self.try_get(path, params).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Request to {path} failed: {e}");
                ApiResponse::failure(e.to_string())
            }
        }
    }

    async fn get_html(&self, path: &str, params: &[(String, String)]) -> ApiResponse {
        match self.try_get_html(path, params).await {
            Ok(html) => ApiResponse::ok(Value::String(html)),
            Err(e) => {
                log::warn!("Request for {path} failed: {e}");
                ApiResponse::failure(e.to_string())
            }
        }
    }
}

/// Talks to a local file server, which takes JSON arguments by POST.
pub struct HttpLocalApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLocalApi {
    pub fn new(settings: &Settings, base_url: &str) -> Result<Self, ApiError> {
        Ok(HttpLocalApi {
            client: build_client(settings)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn try_request(&self, path: &str, args: &Value) -> Result<LocalResponse, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(args).send().await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl LocalApi for HttpLocalApi {
    async fn request(&self, path: &str, args: Value) -> LocalResponse {
        match self.try_request(path, &args).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Local API request to {path} failed: {e}");
                LocalResponse::failure(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_parsing() {
        let ok: ApiResponse = serde_json::from_value(json!({"error": false, "body": {"a": 1}})).unwrap();
        assert_eq!(ok.into_body().unwrap(), json!({"a": 1}));

        let err: ApiResponse =
            serde_json::from_value(json!({"error": true, "message": "Work has been deleted"})).unwrap();
        assert_eq!(err.into_body().unwrap_err(), "Work has been deleted");

        let local: LocalResponse = serde_json::from_value(json!({"success": false})).unwrap();
        assert_eq!(local.into_results().unwrap_err(), "Error loading data");
    }

    #[test]
    fn test_with_query_encodes() {
        let params = vec![
            ("ids[]".to_string(), "1".to_string()),
            ("word".to_string(), "a b".to_string()),
        ];
        assert_eq!(with_query("/x", &params), "/x?ids%5B%5D=1&word=a%20b");
        assert_eq!(with_query("/x?p=1", &params[..1]), "/x?p=1&ids%5B%5D=1");
        assert_eq!(with_query("/x", &[]), "/x");
    }
}
