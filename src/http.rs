use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// A simple structure to represent an HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: String, // "GET", "POST", "PUT" or "DELETE"
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    fn new(method: &str, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new("POST", url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new("PUT", url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new("DELETE", url)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Trait for executing HTTP requests in a runtime-agnostic way.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Executes a given HTTP request and returns the buffered response.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// HTTP client implementation using `ureq` for synchronous HTTP requests.
/// Since `ureq` is blocking, requests are wrapped in
/// `tokio::task::spawn_blocking`.
#[derive(Debug, Clone)]
pub struct UreqHttpClient {
    agent: ureq::Agent,
}

impl UreqHttpClient {
    pub fn new(request_timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(request_timeout))
            .build()
            .into();
        Self { agent }
    }
}

impl Default for UreqHttpClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

fn run_request(agent: &ureq::Agent, request: HttpRequest) -> Result<HttpResponse> {
    let response = match request.method.as_str() {
        "GET" => {
            let mut req = agent.get(&request.url);
            for (key, value) in &request.headers {
                req = req.header(key, value);
            }
            req.call()?
        }
        "DELETE" => {
            let mut req = agent.delete(&request.url);
            for (key, value) in &request.headers {
                req = req.header(key, value);
            }
            req.call()?
        }
        "POST" => {
            let mut req = agent.post(&request.url);
            for (key, value) in &request.headers {
                req = req.header(key, value);
            }
            if let Some(body) = request.body {
                req.send(&body[..])?
            } else {
                req.send(&[])?
            }
        }
        "PUT" => {
            let mut req = agent.put(&request.url);
            for (key, value) in &request.headers {
                req = req.header(key, value);
            }
            if let Some(body) = request.body {
                req.send(&body[..])?
            } else {
                req.send(&[])?
            }
        }
        method => {
            return Err(anyhow::anyhow!("Unsupported HTTP method: {}", method));
        }
    };

    let status_code = response.status().as_u16();
    let mut body = response.into_body();
    let body_bytes = body.read_to_vec()?;

    Ok(HttpResponse {
        status_code,
        body: body_bytes,
    })
}

#[async_trait]
impl HttpClient for UreqHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        // Since ureq is blocking, we must use spawn_blocking
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || run_request(&agent, request)).await?
    }
}
