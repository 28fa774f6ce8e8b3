/// Transport layer.
///
/// A single reusable HTTP handle plus the bounded-retry loop around it. This
/// module knows the gateway's endpoint paths but nothing about sessions or
/// queries; callers interpret non-success statuses themselves.
use crate::config::ClientConfig;
use crate::error::{ShimError, ShimResult};
use reqwest::blocking::{multipart, Client};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Login,
    Logout,
    NewSession,
    ReleaseSession,
    ExecuteQuery,
    ReadLines,
    ReadBytes,
    UploadFile,
    Version,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Login => "/login",
            Endpoint::Logout => "/logout",
            Endpoint::NewSession => "/new_session",
            Endpoint::ReleaseSession => "/release_session",
            Endpoint::ExecuteQuery => "/execute_query",
            Endpoint::ReadLines => "/read_lines",
            Endpoint::ReadBytes => "/read_bytes",
            Endpoint::UploadFile => "/upload_file",
            Endpoint::Version => "/version",
        }
    }
}

/// One request/response exchange with the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct Request<'a> {
    pub endpoint: Endpoint,
    pub params: Vec<(&'static str, String)>,
    /// Uploaded as a multipart `file` part when present.
    pub payload: Option<&'a [u8]>,
}

impl<'a> Request<'a> {
    pub fn new(endpoint: Endpoint) -> Request<'a> {
        Request {
            endpoint,
            params: Vec::new(),
            payload: None,
        }
    }

    pub fn param<V: ToString>(mut self, key: &'static str, value: V) -> Request<'a> {
        self.params.push((key, value.to_string()));
        self
    }

    pub fn payload(mut self, payload: &'a [u8]) -> Request<'a> {
        self.payload = Some(payload);
        self
    }

    /// Value of the first parameter named `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).trim().to_string()
    }
}

/// Why a single attempt failed before any status was received.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Connection reset, refused, timed out or interrupted. Worth retrying.
    Transient(String),
    /// The request itself is broken. Retrying cannot help.
    Fatal(String),
}

/// The wire seam: something that can carry one request to the gateway.
pub trait Gateway {
    fn send(&self, request: &Request<'_>) -> Result<Reply, Fault>;

    /// Human-readable identity of the remote end, used in errors.
    fn host(&self) -> String;
}

/// Production gateway backed by a blocking reqwest client.
pub struct HttpGateway {
    client: Client,
    base_url: String,
}

impl HttpGateway {
    /// Build the HTTP handle described by `config`.
    ///
    /// # Arguments
    ///
    /// * `config` - Connection identity plus timeout and certificate policy
    ///
    pub fn new(config: &ClientConfig) -> ShimResult<HttpGateway> {
        let client = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| ShimError::Transport {
                endpoint: "(client)",
                attempts: 0,
                reason: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(HttpGateway {
            client,
            base_url: config.connection.base_url(),
        })
    }

    fn classify(e: reqwest::Error) -> Fault {
        if e.is_timeout() || e.is_connect() || e.is_body() || e.is_request() {
            Fault::Transient(e.to_string())
        } else {
            Fault::Fatal(e.to_string())
        }
    }
}

impl Gateway for HttpGateway {
    fn send(&self, request: &Request<'_>) -> Result<Reply, Fault> {
        let url = format!("{}{}", self.base_url, request.endpoint.path());
        let builder = match request.payload {
            Some(payload) => {
                let part = multipart::Part::bytes(payload.to_vec()).file_name("upload.bin");
                self.client
                    .post(&url)
                    .query(&request.params)
                    .multipart(multipart::Form::new().part("file", part))
            }
            None => self.client.get(&url).query(&request.params),
        };

        let response = builder.send().map_err(HttpGateway::classify)?;
        let status = response.status().as_u16();
        let body = response.bytes().map_err(HttpGateway::classify)?;
        Ok(Reply {
            status,
            body: body.to_vec(),
        })
    }

    fn host(&self) -> String {
        self.base_url.clone()
    }
}

/// Bounded-retry request execution over a `Gateway`.
pub struct Transport<G: Gateway> {
    gateway: G,
    attempts: u32,
    backoff: Duration,
}

impl<G: Gateway> Transport<G> {
    /// # Arguments
    ///
    /// * `gateway` - The wire backend
    /// * `attempts` - Total attempts per request (at least one is always made)
    /// * `backoff` - Pause before retry `n`, multiplied by `n`
    ///
    pub fn new(gateway: G, attempts: u32, backoff: Duration) -> Transport<G> {
        Transport {
            gateway,
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Send `request`, retrying transient failures up to the attempt budget.
    ///
    /// 401 and 403 replies are authentication failures and come back as
    /// `ShimError::Authentication` without a retry. Every other status is
    /// handed to the caller.
    pub fn execute(&self, request: &Request<'_>) -> ShimResult<Reply> {
        let endpoint = request.endpoint.path();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.gateway.send(request) {
                Ok(reply) => {
                    if reply.status == 401 || reply.status == 403 {
                        return Err(ShimError::Authentication {
                            host: self.gateway.host(),
                            reason: reply.text(),
                        });
                    }
                    debug!(endpoint, status = reply.status, bytes = reply.body.len(), "Gateway replied");
                    return Ok(reply);
                }
                Err(Fault::Fatal(reason)) => {
                    return Err(ShimError::Transport {
                        endpoint,
                        attempts: attempt,
                        reason,
                    });
                }
                Err(Fault::Transient(reason)) => {
                    if attempt >= self.attempts {
                        return Err(ShimError::Transport {
                            endpoint,
                            attempts: attempt,
                            reason,
                        });
                    }
                    warn!(endpoint, attempt, reason = %reason, "Transient transport failure, retrying");
                    if !self.backoff.is_zero() {
                        thread::sleep(self.backoff * attempt);
                    }
                }
            }
        }
    }

    /// Ask the gateway for its version. Touches no session state.
    pub fn test_connection(&self) -> ShimResult<String> {
        let reply = self.execute(&Request::new(Endpoint::Version))?;
        if !reply.is_success() {
            return Err(ShimError::Protocol {
                endpoint: Endpoint::Version.path(),
                message: format!("status {}: {}", reply.status, reply.text()),
            });
        }
        Ok(reply.text())
    }
}
