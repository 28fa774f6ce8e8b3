/// Session management.
///
/// Owns the authentication context of a client and hands out scoped session
/// tokens. A `Session` is released when it goes out of scope, on success
/// and failure paths alike; releasing is best-effort because the gateway
/// expires idle sessions on its own.
use crate::config::ConnectionConfig;
use crate::error::{ShimError, ShimResult};
use crate::query::{Query, SaveFormat};
use crate::transport::{Endpoint, Gateway, Reply, Request, Transport};
use tracing::{debug, info, warn};

/// Session opening is retried this many extra times before giving up.
const SESSION_OPEN_RETRIES: u32 = 1;

/// Proof of a successful login, bound to one gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Gateway-issued token; `None` for anonymous plain-HTTP access.
    pub token: Option<String>,
}

pub struct SessionManager {
    connection: ConnectionConfig,
    auth: Option<AuthContext>,
}

impl SessionManager {
    pub fn new(connection: ConnectionConfig) -> SessionManager {
        SessionManager {
            connection,
            auth: None,
        }
    }

    pub fn auth_context(&self) -> Option<&AuthContext> {
        self.auth.as_ref()
    }

    /// Log in unless already logged in.
    ///
    /// Over TLS the gateway exchanges the credentials for a token. Plain
    /// HTTP gateways take no credentials, so the context is recorded without
    /// a round trip.
    pub fn ensure_authenticated<G: Gateway>(&mut self, transport: &Transport<G>) -> ShimResult<()> {
        if self.auth.is_some() {
            return Ok(());
        }

        let tls = self.connection.is_tls();
        let token = if tls {
            let reply = transport.execute(
                &Request::new(Endpoint::Login)
                    .param("username", &self.connection.user)
                    .param("password", &self.connection.password),
            )?;
            let token = reply.text();
            if !reply.is_success() || token.is_empty() {
                return Err(ShimError::Authentication {
                    host: self.connection.base_url(),
                    reason: format!("login returned status {}: {}", reply.status, token),
                });
            }
            Some(token)
        } else {
            None
        };

        info!(host = %self.connection.host, port = self.connection.port, tls, "Authenticated with gateway");
        self.auth = Some(AuthContext {
            host: self.connection.host.clone(),
            port: self.connection.port,
            tls,
            token,
        });
        Ok(())
    }

    /// Acquire a fresh session token; released when the returned guard drops.
    pub fn open<'t, G: Gateway>(&self, transport: &'t Transport<G>) -> ShimResult<Session<'t, G>> {
        let auth = self
            .auth
            .as_ref()
            .ok_or_else(|| ShimError::Session("cannot open a session before login".to_string()))?;

        let mut retries = 0;
        loop {
            match Session::open(transport, auth.token.clone()) {
                Err(ShimError::Session(reason)) if retries < SESSION_OPEN_RETRIES => {
                    retries += 1;
                    warn!(reason = %reason, "Opening session failed, retrying");
                }
                other => return other,
            }
        }
    }

    /// Drop the authentication context, telling the gateway when it issued a token.
    pub fn logout<G: Gateway>(&mut self, transport: &Transport<G>) -> ShimResult<()> {
        let auth = match self.auth.take() {
            Some(auth) => auth,
            None => return Ok(()),
        };
        if let Some(token) = auth.token {
            let reply = transport.execute(&Request::new(Endpoint::Logout).param("auth", token))?;
            if !reply.is_success() {
                warn!(status = reply.status, "Logout was not acknowledged");
            }
        }
        debug!(host = %auth.host, "Logged out");
        Ok(())
    }
}

/// What a query produced, according to its save format.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done,
    Lines(Vec<String>),
    Bytes(Vec<u8>),
}

/// A live gateway session, released on drop.
pub struct Session<'t, G: Gateway> {
    id: u64,
    auth: Option<String>,
    transport: &'t Transport<G>,
    open: bool,
}

impl<'t, G: Gateway> Session<'t, G> {
    fn open(transport: &'t Transport<G>, auth: Option<String>) -> ShimResult<Session<'t, G>> {
        let mut request = Request::new(Endpoint::NewSession);
        if let Some(token) = &auth {
            request = request.param("auth", token);
        }
        let reply = transport.execute(&request)?;
        if !reply.is_success() {
            return Err(ShimError::Session(format!(
                "new_session returned status {}: {}",
                reply.status,
                reply.text()
            )));
        }
        let text = reply.text();
        let id = text
            .parse::<u64>()
            .map_err(|_| ShimError::Session(format!("unparsable session token '{}'", text)))?;

        debug!(session = id, "Session opened");
        Ok(Session {
            id,
            auth,
            transport,
            open: true,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// A request for `endpoint` carrying this session's id and auth token.
    fn request<'a>(&self, endpoint: Endpoint) -> Request<'a> {
        let mut request = Request::new(endpoint).param("id", self.id);
        if let Some(token) = &self.auth {
            request = request.param("auth", token);
        }
        request
    }

    fn expect_success(&self, endpoint: Endpoint, reply: &Reply) -> ShimResult<()> {
        if reply.is_success() {
            return Ok(());
        }
        Err(ShimError::Protocol {
            endpoint: endpoint.path(),
            message: format!("status {}: {}", reply.status, reply.text()),
        })
    }

    /// Execute `query` without reading its result.
    pub fn execute(&self, query: &Query) -> ShimResult<()> {
        let mut request = self.request(Endpoint::ExecuteQuery).param("query", &query.text);
        if let Some(save) = &query.save {
            request = request.param("save", save.as_param());
        }
        let reply = self.transport.execute(&request)?;
        if !reply.is_success() {
            return Err(ShimError::Query {
                query: query.text.clone(),
                status: reply.status,
                message: reply.text(),
            });
        }
        Ok(())
    }

    /// Execute `query` and read its result from the endpoint its save format selects.
    pub fn run(&self, query: &Query) -> ShimResult<Outcome> {
        self.execute(query)?;
        match &query.save {
            None => Ok(Outcome::Done),
            Some(SaveFormat::Csv) => self.read_lines().map(Outcome::Lines),
            Some(SaveFormat::Binary(_)) => self.read_bytes().map(Outcome::Bytes),
        }
    }

    /// Text result of the last query, one entry per non-empty line.
    pub fn read_lines(&self) -> ShimResult<Vec<String>> {
        let reply = self
            .transport
            .execute(&self.request(Endpoint::ReadLines).param("n", 0))?;
        self.expect_success(Endpoint::ReadLines, &reply)?;
        Ok(String::from_utf8_lossy(&reply.body)
            .lines()
            .map(|l| l.trim_end_matches('\r').to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Binary result of the last query.
    pub fn read_bytes(&self) -> ShimResult<Vec<u8>> {
        let reply = self
            .transport
            .execute(&self.request(Endpoint::ReadBytes).param("n", 0))?;
        self.expect_success(Endpoint::ReadBytes, &reply)?;
        Ok(reply.body)
    }

    /// Upload `payload` and return the server-side path it was stored at.
    pub fn upload(&self, payload: &[u8]) -> ShimResult<String> {
        let reply = self
            .transport
            .execute(&self.request(Endpoint::UploadFile).payload(payload))?;
        self.expect_success(Endpoint::UploadFile, &reply)?;
        let path = reply.text();
        if path.is_empty() {
            return Err(ShimError::Protocol {
                endpoint: Endpoint::UploadFile.path(),
                message: "gateway returned no file path".to_string(),
            });
        }
        Ok(path)
    }

    /// Release the token now. Failures are logged, never returned.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        match self.transport.execute(&self.request(Endpoint::ReleaseSession)) {
            Ok(reply) if reply.is_success() => debug!(session = self.id, "Session released"),
            Ok(reply) => warn!(session = self.id, status = reply.status, "Gateway refused to release session"),
            Err(e) => warn!(session = self.id, error = %e, "Failed to release session"),
        }
    }
}

impl<'t, G: Gateway> Drop for Session<'t, G> {
    fn drop(&mut self) {
        self.release();
    }
}
