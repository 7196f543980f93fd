//! Warehouse connections and the retry envelope around every remote operation.
//!
//! [`Connector`] and [`Connection`] are the seam between the transfer engine and
//! the warehouse. [`ClickHouseConnector`] speaks the ClickHouse HTTP interface;
//! tests plug in their own implementation.

use std::time::Duration;

use log::debug;
use reqwest::{
    StatusCode,
    blocking::{Client, RequestBuilder},
};

use crate::{
    error::{TransferError, WarehouseError},
    retry::{Attempted, CancelToken, RetryError, RetryPolicy, retry},
};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8123;
pub const DEFAULT_DATABASE: &str = "default";
pub const DEFAULT_USER: &str = "default";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where and as whom to connect. Immutable; clone it to share between transfers.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub token: String,
    pub secure: bool,
    pub timeout: Duration,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            database: DEFAULT_DATABASE.to_string(),
            user: DEFAULT_USER.to_string(),
            token: String::new(),
            secure: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("token", &"<redacted>")
            .field("secure", &self.secure)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ConnectionParams {
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// One open warehouse session. Dropping it releases the session.
pub trait Connection {
    /// Runs a statement that returns no rows.
    fn execute(&mut self, statement: &str) -> Result<(), WarehouseError>;
    /// Runs an `INSERT ... FORMAT <fmt>` statement with `payload` as its data.
    fn insert(&mut self, statement: &str, payload: &str) -> Result<(), WarehouseError>;
    /// Runs a query and returns the raw response body.
    fn query(&mut self, statement: &str) -> Result<String, WarehouseError>;
}

pub trait Connector {
    type Conn: Connection;

    fn connect(&self) -> Result<Self::Conn, WarehouseError>;
}

#[derive(Debug, Clone)]
pub struct ClickHouseConnector {
    params: ConnectionParams,
}

impl ClickHouseConnector {
    pub fn new(params: ConnectionParams) -> Self {
        Self { params }
    }
}

impl Connector for ClickHouseConnector {
    type Conn = ClickHouseConnection;

    fn connect(&self) -> Result<ClickHouseConnection, WarehouseError> {
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .timeout(self.params.timeout)
            .build()
            .map_err(|err| WarehouseError::Connect(err.to_string()))?;
        let url = format!("{}/ping", self.params.base_url());
        let response = client
            .get(&url)
            .send()
            .map_err(|err| WarehouseError::Connect(format!("{url}: {err}")))?;
        if !response.status().is_success() {
            return Err(WarehouseError::Connect(format!(
                "{url} answered {}",
                response.status()
            )));
        }
        debug!("Connected to {}", self.params.base_url());
        Ok(ClickHouseConnection {
            client,
            params: self.params.clone(),
        })
    }
}

pub struct ClickHouseConnection {
    client: Client,
    params: ConnectionParams,
}

impl ClickHouseConnection {
    fn request(&self) -> RequestBuilder {
        self.client
            .post(format!("{}/", self.params.base_url()))
            .query(&[("database", self.params.database.as_str())])
            .header("X-ClickHouse-User", &self.params.user)
            .header("X-ClickHouse-Key", &self.params.token)
    }

    fn send(&self, request: RequestBuilder) -> Result<String, WarehouseError> {
        let response = request
            .send()
            .map_err(|err| WarehouseError::Connect(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|err| WarehouseError::Connect(err.to_string()))?;
        match status {
            s if s.is_success() => Ok(body),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(WarehouseError::Connect(
                format!("authentication failed ({status}): {}", body.trim()),
            )),
            _ => Err(WarehouseError::Operation(format!(
                "{status}: {}",
                body.trim()
            ))),
        }
    }
}

impl Connection for ClickHouseConnection {
    fn execute(&mut self, statement: &str) -> Result<(), WarehouseError> {
        self.send(self.request().body(statement.to_string()))
            .map(|_| ())
    }

    fn insert(&mut self, statement: &str, payload: &str) -> Result<(), WarehouseError> {
        let request = self
            .request()
            .query(&[
                ("query", statement),
                ("date_time_input_format", "best_effort"),
            ])
            .body(payload.to_string());
        self.send(request).map(|_| ())
    }

    fn query(&mut self, statement: &str) -> Result<String, WarehouseError> {
        self.send(self.request().body(statement.to_string()))
    }
}

impl From<RetryError> for TransferError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Cancelled => TransferError::Cancelled,
            RetryError::Exhausted {
                attempts,
                last: source @ WarehouseError::Connect(_),
            } => TransferError::Connection { attempts, source },
            RetryError::Exhausted { attempts, last } => TransferError::Operation {
                attempts,
                source: last,
            },
        }
    }
}

/// Wraps a [`Connector`] so every operation gets a fresh connection per
/// attempt under one [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct ConnectionGateway<C> {
    connector: C,
    policy: RetryPolicy,
    cancel: CancelToken,
}

impl<C: Connector> ConnectionGateway<C> {
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Runs `op` on a fresh connection, retrying on failure. The connection
    /// is dropped at the end of each attempt whatever the outcome.
    pub fn with_retry<T, F>(&self, label: &str, mut op: F) -> Result<Attempted<T>, RetryError>
    where
        F: FnMut(&mut C::Conn) -> Result<T, WarehouseError>,
    {
        retry(&self.policy, &self.cancel, label, |attempt| {
            debug!("{label}: attempt {attempt}");
            let mut connection = self.connector.connect()?;
            op(&mut connection)
        })
    }

    /// [`with_retry`](Self::with_retry) with exhaustion mapped onto [`TransferError`].
    pub fn run<T, F>(&self, label: &str, op: F) -> Result<T, TransferError>
    where
        F: FnMut(&mut C::Conn) -> Result<T, WarehouseError>,
    {
        self.with_retry(label, op)
            .map(|attempted| attempted.value)
            .map_err(TransferError::from)
    }
}
