//! PostgreSQL connection owned by a session.
//!
//! Each connection is opened with the caller's credentials and driven by a
//! dedicated tokio task; closing the connection aborts that task, which
//! drops the socket.

use std::str::FromStr;
use std::time::Duration;

use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio::task::JoinHandle;
use tokio_postgres::{CancelToken, Client, Config, NoTls};
use tracing::{debug, info, instrument, warn};

use crate::error::ServerError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PgSslMode {
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl FromStr for PgSslMode {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "disable" => Ok(Self::Disable),
            "prefer" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            "verify-ca" => Ok(Self::VerifyCa),
            "verify-full" => Ok(Self::VerifyFull),
            _ => Err(()),
        }
    }
}

/// Caller-supplied connection parameters (the `/connect` query string).
#[derive(Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: Option<String>,
}

impl std::fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("dbname", &self.dbname)
            .finish()
    }
}

/// Process-wide connection settings taken from [`ServerConfig`](crate::config::ServerConfig).
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    pub ssl_mode: PgSslMode,
    pub connect_timeout: Duration,
}

#[derive(Clone)]
enum PgTls {
    None,
    Native(MakeTlsConnector),
}

impl std::fmt::Debug for PgTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PgTls::None => write!(f, "PgTls::None"),
            PgTls::Native(_) => write!(f, "PgTls::Native(..)"),
        }
    }
}

/// Sends a PostgreSQL cancel request for whatever the connection is running.
#[derive(Clone)]
pub struct QueryCanceller {
    token: CancelToken,
    tls: PgTls,
}

impl QueryCanceller {
    pub async fn cancel(self) {
        let result = match self.tls {
            PgTls::None => self.token.cancel_query(NoTls).await,
            PgTls::Native(tls) => self.token.cancel_query(tls).await,
        };
        if let Err(err) = result {
            warn!(error = %err, "failed to send cancel request");
        }
    }
}

pub struct PgConnection {
    client: Client,
    tls: PgTls,
    driver: JoinHandle<()>,
}

impl PgConnection {
    #[instrument(skip(params, options), fields(host = %params.host, port = params.port, user = %params.user))]
    pub async fn connect(
        params: &ConnectParams,
        options: &ConnectOptions,
    ) -> Result<Self, ServerError> {
        let mut config = Config::new();
        config
            .host(&params.host)
            .port(params.port)
            .user(&params.user)
            .application_name("swangate")
            .connect_timeout(options.connect_timeout);
        if let Some(password) = params.password.as_deref() {
            config.password(password);
        }
        if let Some(dbname) = params.dbname.as_deref() {
            config.dbname(dbname);
        }

        let connection = match options.ssl_mode {
            PgSslMode::Disable => Self::connect_without_tls(&config).await?,
            PgSslMode::Prefer => {
                let connector = build_tls_connector(options.ssl_mode)?;
                match Self::connect_with_tls(&config, connector).await {
                    Ok(connection) => connection,
                    Err(err) => {
                        warn!(
                            error = %err,
                            "TLS connection failed in prefer mode, retrying without TLS"
                        );
                        Self::connect_without_tls(&config).await?
                    }
                }
            }
            PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => {
                let connector = build_tls_connector(options.ssl_mode)?;
                Self::connect_with_tls(&config, connector).await?
            }
        };

        info!(tls = ?connection.tls, "opened database connection");
        Ok(connection)
    }

    async fn connect_without_tls(config: &Config) -> Result<Self, ServerError> {
        debug!("connecting to PostgreSQL without TLS");
        let (client, connection) = config.connect(NoTls).await?;
        Ok(Self {
            client,
            tls: PgTls::None,
            driver: spawn_connection(connection),
        })
    }

    async fn connect_with_tls(
        config: &Config,
        connector: MakeTlsConnector,
    ) -> Result<Self, ServerError> {
        debug!("connecting to PostgreSQL with TLS");
        let (client, connection) = config.connect(connector.clone()).await?;
        Ok(Self {
            client,
            tls: PgTls::Native(connector),
            driver: spawn_connection(connection),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn canceller(&self) -> QueryCanceller {
        QueryCanceller {
            token: self.client.cancel_token(),
            tls: self.tls.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// Drop the socket. Requests still holding the connection fail with a
    /// closed-connection error from the driver.
    pub fn close(&self) {
        self.driver.abort();
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

fn spawn_connection<T>(connection: T) -> JoinHandle<()>
where
    T: std::future::Future<Output = Result<(), tokio_postgres::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "PostgreSQL connection error");
        }
    })
}

fn build_tls_connector(mode: PgSslMode) -> Result<MakeTlsConnector, ServerError> {
    let mut builder = TlsConnector::builder();
    match mode {
        PgSslMode::Prefer | PgSslMode::Require => {
            builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        PgSslMode::VerifyCa => {
            builder.danger_accept_invalid_hostnames(true);
        }
        PgSslMode::VerifyFull => {}
        PgSslMode::Disable => {
            return Err(ServerError::Internal(
                "ssl mode disable should not build a TLS connector".to_string(),
            ))
        }
    }
    let connector = builder
        .build()
        .map_err(|err| ServerError::Internal(format!("failed to build TLS connector: {err}")))?;
    Ok(MakeTlsConnector::new(connector))
}
