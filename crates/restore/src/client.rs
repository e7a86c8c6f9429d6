//! The database client seam. Workers talk to the server through
//! [`DbConnection`]; production uses `mysql_async`, tests substitute a fake
//! recording statement order (see `crate::testing`).

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use url::Url;

use crate::errors::ClientError;

/// One worker-owned session. Each worker holds its connection for its
/// lifetime; `reset` tears the session down and builds a fresh one, which is
/// what invalidates a stale metadata view after cross-connection DDL.
#[async_trait]
pub trait DbConnection: Send {
    async fn execute(&mut self, sql: &str) -> Result<u64, ClientError>;
    async fn reset(&mut self) -> Result<(), ClientError>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DbConnection>, ClientError>;
}

/// Session initialization run on every new connection. READ COMMITTED is a
/// correctness requirement: under snapshot defaults a session may not observe
/// DDL committed by another connection after its own snapshot began.
const SESSION_INIT: &[&str] = &[
    "SET SESSION TRANSACTION ISOLATION LEVEL READ COMMITTED",
    "SET SESSION foreign_key_checks=0",
    "SET SESSION unique_checks=0",
    "SET SESSION sql_mode='NO_AUTO_VALUE_ON_ZERO'",
];

pub struct MySqlConnectionFactory {
    opts: mysql_async::Opts,
}

impl MySqlConnectionFactory {
    pub fn new(url: &Url) -> anyhow::Result<Self> {
        let opts = mysql_async::Opts::from_url(url.as_str())?;
        Ok(Self { opts })
    }
}

#[async_trait]
impl ConnectionFactory for MySqlConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn DbConnection>, ClientError> {
        let conn = new_session(&self.opts).await?;
        Ok(Box::new(MySqlDbConnection {
            conn,
            opts: self.opts.clone(),
        }))
    }
}

async fn new_session(opts: &mysql_async::Opts) -> Result<mysql_async::Conn, ClientError> {
    let mut conn = mysql_async::Conn::new(opts.clone()).await?;
    for statement in SESSION_INIT {
        conn.query_drop(*statement).await?;
    }
    Ok(conn)
}

struct MySqlDbConnection {
    conn: mysql_async::Conn,
    opts: mysql_async::Opts,
}

#[async_trait]
impl DbConnection for MySqlDbConnection {
    async fn execute(&mut self, sql: &str) -> Result<u64, ClientError> {
        let result = self.conn.query_iter(sql).await?;
        let affected = result.affected_rows();
        result.drop_result().await?;
        Ok(affected)
    }

    async fn reset(&mut self) -> Result<(), ClientError> {
        let fresh = new_session(&self.opts).await?;
        let stale = std::mem::replace(&mut self.conn, fresh);
        // Best effort: the stale session may already be gone.
        _ = stale.disconnect().await;
        Ok(())
    }
}

/// Lazily establish a worker's session. Workers connect on first use so that
/// a server that is briefly unreachable at startup fails individual jobs
/// (which carry their own retry budgets) instead of wedging a whole pool.
pub async fn ensure_session<'a>(
    slot: &'a mut Option<WorkerSession>,
    factory: &dyn ConnectionFactory,
) -> Result<&'a mut WorkerSession, ClientError> {
    match slot {
        Some(session) => Ok(session),
        None => {
            let session = WorkerSession::connect(factory).await?;
            Ok(slot.insert(session))
        },
    }
}

/// A worker's session: the connection plus the default database currently
/// selected on it. Workers serve jobs for many databases over their lifetime,
/// so the `USE` is re-issued whenever the target changes and forgotten on
/// reconnect.
pub struct WorkerSession {
    conn: Box<dyn DbConnection>,
    current_database: Option<String>,
}

impl WorkerSession {
    pub async fn connect(factory: &dyn ConnectionFactory) -> Result<Self, ClientError> {
        Ok(Self {
            conn: factory.connect().await?,
            current_database: None,
        })
    }

    pub async fn execute(&mut self, sql: &str) -> Result<u64, ClientError> {
        self.conn.execute(sql).await
    }

    pub async fn use_database(&mut self, database: &str) -> Result<(), ClientError> {
        if self.current_database.as_deref() == Some(database) {
            return Ok(());
        }
        self.conn
            .execute(&format!("USE `{database}`"))
            .await?;
        self.current_database = Some(database.to_owned());
        Ok(())
    }

    /// Tear down and rebuild the session to drop any stale metadata view.
    pub async fn reset(&mut self) -> Result<(), ClientError> {
        self.current_database = None;
        self.conn.reset().await
    }

    /// Replace the session outright after a connection-level failure.
    pub async fn reconnect(&mut self, factory: &dyn ConnectionFactory) -> Result<(), ClientError> {
        self.current_database = None;
        self.conn = factory.connect().await?;
        Ok(())
    }
}

impl From<mysql_async::Error> for ClientError {
    fn from(e: mysql_async::Error) -> Self {
        match e {
            mysql_async::Error::Server(server) => {
                ClientError::server(server.code, server.message)
            },
            mysql_async::Error::Io(io) => ClientError::transient(io.to_string()),
            mysql_async::Error::Driver(driver) => ClientError::transient(driver.to_string()),
            other => ClientError::fatal(other.to_string()),
        }
    }
}
