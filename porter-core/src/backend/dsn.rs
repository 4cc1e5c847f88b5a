//! DSN parsing and driver selection.
//!
//! The scheme prefix picks the driver:
//!
//! ```text
//! embedded://:memory:            in-process engine, transient database
//! embedded:///var/lib/analytics  in-process engine, file-backed
//! embedded://hosted/my_db        hosted embedded engine (token required)
//! remote://host:9000/db?user=u&password=p   remote distributed engine
//! ```

use std::fmt;

use crate::error::PorterError;

/// Which driver family a DSN resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Embedded,
    Remote,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Embedded => "embedded",
            BackendKind::Remote => "remote",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed data source name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dsn {
    EmbeddedMemory,
    EmbeddedFile { path: String },
    EmbeddedHosted { database: String },
    Remote {
        host: String,
        port: u16,
        database: String,
        user: Option<String>,
        password: Option<String>,
    },
}

impl Dsn {
    pub fn parse(raw: &str) -> Result<Self, PorterError> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("embedded://") {
            return Self::parse_embedded(rest);
        }
        if let Some(rest) = raw.strip_prefix("remote://") {
            return Self::parse_remote(rest);
        }
        Err(PorterError::InvalidArgument(format!(
            "unknown DSN scheme in {raw:?}"
        )))
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Dsn::EmbeddedMemory | Dsn::EmbeddedFile { .. } | Dsn::EmbeddedHosted { .. } => {
                BackendKind::Embedded
            }
            Dsn::Remote { .. } => BackendKind::Remote,
        }
    }

    /// Stable identity used for cache fingerprints; credentials excluded.
    pub fn identity(&self) -> String {
        match self {
            Dsn::EmbeddedMemory => "embedded://:memory:".to_string(),
            Dsn::EmbeddedFile { path } => format!("embedded://{path}"),
            Dsn::EmbeddedHosted { database } => format!("embedded://hosted/{database}"),
            Dsn::Remote {
                host,
                port,
                database,
                ..
            } => format!("remote://{host}:{port}/{database}"),
        }
    }

    fn parse_embedded(rest: &str) -> Result<Self, PorterError> {
        if rest.is_empty() {
            return Err(PorterError::InvalidArgument(
                "embedded DSN requires a path, :memory:, or hosted/<db>".to_string(),
            ));
        }
        if rest == ":memory:" {
            return Ok(Dsn::EmbeddedMemory);
        }
        if let Some(db) = rest.strip_prefix("hosted/") {
            if db.is_empty() {
                return Err(PorterError::InvalidArgument(
                    "hosted embedded DSN requires a database name".to_string(),
                ));
            }
            return Ok(Dsn::EmbeddedHosted {
                database: db.to_string(),
            });
        }
        Ok(Dsn::EmbeddedFile {
            path: rest.to_string(),
        })
    }

    fn parse_remote(rest: &str) -> Result<Self, PorterError> {
        let (location, query) = match rest.split_once('?') {
            Some((loc, q)) => (loc, Some(q)),
            None => (rest, None),
        };
        let (authority, database) = location.split_once('/').ok_or_else(|| {
            PorterError::InvalidArgument("remote DSN requires /<database>".to_string())
        })?;
        let (host, port_str) = authority.split_once(':').ok_or_else(|| {
            PorterError::InvalidArgument("remote DSN requires host:port".to_string())
        })?;
        if host.is_empty() || database.is_empty() {
            return Err(PorterError::InvalidArgument(
                "remote DSN requires host and database".to_string(),
            ));
        }
        let port: u16 = port_str.parse().map_err(|_| {
            PorterError::InvalidArgument(format!("invalid remote port {port_str:?}"))
        })?;

        let mut user = None;
        let mut password = None;
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                match key {
                    "user" => user = Some(value.to_string()),
                    "password" => password = Some(value.to_string()),
                    other => {
                        return Err(PorterError::InvalidArgument(format!(
                            "unknown remote DSN parameter {other:?}"
                        )))
                    }
                }
            }
        }

        Ok(Dsn::Remote {
            host: host.to_string(),
            port,
            database: database.to_string(),
            user,
            password,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_variants_parse() -> anyhow::Result<()> {
        assert_eq!(Dsn::parse("embedded://:memory:")?, Dsn::EmbeddedMemory);
        assert_eq!(
            Dsn::parse("embedded:///var/lib/analytics.db")?,
            Dsn::EmbeddedFile {
                path: "/var/lib/analytics.db".to_string()
            }
        );
        assert_eq!(
            Dsn::parse("embedded://hosted/sales")?,
            Dsn::EmbeddedHosted {
                database: "sales".to_string()
            }
        );
        assert_eq!(Dsn::parse("embedded://:memory:")?.kind(), BackendKind::Embedded);
        Ok(())
    }

    #[test]
    fn remote_parses_credentials() -> anyhow::Result<()> {
        let dsn = Dsn::parse("remote://ch.internal:9000/analytics?user=svc&password=hunter2")?;
        assert_eq!(
            dsn,
            Dsn::Remote {
                host: "ch.internal".to_string(),
                port: 9000,
                database: "analytics".to_string(),
                user: Some("svc".to_string()),
                password: Some("hunter2".to_string()),
            }
        );
        assert_eq!(dsn.kind(), BackendKind::Remote);
        // credentials never leak into the identity
        assert_eq!(dsn.identity(), "remote://ch.internal:9000/analytics");
        Ok(())
    }

    #[test]
    fn unknown_scheme_fails_at_open() {
        let err = Dsn::parse("postgres://localhost/db").unwrap_err();
        assert!(matches!(err, PorterError::InvalidArgument(_)));
    }

    #[test]
    fn malformed_remote_dsns_fail() {
        for raw in [
            "remote://hostonly/db",
            "remote://host:9000",
            "remote://host:port/db",
            "remote://host:9000/db?tls=on",
        ] {
            assert!(Dsn::parse(raw).is_err(), "expected failure for {raw}");
        }
    }
}
