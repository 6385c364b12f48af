//! Classification of `sqlx` errors by SQLSTATE.

use booking_relay_core::event_bus::{BrokerError, PublishError};
use booking_relay_core::sink::SinkError;

/// Coarse category of a database failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DbFailure {
    /// Connection, pool or I/O problem
    Transient,
    /// Login or privilege rejected
    Auth,
    /// Missing relation or column: schema not migrated
    Schema,
    /// Value rejected by the database (class 22, data exception)
    Data,
}

/// Categorize an SQLSTATE code.
pub(crate) fn categorize_code(code: &str) -> DbFailure {
    match code {
        // invalid_authorization_specification, invalid_password, insufficient_privilege
        "28000" | "28P01" | "42501" => DbFailure::Auth,
        // undefined_table, undefined_column, invalid_schema_name
        "42P01" | "42703" | "3F000" => DbFailure::Schema,
        c if c.starts_with("22") => DbFailure::Data,
        _ => DbFailure::Transient,
    }
}

pub(crate) fn categorize(err: &sqlx::Error) -> DbFailure {
    match err {
        sqlx::Error::Database(db) => db.code().map_or(DbFailure::Transient, |c| categorize_code(&c)),
        sqlx::Error::Configuration(_) => DbFailure::Schema,
        _ => DbFailure::Transient,
    }
}

pub(crate) fn broker_error(err: &sqlx::Error) -> BrokerError {
    match categorize(err) {
        DbFailure::Auth => BrokerError::Unauthorized(err.to_string()),
        DbFailure::Schema => BrokerError::Configuration(err.to_string()),
        DbFailure::Transient | DbFailure::Data => BrokerError::Transport(err.to_string()),
    }
}

pub(crate) fn publish_error(err: &sqlx::Error) -> PublishError {
    match categorize(err) {
        DbFailure::Auth => PublishError::Auth(err.to_string()),
        DbFailure::Schema | DbFailure::Transient | DbFailure::Data => {
            PublishError::Connection(err.to_string())
        },
    }
}

pub(crate) fn sink_error(err: &sqlx::Error, key: &str) -> SinkError {
    match categorize(err) {
        DbFailure::Auth | DbFailure::Schema => SinkError::Configuration(err.to_string()),
        DbFailure::Data => SinkError::Rejected {
            key: key.to_string(),
            reason: err.to_string(),
        },
        DbFailure::Transient => SinkError::Io(err.to_string()),
    }
}
