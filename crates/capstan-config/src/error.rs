//! Error taxonomy for the settings store.
//!
//! Validation and conflict variants abort the surrounding transaction before
//! any write lands; fatal variants wrap the underlying storage failure.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Failures surfaced by the settings store.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A mutation touched a field listed in the profile's immutable keys.
    #[error("field {section}.{field} is immutable")]
    ImmutableField {
        /// Aggregate section containing the field.
        section: String,
        /// Field name within the section.
        field: String,
    },

    /// A supplied value failed validation.
    #[error("invalid value for {section}.{field}: {reason}")]
    InvalidField {
        /// Aggregate section containing the field.
        section: String,
        /// Field name within the section.
        field: String,
        /// The offending value, when it is printable.
        value: Option<String>,
        /// Static description of the constraint that was violated.
        reason: &'static str,
    },

    /// A label policy kind was not `category` or `tag`.
    #[error("unknown label kind: {value}")]
    InvalidLabelKind {
        /// The rejected kind.
        value: String,
    },

    /// An application mode was not `setup` or `active`.
    #[error("unknown app mode: {value}")]
    InvalidAppMode {
        /// The rejected mode.
        value: String,
    },

    /// An auth mode was not `api_key` or `disabled`.
    #[error("unknown auth mode: {value}")]
    InvalidAuthMode {
        /// The rejected mode.
        value: String,
    },

    /// A completed-move mode was not `hardlink`, `copy`, or `move`.
    #[error("unknown move mode: {value}")]
    InvalidMoveMode {
        /// The rejected mode.
        value: String,
    },

    /// A par2 policy was not `off`, `verify`, or `repair`.
    #[error("unknown par2 policy: {value}")]
    InvalidPar2Policy {
        /// The rejected policy.
        value: String,
    },

    /// A stored or supplied identifier was not a valid UUID.
    #[error("invalid uuid: {value}")]
    InvalidUuid {
        /// The rejected identifier.
        value: String,
    },

    /// The HTTP bind address could not be parsed as an IP address.
    #[error("invalid bind address: {value}")]
    InvalidBindAddr {
        /// The rejected address.
        value: String,
    },

    /// Two label policies shared the same `(kind, name)` pair.
    #[error("duplicate label policy {kind}/{name}")]
    DuplicateLabelPolicy {
        /// Label kind of the colliding pair.
        kind: String,
        /// Label name of the colliding pair.
        name: String,
    },

    /// Two peer classes shared the same class id.
    #[error("duplicate peer class id {class_id}")]
    DuplicatePeerClass {
        /// The colliding class id.
        class_id: u8,
    },

    /// An unconsumed, unexpired setup token already exists.
    #[error("an active setup token already exists")]
    SetupTokenActive,

    /// No setup token matched the supplied id.
    #[error("setup token not found")]
    SetupTokenMissing,

    /// The setup token was already consumed.
    #[error("setup token already consumed")]
    SetupTokenConsumed,

    /// The setup token expired before it was consumed.
    #[error("setup token expired")]
    SetupTokenExpired,

    /// The change feed shut down while a watcher was waiting on it.
    #[error("settings change feed closed")]
    ChangeFeedClosed,

    /// A query against the settings database failed.
    #[error("database operation failed: {operation}")]
    Database {
        /// Label describing the failed operation.
        operation: &'static str,
        /// Underlying driver error.
        #[source]
        source: sqlx::Error,
    },

    /// A shared data-layer call failed.
    #[error("data access failed: {operation}")]
    DataAccess {
        /// Label describing the failed operation.
        operation: &'static str,
        /// Underlying data-layer error.
        #[source]
        source: capstan_data::DataError,
    },
}

#[cfg(test)]
mod tests {
    use super::ConfigError;

    #[test]
    fn messages_identify_the_offending_field() {
        let err = ConfigError::InvalidField {
            section: "engine".into(),
            field: "listen_port".into(),
            value: Some("0".into()),
            reason: "port must be between 1 and 65535",
        };
        assert_eq!(
            err.to_string(),
            "invalid value for engine.listen_port: port must be between 1 and 65535"
        );

        let err = ConfigError::ImmutableField {
            section: "app".into(),
            field: "instance_name".into(),
        };
        assert_eq!(err.to_string(), "field app.instance_name is immutable");
    }
}
