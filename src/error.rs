use crate::exchange::ExchangeError;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Message(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("duration parse error: {0}")]
    Duration(#[from] humantime::DurationError),
    #[error("route build error: {0}")]
    Build(#[from] BuildError),
    #[error("exchange failed: {0}")]
    Exchange(#[from] ExchangeError),
    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

/// Build-time failures raised while turning definitions into processors.
///
/// Every variant names the route and, where there is one, the node that
/// carried the offending configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error("route `{route}` must define at least one output")]
    NoOutputs { route: String },
    #[error("route `{route}` node `{node}`: no {kind} bound under `{name}`")]
    MissingReference {
        route: String,
        node: String,
        kind: &'static str,
        name: String,
    },
    #[error("route `{route}` node `{node}`: {reason}")]
    InvalidConfiguration {
        route: String,
        node: String,
        reason: String,
    },
    #[error("route `{route}` node `{node}`: unknown expression language `{language}`")]
    UnknownLanguage {
        route: String,
        node: String,
        language: String,
    },
    #[error("route `{route}` node `{node}`: invalid {language} expression `{expression}`: {reason}")]
    InvalidExpression {
        route: String,
        node: String,
        language: String,
        expression: String,
        reason: String,
    },
    #[error("route `{route}` node `{node}`: unresolved property placeholder `{key}`")]
    UnresolvedPlaceholder {
        route: String,
        node: String,
        key: String,
    },
    #[error("route `{route}` node `{node}`: saga requires a saga service but none is configured")]
    MissingSagaService { route: String, node: String },
    #[error("route `{route}` node `{node}`: invalid endpoint `{uri}`: {reason}")]
    InvalidEndpoint {
        route: String,
        node: String,
        uri: String,
        reason: String,
    },
    #[error("route `{route}` is already defined")]
    DuplicateRoute { route: String },
    #[error("route `{route}` is not defined")]
    UnknownRoute { route: String },
    #[error("cannot advise route `{route}`: {reason}")]
    Advice { route: String, reason: String },
}

impl BuildError {
    pub fn route(&self) -> &str {
        match self {
            BuildError::NoOutputs { route }
            | BuildError::MissingReference { route, .. }
            | BuildError::InvalidConfiguration { route, .. }
            | BuildError::UnknownLanguage { route, .. }
            | BuildError::InvalidExpression { route, .. }
            | BuildError::UnresolvedPlaceholder { route, .. }
            | BuildError::MissingSagaService { route, .. }
            | BuildError::InvalidEndpoint { route, .. }
            | BuildError::DuplicateRoute { route }
            | BuildError::UnknownRoute { route }
            | BuildError::Advice { route, .. } => route,
        }
    }
}

impl Error {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Build failure at the root of this error, looking through context layers.
    pub fn as_build(&self) -> Option<&BuildError> {
        match self {
            Error::Build(err) => Some(err),
            Error::Context { source, .. } => source.as_build(),
            _ => None,
        }
    }
}

/// Attaches a description of the failed operation to an error.
pub trait Context<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<C: Into<String>>(self, describe: impl FnOnce() -> C) -> Result<T>;
}

impl<T, E: Into<Error>> Context<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.with_context(|| context)
    }

    fn with_context<C: Into<String>>(self, describe: impl FnOnce() -> C) -> Result<T> {
        self.map_err(|source| Error::Context {
            context: describe().into(),
            source: Box::new(source.into()),
        })
    }
}

/// `Error::Message` from a format string.
#[macro_export]
macro_rules! err {
    ($($arg:tt)+) => {
        $crate::error::Error::msg(format!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_build_looks_through_context() {
        let build = BuildError::NoOutputs {
            route: "orders".into(),
        };
        let wrapped: Result<()> = Err(Error::from(build.clone()));
        let err = wrapped.context("loading routes").unwrap_err();

        assert_eq!(err.to_string(), "loading routes");
        assert_eq!(err.as_build(), Some(&build));
        assert_eq!(build.route(), "orders");
    }

    #[test]
    fn err_macro_formats_message() {
        let route = "orders";
        let err = crate::err!("route {route} has no consumer");
        assert!(matches!(&err, Error::Message(message) if message == "route orders has no consumer"));
    }
}
