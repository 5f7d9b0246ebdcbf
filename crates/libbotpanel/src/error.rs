use thiserror::Error;

/// Failures inside the supervisor. None of these escape to callers as
/// `Err`; they are rendered into console status lines instead.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("invalid launch request: {0}")]
    InvalidLaunch(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported runtime version {0:?}")]
    UnsupportedRuntime(String),
}
