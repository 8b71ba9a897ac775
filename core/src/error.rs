use thiserror::Error;

/// Faults a stage can hit. Absence (no process, no port, no targets) is not a
/// fault and is carried as `None` or an empty sequence instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("transport fault: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Parse(String),

    #[error("configuration: {0}")]
    Configuration(String),
}

impl Fault {
    pub fn transport(e: impl std::fmt::Display) -> Self {
        Fault::Transport(e.to_string())
    }

    pub fn parse(e: impl std::fmt::Display) -> Self {
        Fault::Parse(e.to_string())
    }

    /// Short operator-facing hint for the report.
    pub fn remedy(&self) -> &'static str {
        match self {
            Fault::Transport(_) => "the debugger connection dropped; re-run once the target page has finished loading",
            Fault::Parse(_) => "the debug endpoint answered with unexpected data; restart the tool with the debugger enabled",
            Fault::Configuration(_) => "check the configured project path and hint settings",
        }
    }
}
