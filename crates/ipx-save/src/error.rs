use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("read failed at line {line}: {source}")]
    Read {
        line: usize,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum SaveError {
    #[error("Failed to open {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {name}: {source}")]
    Parse {
        name: String,
        #[source]
        source: ParseError,
    },

    #[error("{name} exited with {status}")]
    Exit {
        name: String,
        status: std::process::ExitStatus,
    },

    #[error("Failed to wait for {name}: {source}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse task for {name} did not complete: {message}")]
    Task { name: String, message: String },
}

impl SaveError {
    /// Name of the source that failed
    pub fn source_name(&self) -> &str {
        match self {
            Self::Open { name, .. }
            | Self::Parse { name, .. }
            | Self::Exit { name, .. }
            | Self::Wait { name, .. }
            | Self::Task { name, .. } => name,
        }
    }
}

pub type Result<T> = std::result::Result<T, SaveError>;
