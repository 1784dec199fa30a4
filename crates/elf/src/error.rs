use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("not an ELF image")]
    NotElf,

    #[error("unsupported ELF image: {0}")]
    Unsupported(String),

    #[error("truncated ELF image at offset {offset:#x}")]
    Truncated { offset: usize },

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed maps line: {0}")]
    BadMapsLine(String),

    #[error("main executable {0} is not mapped")]
    MainImageMissing(PathBuf),
}
