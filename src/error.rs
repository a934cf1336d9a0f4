use thiserror::Error;

pub type Result<T> = std::result::Result<T, FsError>;

/// Everything that can go wrong while mutating the tree or moving it
/// to and from the master file table.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("node names must not be empty")]
    EmptyName,
    #[error("cannot create a zero-byte file")]
    EmptySize,
    #[error("name \"{0}\" already exists in the tree")]
    NameCollision(String),
    #[error("not enough free blocks on disk")]
    OutOfSpace,
    #[error("operation does not apply to this kind of node")]
    WrongKind,
    #[error("node is not a direct child of the given directory")]
    NotAChild,
    #[error("directory is not empty")]
    DirectoryNotEmpty,
    #[error("no node with id {0} in the tree")]
    NodeNotFound(u32),
    #[error("child reference {0} does not match any node in the table")]
    DanglingReference(u32),
    #[error("master file table ends before an expected field")]
    Truncated,
    #[error("malformed master file table: {0}")]
    Corrupt(&'static str),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}
