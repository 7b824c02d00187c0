use thiserror::Error;
use tokio::sync::mpsc::error::SendError as MpscSendError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("key material must be len {0}, got {1}")]
    KeyMaterialLength(usize, usize),
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("no key available at index {0}")]
    KeyUnavailable(u8),
    #[error("failed to decrypt frame")]
    FailedToDecryptFrame,
    #[error("too short encrypted frame: only {0} bytes, expected at least {1} bytes")]
    FrameTooShort(usize, usize),
    #[error("ring size must be in 1..=256, got {0}")]
    InvalidRingSize(usize),
    #[error("key index {0} does not fit ring size {1}")]
    InvalidKeyIndex(u8, usize),
    #[error("invalid rtp payload type {0}")]
    InvalidPayloadType(u8),
    #[error("pipeline already installed for stream {0}")]
    PipelineExists(String),
    #[error("no pipeline installed for stream {0}")]
    NoSuchPipeline(String),
    #[error("this stream is not a send pipeline")]
    InvalidSendStream,
    #[error("this stream is not a receive pipeline")]
    InvalidReceiveStream,
    #[error("e2ee is already enabled")]
    AlreadyEnabled,
    #[error("e2ee is already disabled")]
    AlreadyDisabled,
    #[error("cryptor worker has been closed")]
    CryptorClosed,
    #[error("key handler has been closed")]
    HandlerClosed,

    #[error("aes gcm: {0}")]
    AesGcm(#[from] aes_gcm::Error),
    #[error("mpsc send: {0}")]
    MpscSend(String),

    #[error("{0}")]
    Other(String),
}

// Because Tokio SendError is parameterized, we sadly lose the backtrace.
impl<T> From<MpscSendError<T>> for Error {
    fn from(e: MpscSendError<T>) -> Self {
        Error::MpscSend(e.to_string())
    }
}
