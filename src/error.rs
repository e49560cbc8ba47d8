use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open media container")]
    Open,
    #[error("no decodable audio or video stream found")]
    NoStream,
    #[error("codec initialization failed")]
    Codec,
    #[error("failed to decode packet")]
    Decode,
    #[error("failed to seek to start of stream")]
    Seek,
    #[error("audio output device unavailable")]
    AudioDevice,
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
