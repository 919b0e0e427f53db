use std::fmt;

#[derive(Debug)]
pub enum ServerError {
    CameraError(String),
    WebrtcError(String),
    RecordingError(String),
    ConfigError(String),
    IoError(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerError::CameraError(msg) => write!(f, "Camera error: {}", msg),
            ServerError::WebrtcError(msg) => write!(f, "WebRTC error: {}", msg),
            ServerError::RecordingError(msg) => write!(f, "Recording error: {}", msg),
            ServerError::ConfigError(msg) => write!(f, "Config error: {}", msg),
            ServerError::IoError(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::IoError(err.to_string())
    }
}
