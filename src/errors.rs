//! Error mapping guide:
//! - Components return `BridgeError`; the host layer flattens it into `FlagResult`/`HttpResult`.
//! - Map io::ErrorKind::NotFound to a "not found" message; keep all other io texts verbatim.
//! - User-visible strings go through `display_for_bridge_error` so the UI never sees Debug output.
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum BridgeError {
    Io(io::Error),
    /// Listener could not be bound (address in use, permission, bad address).
    Bind(String),
    /// Certificate or private key could not be loaded.
    Tls(String),
    /// A registration with the same id is still alive.
    Duplicate(String),
    NotFound(String),
    Message(String),
}

impl From<io::Error> for BridgeError {
    fn from(e: io::Error) -> Self {
        BridgeError::Io(e)
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&display_for_bridge_error(self))
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Render a user-facing string for BridgeError.
pub fn display_for_bridge_error(e: &BridgeError) -> String {
    match e {
        BridgeError::Io(ioe) => ioe.to_string(),
        BridgeError::Bind(s) => format!("Failed to bind address: {s}"),
        BridgeError::Tls(s) => format!("Failed to load TLS cert: {s}"),
        BridgeError::Duplicate(id) => format!("server already running: {id}"),
        BridgeError::NotFound(s) => s.clone(),
        BridgeError::Message(s) => s.clone(),
    }
}

/// True when the error means the target does not exist (unknown id, missing file, dead pid).
pub fn is_not_found(e: &BridgeError) -> bool {
    match e {
        BridgeError::NotFound(_) => true,
        BridgeError::Io(ioe) => ioe.kind() == io::ErrorKind::NotFound,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_keeps_io_text_and_prefixes_bind() {
        let e = BridgeError::Bind("address in use".to_string());
        assert_eq!(e.to_string(), "Failed to bind address: address in use");
        let io = BridgeError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(io.to_string(), "gone");
        assert!(is_not_found(&io));
        assert!(!is_not_found(&BridgeError::Message("x".into())));
    }
}
