pub type Result<T> = std::result::Result<T, Error>;

/// Builds an [`Error`] of the given kind, optionally with a formatted message.
#[macro_export]
macro_rules! error {
    ($kind:ident) => {
        $crate::error::Error {
            kind: $crate::error::ErrorKind::$kind,
            message: None,
        }
    };
    ($kind:ident => $($arg:tt)*) => {
        $crate::error::Error {
            kind: $crate::error::ErrorKind::$kind,
            message: Some(format!($($arg)*)),
        }
    };
}

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub enum ErrorKind {
    SerdeYaml,
    DomainStr,
    Zonefile,
    PushRecord,
    Tsig,
    Dnssec,
    Http,
    Io,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}", message),
            None => self.kind.fmt(f),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ErrorKind::*;

        match self {
            SerdeYaml => write!(f, "serde yaml error"),
            DomainStr => write!(f, "invalid domain name"),
            Zonefile => write!(f, "zone text error"),
            PushRecord => write!(f, "failed to push record into message"),
            Tsig => write!(f, "tsig error"),
            Dnssec => write!(f, "dnssec error"),
            Http => write!(f, "http error"),
            Io => write!(f, "io error"),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_yaml::Error> for Error {
    fn from(value: serde_yaml::Error) -> Self {
        Self {
            kind: ErrorKind::SerdeYaml,
            message: Some(value.to_string()),
        }
    }
}

impl From<domain::base::name::FromStrError> for Error {
    fn from(value: domain::base::name::FromStrError) -> Self {
        Self {
            kind: ErrorKind::DomainStr,
            message: Some(value.to_string()),
        }
    }
}

impl From<domain::zonefile::inplace::Error> for Error {
    fn from(value: domain::zonefile::inplace::Error) -> Self {
        Self {
            kind: ErrorKind::Zonefile,
            message: Some(value.to_string()),
        }
    }
}

impl From<domain::tsig::NewKeyError> for Error {
    fn from(value: domain::tsig::NewKeyError) -> Self {
        Self {
            kind: ErrorKind::Tsig,
            message: Some(value.to_string()),
        }
    }
}

impl From<base64::DecodeError> for Error {
    fn from(value: base64::DecodeError) -> Self {
        Self {
            kind: ErrorKind::Dnssec,
            message: Some(value.to_string()),
        }
    }
}

impl From<ring::error::KeyRejected> for Error {
    fn from(value: ring::error::KeyRejected) -> Self {
        Self {
            kind: ErrorKind::Dnssec,
            message: Some(value.to_string()),
        }
    }
}

impl From<ring::error::Unspecified> for Error {
    fn from(_: ring::error::Unspecified) -> Self {
        Self {
            kind: ErrorKind::Dnssec,
            message: None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Self {
            kind: ErrorKind::Http,
            message: Some(value.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Io,
            message: Some(value.to_string()),
        }
    }
}
