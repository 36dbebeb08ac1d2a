use rekam_rs::error::Error as RekamError;
use thiserror::Error;

pub type RekamTraceResult<T> = Result<T, RekamTraceError>;

#[derive(Debug, Error)]
pub enum RekamTraceError {
    #[error("signal '{}' no longer resolves to a live component", _0)]
    Obsolete(String),
    #[error("rekam_rs: {}", _0)]
    Rekam(RekamError),
}

impl From<RekamError> for RekamTraceError {
    fn from(value: RekamError) -> Self {
        Self::Rekam(value)
    }
}
