pub type RekamResult<T> = Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("rekam_rs: component '{}' is not a subcircuit", _0)]
    NotASubcircuit(String),
    #[error("rekam_rs: no simulation state behind subcircuit '{}'", _0)]
    MissingSubstate(String),
    #[error("rekam_rs: path must contain at least one component")]
    EmptyPath,
}
