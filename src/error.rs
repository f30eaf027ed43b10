#[derive(thiserror::Error, Debug)]
pub(crate) enum ServerError {
    #[error("invalid host")]
    InvalidHost,
    #[error("invalid upstream target")]
    InvalidUpstream,
}
