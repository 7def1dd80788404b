use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("could not resolve node id: {reason}")]
    NodeId { reason: String },
}

impl Error {
    #[must_use]
    pub fn node_id(reason: impl Into<String>) -> Self {
        Self::NodeId {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_error_names_the_reason() {
        let err = Error::node_id("hostname is empty");
        assert_eq!(err.to_string(), "could not resolve node id: hostname is empty");
    }
}
