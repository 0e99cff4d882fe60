//! Errors returned to clients as status responses.

use cellblock_common::argv::ArgvError;
use cellblock_common::manifest::ManifestError;
use cellblock_common::protocol::Response;

/// Request failures reported back to the client as a status response.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("{0} invalid container")]
    NotFound(String),
    #[error("{0} console already attached")]
    AlreadyAttached(String),
    #[error("illegal signal specification: {0}")]
    IllegalSignal(i32),
    #[error("too many build stages/steps")]
    BuildTooLarge,
    #[error("invalid build manifest: {0}")]
    Manifest(#[from] ManifestError),
    #[error("{0}: command not found")]
    UnknownCommand(String),
    #[error("malformed command arguments: {0}")]
    Arguments(#[from] ArgvError),
}

impl InstanceError {
    pub fn code(&self) -> i32 {
        match self {
            InstanceError::NotFound(_) | InstanceError::UnknownCommand(_) => libc::ENOENT,
            InstanceError::AlreadyAttached(_) => libc::EBUSY,
            InstanceError::IllegalSignal(_)
            | InstanceError::Manifest(_)
            | InstanceError::Arguments(_) => libc::EINVAL,
            InstanceError::BuildTooLarge => libc::E2BIG,
        }
    }

    pub fn to_response(&self) -> Response {
        Response::error(self.code(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_carry_errno_and_message() {
        let resp = InstanceError::AlreadyAttached("3f9a1c02be".into()).to_response();
        assert_eq!(resp.code, libc::EBUSY);
        assert_eq!(resp.message, "3f9a1c02be console already attached");
        assert!(!resp.is_ok());

        let resp = InstanceError::IllegalSignal(11).to_response();
        assert_eq!(resp.message, "illegal signal specification: 11");
    }
}
