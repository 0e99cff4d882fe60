//! Types shared by cellblockd and its clients: the wire protocol, parsed
//! build manifests and argument-vector marshalling.

pub mod argv;
pub mod manifest;
pub mod protocol;
