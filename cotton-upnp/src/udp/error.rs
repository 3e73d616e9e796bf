use std::net::IpAddr;

/// The list of system calls which can return errors
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    /// socket() or one of the setsockopt calls configuring it
    Socket,
    /// bind() returned an error
    Bind,
    /// recvfrom() returned an error
    Recvfrom,
    /// sendto() returned an error
    Sendto,
    /// setsockopt(IP_ADD_MEMBERSHIP) returned an error
    JoinMulticast,
}

/// The errors which can be returned from UDP trait methods
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No socket session is open on that local address
    #[error("no session on local address {0}")]
    NoSession(IpAddr),

    /// A system call returned an error
    #[error("error from syscall {0:?}")]
    Syscall(Syscall, #[source] std::io::Error),
}
