//! Conversions from hardware results into the `triport-net` taxonomy, shared
//! by the verbs and fabric substrates.

use triport_net::{AccessFlags, CompletionError, ConnectionError, Error, ResourceError};

use crate::cq::WcStatus;
use crate::mr::HwAccess;
use crate::HwError;

/// Map a synchronous hardware failure on `queue` into an [`Error`].
pub fn map_hw_error(err: HwError, queue: &'static str) -> Error {
    match err {
        HwError::QueueFull(capacity) => ResourceError::QueueFull { queue, capacity }.into(),
        HwError::NoResources(reason) => ResourceError::Exhausted(reason).into(),
        HwError::NotConnected => ConnectionError::Closed.into(),
        HwError::Again => Error::WouldBlock { pending: 0 },
        HwError::AddrInUse(addr) => Error::Io(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("address {addr} in use"),
        )),
        other => Error::InvalidArgument(other.to_string()),
    }
}

/// Hardware access bits for a region. Remote write implies local write.
pub fn hw_access(access: AccessFlags) -> HwAccess {
    let mut hw = HwAccess::empty();
    if access.contains(AccessFlags::LOCAL_WRITE) {
        hw |= HwAccess::LOCAL_WRITE;
    }
    if access.contains(AccessFlags::REMOTE_WRITE) {
        hw |= HwAccess::REMOTE_WRITE | HwAccess::LOCAL_WRITE;
    }
    if access.contains(AccessFlags::REMOTE_READ) {
        hw |= HwAccess::REMOTE_READ;
    }
    hw
}

pub fn completion_error(status: WcStatus, message: String) -> CompletionError {
    CompletionError {
        status: status.as_str().to_string(),
        vendor_err: status.vendor_err(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mapping() {
        assert_eq!(hw_access(AccessFlags::LOCAL_READ), HwAccess::empty());
        assert_eq!(
            hw_access(AccessFlags::REMOTE_WRITE),
            HwAccess::REMOTE_WRITE | HwAccess::LOCAL_WRITE
        );
        assert_eq!(hw_access(AccessFlags::REMOTE_ALL), HwAccess::all());
    }

    #[test]
    fn test_hw_error_mapping() {
        assert!(matches!(
            map_hw_error(HwError::QueueFull(8), "send"),
            Error::Resource(ResourceError::QueueFull { queue: "send", capacity: 8 })
        ));
        assert!(matches!(
            map_hw_error(HwError::NotConnected, "send"),
            Error::Connection(ConnectionError::Closed)
        ));
        assert!(matches!(map_hw_error(HwError::Again, "recv"), Error::WouldBlock { pending: 0 }));
        assert!(matches!(
            map_hw_error(HwError::AddrInUse("fabric://127.0.0.1:1".into()), "ep"),
            Error::Io(ref e) if e.kind() == std::io::ErrorKind::AddrInUse
        ));
        assert!(matches!(
            map_hw_error(HwError::TooManySge { requested: 5, limit: 4 }, "recv"),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_completion_error_carries_status() {
        let err = completion_error(WcStatus::RemAccessErr, "work request 4".into());
        assert_eq!(err.status, WcStatus::RemAccessErr.as_str());
        assert_eq!(err.vendor_err, WcStatus::RemAccessErr.vendor_err());
        assert_eq!(err.message, "work request 4");
    }
}
