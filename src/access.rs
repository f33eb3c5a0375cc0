use enumflags2::{bitflags, BitFlags};

/// Access permissions of a registered memory region
#[bitflags]
#[repr(u64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessFlag {
    /// local write permission, required for receive buffers and read targets
    LocalWrite,
    /// remote write permission
    RemoteWrite,
    /// remote read permission
    RemoteRead,
    /// remote atomic operation permission
    RemoteAtomic,
}

/// Access of buffers posted as receives
#[inline]
#[must_use]
pub(crate) fn receive_access() -> BitFlags<AccessFlag> {
    AccessFlag::LocalWrite.into()
}

/// Access of buffers only used as the source of a send
#[inline]
#[must_use]
pub(crate) fn send_access() -> BitFlags<AccessFlag> {
    BitFlags::empty()
}

/// Access of regions a peer reads with a one-sided read
#[inline]
#[must_use]
pub(crate) fn exposed_read_access() -> BitFlags<AccessFlag> {
    AccessFlag::LocalWrite | AccessFlag::RemoteRead
}

/// Access of regions a peer writes with a one-sided write
#[inline]
#[must_use]
pub(crate) fn exposed_write_access() -> BitFlags<AccessFlag> {
    AccessFlag::LocalWrite | AccessFlag::RemoteWrite
}

#[cfg(test)]
mod access_test {
    use super::*;

    #[test]
    fn exposed_regions_keep_local_write() {
        assert!(exposed_read_access().contains(AccessFlag::LocalWrite));
        assert!(exposed_read_access().contains(AccessFlag::RemoteRead));
        assert!(!exposed_read_access().contains(AccessFlag::RemoteWrite));
        assert!(exposed_write_access().contains(AccessFlag::RemoteWrite));
        assert!(!receive_access().contains(AccessFlag::RemoteRead));
        assert!(send_access().is_empty());
    }
}
