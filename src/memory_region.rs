use crate::{
    access::AccessFlag,
    error::{Error, Result},
    error_utilities::log_provider_err,
    provider::TransportProvider,
    work_request::Sge,
};
use clippy_utilities::Cast;
use enumflags2::BitFlags;
use sealed::sealed;
use serde::{Deserialize, Serialize};
use std::{
    alloc::{self, Layout},
    fmt::{self, Debug},
    ptr::NonNull,
    slice,
    sync::Arc,
};
use tracing::error;

/// Alignment of every registered allocation
const BUFFER_ALIGN: usize = 64;

/// Keys the provider hands out for a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MrKeys {
    /// Local key, used in scatter/gather entries
    pub lkey: u32,
    /// Remote key, handed to peers for one-sided access
    pub rkey: u32,
}

/// Registered Memory Access
#[sealed]
pub trait MrAccess: Sync + Send + Debug {
    /// Get the start addr
    fn addr(&self) -> usize;

    /// Get the length
    fn length(&self) -> usize;

    /// Get the remote key
    fn rkey(&self) -> u32;
}

/// Token describing a remote region: where it starts, its key, how long it is.
///
/// Binary encoding with `bincode` is 20 bytes, little-endian, in field order.
#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub struct RemoteDescriptor {
    /// The start address in the owner's address space
    pub addr: u64,
    /// The remote key of the owner's registration
    pub rkey: u32,
    /// The length in bytes
    pub len: u64,
}

/// A contiguous, stable-address memory region registered with the transport provider.
///
/// The address never moves for the lifetime of the buffer, re-posting it keeps address,
/// key and length. Dropping the buffer deregisters it and then frees the memory.
pub struct RegisteredBuffer {
    /// Start of the allocation
    addr: NonNull<u8>,
    /// Layout used for allocation and deallocation
    layout: Layout,
    /// Usable length, may be smaller than the layout for zero-sized requests
    len: usize,
    /// Registration keys
    keys: MrKeys,
    /// Access flags used at registration
    access: BitFlags<AccessFlag>,
    /// The provider the buffer is registered with
    provider: Arc<dyn TransportProvider>,
}

#[sealed]
impl MrAccess for RegisteredBuffer {
    #[inline]
    #[allow(clippy::as_conversions)]
    fn addr(&self) -> usize {
        self.addr.as_ptr() as usize
    }

    #[inline]
    fn length(&self) -> usize {
        self.len
    }

    #[inline]
    fn rkey(&self) -> u32 {
        self.keys.rkey
    }
}

impl RegisteredBuffer {
    /// Allocate `len` zeroed bytes and register them with `access`.
    ///
    /// On registration failure the allocation is freed before returning.
    pub fn register(
        provider: &Arc<dyn TransportProvider>,
        len: usize,
        access: BitFlags<AccessFlag>,
    ) -> Result<Self> {
        let layout = Layout::from_size_align(len.max(1), BUFFER_ALIGN)
            .map_err(|e| Error::Resource(format!("invalid buffer layout for {len} bytes: {e}")))?;
        // SAFETY: layout size is never zero
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let addr = NonNull::new(raw)
            .ok_or_else(|| Error::Resource(format!("failed to allocate {len} bytes")))?;
        #[allow(clippy::as_conversions)]
        let keys = match provider.register(raw as usize, len, access) {
            Ok(keys) => keys,
            Err(err) => {
                error!(
                    "register err, arguments:\n addr:{:?},\n len:{:?},\n access:{:?}\n, err info:{:?}",
                    raw, len, access, err
                );
                // SAFETY: allocated above with the same layout and never handed out
                unsafe { alloc::dealloc(raw, layout) };
                return Err(Error::Registration(err.to_string()));
            }
        };
        Ok(Self {
            addr,
            layout,
            len,
            keys,
            access,
            provider: Arc::clone(provider),
        })
    }

    /// Register a copy of `data`
    pub fn from_slice(
        provider: &Arc<dyn TransportProvider>,
        data: &[u8],
        access: BitFlags<AccessFlag>,
    ) -> Result<Self> {
        let mut buf = Self::register(provider, data.len(), access)?;
        buf.as_mut_slice().copy_from_slice(data);
        Ok(buf)
    }

    /// Get the registration keys
    #[inline]
    #[must_use]
    pub const fn keys(&self) -> MrKeys {
        self.keys
    }

    /// Get the local key
    #[inline]
    #[must_use]
    pub const fn lkey(&self) -> u32 {
        self.keys.lkey
    }

    /// Get the access flags
    #[inline]
    #[must_use]
    pub const fn access(&self) -> BitFlags<AccessFlag> {
        self.access
    }

    /// Get the contents.
    ///
    /// The provider only writes into a buffer while a work request on it is outstanding,
    /// and the engine only hands the buffer out after the matching completion.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `addr` points to `len` initialized (zeroed) bytes owned by `self`
        unsafe { slice::from_raw_parts(self.addr.as_ptr(), self.len) }
    }

    /// Get the contents mutably
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `addr` points to `len` bytes owned by `self`, `&mut self` is exclusive
        unsafe { slice::from_raw_parts_mut(self.addr.as_ptr(), self.len) }
    }

    /// Scatter/gather entry covering the first `len` bytes
    pub(crate) fn sge(&self, len: usize) -> Sge {
        Sge {
            addr: self.addr().cast(),
            length: len.min(self.len).cast(),
            lkey: self.keys.lkey,
        }
    }

    /// Scatter/gather entry covering the whole buffer
    pub(crate) fn full_sge(&self) -> Sge {
        self.sge(self.len)
    }

    /// Descriptor a peer uses to access this buffer
    #[inline]
    #[must_use]
    pub fn descriptor(&self) -> RemoteDescriptor {
        RemoteDescriptor {
            addr: self.addr().cast(),
            rkey: self.keys.rkey,
            len: self.len.cast(),
        }
    }
}

impl Debug for RegisteredBuffer {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredBuffer")
            .field("addr", &self.addr)
            .field("len", &self.len)
            .field("lkey", &self.keys.lkey)
            .field("rkey", &self.keys.rkey)
            .finish()
    }
}

impl Drop for RegisteredBuffer {
    fn drop(&mut self) {
        log_provider_err(
            self.provider.deregister(self.keys),
            "deregister on buffer drop",
        );
        // SAFETY: allocated in `register` with `self.layout`; deregistered above so the
        // provider no longer touches the memory
        unsafe { alloc::dealloc(self.addr.as_ptr(), self.layout) };
    }
}

// SAFETY: the buffer exclusively owns its allocation
unsafe impl Send for RegisteredBuffer {}

// SAFETY: shared access only reads
unsafe impl Sync for RegisteredBuffer {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::loopback::LoopbackProvider;

    #[test]
    fn descriptor_matches_registration() {
        let provider: Arc<dyn TransportProvider> = Arc::new(LoopbackProvider::new());
        let buf = RegisteredBuffer::from_slice(
            &provider,
            b"hello client!\n",
            AccessFlag::LocalWrite | AccessFlag::RemoteRead,
        )
        .unwrap();
        let desc = buf.descriptor();
        assert_eq!(desc.len, 14);
        assert_eq!(desc.rkey, buf.rkey());
        assert_eq!(desc.addr, u64::try_from(buf.addr()).unwrap());
        assert_eq!(buf.as_slice(), b"hello client!\n");
        assert_eq!(buf.addr() % BUFFER_ALIGN, 0);
    }

    #[test]
    fn descriptor_encodes_to_twenty_bytes() {
        let desc = RemoteDescriptor {
            addr: 0x7fff_0000_1000,
            rkey: 0x1234,
            len: 100_000,
        };
        let bytes = bincode::serialize(&desc).unwrap();
        assert_eq!(bytes.len(), 20);
        assert_eq!(bincode::deserialize::<RemoteDescriptor>(&bytes).unwrap(), desc);
    }

    #[test]
    fn drop_deregisters() {
        let loopback = Arc::new(LoopbackProvider::new());
        let provider: Arc<dyn TransportProvider> = Arc::<LoopbackProvider>::clone(&loopback);
        let buf = RegisteredBuffer::register(&provider, 1024, AccessFlag::LocalWrite.into()).unwrap();
        assert_eq!(loopback.registered_regions(), 1);
        drop(buf);
        assert_eq!(loopback.registered_regions(), 0);
    }
}
