/// Impl `From<OtherKindError>` for `io::Error`.
///
/// Lets applications that stay on `io::Result` use `?` on engine and builder errors.
#[macro_export]
macro_rules! impl_into_io_error {
    ($x:ty) => {
        impl From<$x> for io::Error {
            #[inline]
            fn from(e: $x) -> Self {
                io::Error::new(io::ErrorKind::Other, e.to_string())
            }
        }
    };
}

/// Impl `From<XBuilderError>` for the engine `Error`.
///
/// Builder validation failures surface as `InvalidState`, uninitialized fields
/// can not happen because every field carries a default.
#[macro_export]
macro_rules! impl_from_builder_error {
    ($x:ty) => {
        impl From<$x> for $crate::Error {
            #[inline]
            fn from(e: $x) -> Self {
                $crate::Error::InvalidState(e.to_string())
            }
        }
    };
}
