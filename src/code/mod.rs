//! # Code
//!
//! This module turns addresses into the bytes that get written into patched code.
//!
//! Every conversion from a function or data pointer to raw bytes goes through [`AsAddress`] and [`address_bytes`].

use std::mem;
use std::ptr::NonNull;

pub mod x64;

/// Anything that designates a location in memory
pub trait AsAddress {
    /// The location as a plain address
    fn as_address(&self) -> usize;
}

impl AsAddress for usize {
    fn as_address(&self) -> usize {
        *self
    }
}

impl<T> AsAddress for *const T {
    fn as_address(&self) -> usize {
        *self as usize
    }
}

impl<T> AsAddress for *mut T {
    fn as_address(&self) -> usize {
        *self as usize
    }
}

impl<T> AsAddress for NonNull<T> {
    fn as_address(&self) -> usize {
        self.as_ptr() as usize
    }
}

/// Implements [`AsAddress`] for function pointers of every listed arity
macro_rules! impl_fn_address {
    ($($arg:ident),*) => {
        impl<R, $($arg),*> AsAddress for fn($($arg),*) -> R {
            fn as_address(&self) -> usize {
                *self as usize
            }
        }
        impl<R, $($arg),*> AsAddress for unsafe fn($($arg),*) -> R {
            fn as_address(&self) -> usize {
                *self as usize
            }
        }
        impl<R, $($arg),*> AsAddress for extern "C" fn($($arg),*) -> R {
            fn as_address(&self) -> usize {
                *self as usize
            }
        }
        impl<R, $($arg),*> AsAddress for unsafe extern "C" fn($($arg),*) -> R {
            fn as_address(&self) -> usize {
                *self as usize
            }
        }
    };
}

impl_fn_address!();
impl_fn_address!(A);
impl_fn_address!(A, B);
impl_fn_address!(A, B, C);
impl_fn_address!(A, B, C, D);
impl_fn_address!(A, B, C, D, E);
impl_fn_address!(A, B, C, D, E, F);

/// The native-endian bytes of an address, as they would be stored in memory
pub fn address_bytes(address: impl AsAddress) -> [u8; mem::size_of::<usize>()] {
    address.as_address().to_ne_bytes()
}
