#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

use cfg_if::cfg_if;

#[cfg(feature = "alloc")]
extern crate alloc;

mod heap;
mod memory;

pub use heap::Heap;
pub use memory::Memory;

cfg_if! {
    if #[cfg(feature = "alloc")] {
        pub use memory::GrowableRegion;
    }
}

cfg_if! {
    if #[cfg(feature = "checker")] {
        pub use heap::check::CheckError;
    }
}

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::AllocError;
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::AllocError;
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
