//! # Internal Macros
//!
//! Boilerplate reduction for zerocopy record structs.
//!
//! ## zerocopy_getters!
//!
//! Generates getter methods for struct fields stored as little-endian
//! wrapper types (`U16`, `U32`, `U64`).
//!
//! ```ignore
//! use zerocopy::little_endian::{U32, U64};
//!
//! #[repr(C)]
//! struct Footer {
//!     generation: U64,
//!     version: U32,
//! }
//!
//! impl Footer {
//!     zerocopy_getters! {
//!         generation: u64,
//!         version: u32,
//!     }
//! }
//! ```

/// Generates getter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_getters {
    ($($field:ident : $native_ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $native_ty {
                self.$field.get()
            }
        )*
    };
}
