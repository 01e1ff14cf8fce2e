/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    Contains derive procedural macros used in the Sentinel emulator.

--*/
mod bus;
mod util;

#[cfg(not(test))]
use proc_macro::TokenStream;

#[cfg(not(test))]
#[proc_macro_derive(
    Bus,
    attributes(peripheral, register, register_array, poll_fn, cold_reset_fn)
)]
pub fn derive_bus(input: TokenStream) -> TokenStream {
    crate::bus::derive_bus(input.into()).into()
}
