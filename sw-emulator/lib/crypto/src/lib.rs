/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains exports for the Sentinel Emulator Crypto library.

--*/

mod cshake;

pub use crate::cshake::Cshake128;
