/*++

Licensed under the Apache-2.0 license.

File Name:

    mod.rs

Abstract:

    Exports for the testing module.

--*/
mod fake_bus;
mod log;

pub use fake_bus::FakeBus;
pub use log::Log;
