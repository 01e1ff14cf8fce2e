/*++

Licensed under the Apache-2.0 license.

File Name:

    mod.rs

Abstract:

    Exports for the util module.

--*/
pub mod literal;
pub mod sort;
pub mod token_iter;
