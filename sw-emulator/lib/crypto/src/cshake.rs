/*++

Licensed under the Apache-2.0 license.

File Name:

    cshake.rs

Abstract:

    File contains implementation of cSHAKE-128 (customized SHAKE XOF).

--*/

use sha3::{
    digest::{ExtendableOutput, Update, XofReader},
    CShake128, CShake128Core,
};

/// cSHAKE-128 with an empty function-name string and a caller-supplied
/// customization string.
pub struct Cshake128 {
    /// Hasher
    hasher: CShake128,
}

impl Cshake128 {
    /// Create a new instance of the XOF object
    ///
    /// # Arguments
    ///
    /// * `customization` - cSHAKE customization string
    pub fn new(customization: &[u8]) -> Self {
        Self {
            hasher: CShake128::from_core(CShake128Core::new(customization)),
        }
    }

    /// Write data to the hasher.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Squeeze `N` bytes of output. The hasher state is preserved, so
    /// further updates produce a digest over the full message.
    pub fn digest<const N: usize>(&self) -> [u8; N] {
        let mut digest = [0u8; N];
        self.hasher.clone().finalize_xof().read(&mut digest);
        digest
    }

    /// One-shot convenience: cSHAKE-128 of `data` with `customization`.
    pub fn digest_of<const N: usize>(customization: &[u8], data: &[u8]) -> [u8; N] {
        let mut hasher = Self::new(customization);
        hasher.update(data);
        hasher.digest()
    }
}
