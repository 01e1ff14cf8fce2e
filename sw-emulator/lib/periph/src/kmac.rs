/*++

Licensed under the Apache-2.0 license.

File Name:

    kmac.rs

Abstract:

    File contains the KMAC engine model used for lifecycle token hashing.

--*/

use rand::{rngs::StdRng, RngCore, SeedableRng};
use sentinel_emu_bus::{ActionHandle, Clock, Timer};
use sentinel_emu_crypto::Cshake128;

/// cSHAKE customization string used for lifecycle token hashing.
pub const LC_TOKEN_CUSTOMIZATION: &[u8] = b"LC_CTRL";

/// The number of clock cycles it takes the engine to produce a digest.
const KMAC_OP_TICKS: u64 = 40;

/// Size of a lifecycle token and of its hashed form.
pub const TOKEN_SIZE: usize = 16;

/// Half-token message size; tokens are absorbed as two 8-byte messages.
pub const TOKEN_HALF_SIZE: usize = TOKEN_SIZE / 2;

/// A digest response, masked into two XOR shares. The first 8 bytes of each
/// share are the low half of the masked value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KmacDigestShares {
    pub share0: [u8; TOKEN_SIZE],
    pub share1: [u8; TOKEN_SIZE],
}

impl KmacDigestShares {
    /// Recover the digest by unmasking the two shares.
    pub fn combine(&self) -> [u8; TOKEN_SIZE] {
        let mut digest = [0u8; TOKEN_SIZE];
        for i in 0..TOKEN_SIZE {
            digest[i] = self.share0[i] ^ self.share1[i];
        }
        digest
    }
}

/// KMAC engine model. The lifecycle controller submits the user token as two
/// 8-byte messages; the digest is produced after a delay and returned as two
/// XOR shares.
///
/// Only one outstanding request is supported; a new absorb sequence discards
/// any unclaimed response.
pub struct Kmac {
    /// Timer
    timer: Timer,

    /// Message bytes absorbed so far
    absorbed: Vec<u8>,

    /// Digest response, ready for the client
    response: Option<KmacDigestShares>,

    /// Share-mask generator
    mask_rng: StdRng,

    /// Operation complete action
    op_complete_action: Option<ActionHandle>,
}

impl Kmac {
    /// Create a new instance of the KMAC engine model.
    pub fn new(clock: &Clock) -> Self {
        Self {
            timer: Timer::new(clock),
            absorbed: Vec::new(),
            response: None,
            mask_rng: StdRng::seed_from_u64(0x6c63_5f63_7472_6c00),
            op_complete_action: None,
        }
    }

    /// Absorb one 8-byte message. When `last` is set the digest operation is
    /// started; the response becomes available [`KMAC_OP_TICKS`] later.
    pub fn absorb(&mut self, half: [u8; TOKEN_HALF_SIZE], last: bool) {
        // An unclaimed response from an earlier request is dropped.
        self.response = None;
        self.absorbed.extend_from_slice(&half);
        if last {
            self.op_complete_action = Some(self.timer.schedule_poll_in(KMAC_OP_TICKS));
        }
    }

    /// Claim a completed digest response.
    pub fn take_response(&mut self) -> Option<KmacDigestShares> {
        self.response.take()
    }

    /// True while a digest operation is in flight.
    pub fn busy(&self) -> bool {
        self.op_complete_action.is_some()
    }

    /// Called by the owning peripheral on every [`Bus::poll`].
    pub fn poll(&mut self) {
        if self.timer.fired(&mut self.op_complete_action) {
            self.op_complete();
        }
    }

    /// Drop any in-flight operation and unclaimed response.
    pub fn reset(&mut self) {
        if let Some(action) = self.op_complete_action.take() {
            self.timer.cancel(action);
        }
        self.absorbed.clear();
        self.response = None;
    }

    fn op_complete(&mut self) {
        let mut hasher = Cshake128::new(LC_TOKEN_CUSTOMIZATION);
        hasher.update(&self.absorbed);
        let digest: [u8; TOKEN_SIZE] = hasher.digest();
        self.absorbed.clear();

        let mut mask = [0u8; TOKEN_SIZE];
        self.mask_rng.fill_bytes(&mut mask);
        let mut share0 = [0u8; TOKEN_SIZE];
        for i in 0..TOKEN_SIZE {
            share0[i] = digest[i] ^ mask[i];
        }
        self.response = Some(KmacDigestShares {
            share0,
            share1: mask,
        });

        // Give the client a chance to drain the response on the next tick.
        self.timer.schedule_poll_in(1);
    }

    /// Hash a full token with the engine's fixed customization string. Used
    /// at device realization to pre-compute the hashed forms of the zero and
    /// raw-unlock tokens.
    pub fn hash_token(token: &[u8; TOKEN_SIZE]) -> [u8; TOKEN_SIZE] {
        Cshake128::digest_of(LC_TOKEN_CUSTOMIZATION, token)
    }
}
