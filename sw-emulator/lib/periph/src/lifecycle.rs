/*++

Licensed under the Apache-2.0 license.

File Name:

    lifecycle.rs

Abstract:

    File contains the lifecycle state model: redundant state encoding, OTP
    word templates, the transition matrix, and the capability broadcast
    constants.

--*/

use lazy_static::lazy_static;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Number of 16-bit words in the OTP lifecycle-state sequence.
pub const LC_STATE_WORDS: usize = 20;

/// Number of 16-bit words in the OTP transition-counter sequence.
pub const LC_CNT_WORDS: usize = 24;

/// Number of 16-bit words in the OTP ownership sequence.
pub const OWNERSHIP_WORDS: usize = 8;

/// Number of 16-bit words in the OTP SoC-debug sequence.
pub const SOC_DBG_WORDS: usize = 2;

/// Number of productive (OTP-encodable) lifecycle states.
pub const NUM_PRODUCTIVE_STATES: usize = 21;

/// Ceiling for the lifecycle transition counter.
pub const MAX_TRANSITION_COUNT: u32 = LC_CNT_WORDS as u32;

/// Lifecycle state. The first 21 values are productive states stored in OTP;
/// the last three are pseudo states only ever reported through the LC_STATE
/// register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum LcState {
    Raw = 0,
    TestUnlocked0 = 1,
    TestLocked0 = 2,
    TestUnlocked1 = 3,
    TestLocked1 = 4,
    TestUnlocked2 = 5,
    TestLocked2 = 6,
    TestUnlocked3 = 7,
    TestLocked3 = 8,
    TestUnlocked4 = 9,
    TestLocked4 = 10,
    TestUnlocked5 = 11,
    TestLocked5 = 12,
    TestUnlocked6 = 13,
    TestLocked6 = 14,
    TestUnlocked7 = 15,
    Dev = 16,
    Prod = 17,
    ProdEnd = 18,
    Rma = 19,
    Scrap = 20,
    PostTransition = 21,
    Escalate = 22,
    Invalid = 23,
}

/// Number of redundant 5-bit slots in the encoded state word.
const ENCODE_SLOTS: u32 = 6;
const ENCODE_SLOT_BITS: u32 = 5;
const ENCODE_SLOT_MASK: u32 = (1 << ENCODE_SLOT_BITS) - 1;

impl LcState {
    /// True for states that can be stored in OTP.
    pub fn is_productive(&self) -> bool {
        (*self as u32) < NUM_PRODUCTIVE_STATES as u32
    }

    /// Unlock level for TEST_UNLOCKED states.
    pub fn test_unlocked_level(&self) -> Option<u32> {
        let idx = *self as u32;
        if idx % 2 == 1 && (1..=15).contains(&idx) {
            Some((idx - 1) / 2)
        } else {
            None
        }
    }

    /// Lock level for TEST_LOCKED states.
    pub fn test_locked_level(&self) -> Option<u32> {
        let idx = *self as u32;
        if idx % 2 == 0 && (2..=14).contains(&idx) {
            Some((idx - 2) / 2)
        } else {
            None
        }
    }

    /// 30-bit redundant encoding: the state value repeated in six 5-bit
    /// slots.
    pub fn encode(&self) -> u32 {
        let val = *self as u32;
        let mut result = 0;
        for slot in 0..ENCODE_SLOTS {
            result |= val << (slot * ENCODE_SLOT_BITS);
        }
        result
    }

    /// Decode a redundant encoding. Any value whose slots disagree, or whose
    /// slot value is out of range, maps to `Invalid`.
    pub fn decode(encoded: u32) -> LcState {
        let val = encoded & ENCODE_SLOT_MASK;
        for slot in 1..ENCODE_SLOTS {
            if (encoded >> (slot * ENCODE_SLOT_BITS)) & ENCODE_SLOT_MASK != val {
                return LcState::Invalid;
            }
        }
        if encoded >> (ENCODE_SLOTS * ENCODE_SLOT_BITS) != 0 {
            return LcState::Invalid;
        }
        LcState::try_from(val).unwrap_or(LcState::Invalid)
    }
}

/// Identity (secret partition) state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdState {
    Blank,
    Personalized,
    Invalid,
}

impl From<u32> for IdState {
    fn from(val: u32) -> Self {
        match val {
            0 => IdState::Blank,
            0x5555_5555 => IdState::Personalized,
            _ => IdState::Invalid,
        }
    }
}

impl From<IdState> for u32 {
    fn from(val: IdState) -> u32 {
        match val {
            IdState::Blank => 0,
            IdState::Personalized => 0x5555_5555,
            IdState::Invalid => 0xAAAA_AAAA,
        }
    }
}

/// SoC debug state, decoded from the OTP SoC-debug sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum SocDbgState {
    Raw = 0,
    PreProd = 1,
    Prod = 2,
}

/// Key manager diversification value derived from the lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyMgrDiv {
    Invalid,
    TestDevRma,
    Prod,
}

/// Token bucket selecting which hashed token (if any) authorizes a
/// transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(usize)]
pub enum TokenKind {
    Invalid = 0,
    Zero = 1,
    RawUnlock = 2,
    TestUnlock = 3,
    TestExit = 4,
    Rma = 5,
}

/// Number of token buckets.
pub const NUM_TOKEN_KINDS: usize = 6;

lazy_static! {
    /// The constant (current, target) -> token-kind table. Cells not covered
    /// by a rule are `TokenKind::Invalid`, which makes the transition
    /// unconditionally illegal regardless of any token supplied.
    pub static ref TRANSITION_MATRIX: [[TokenKind; NUM_PRODUCTIVE_STATES]; NUM_PRODUCTIVE_STATES] =
        build_transition_matrix();
}

fn build_transition_matrix() -> [[TokenKind; NUM_PRODUCTIVE_STATES]; NUM_PRODUCTIVE_STATES] {
    let mut matrix = [[TokenKind::Invalid; NUM_PRODUCTIVE_STATES]; NUM_PRODUCTIVE_STATES];
    for (from_idx, row) in matrix.iter_mut().enumerate() {
        for (to_idx, cell) in row.iter_mut().enumerate() {
            let from = LcState::try_from(from_idx as u32).unwrap();
            let to = LcState::try_from(to_idx as u32).unwrap();
            *cell = transition_token(from, to);
        }
    }
    matrix
}

fn transition_token(from: LcState, to: LcState) -> TokenKind {
    if from == LcState::Scrap {
        return TokenKind::Invalid;
    }
    if to == LcState::Scrap {
        return TokenKind::Zero;
    }
    if from == LcState::Raw {
        return if to.test_unlocked_level().is_some() {
            TokenKind::RawUnlock
        } else {
            TokenKind::Invalid
        };
    }
    if let Some(lock_level) = from.test_locked_level() {
        if let Some(unlock_level) = to.test_unlocked_level() {
            return if unlock_level > lock_level {
                TokenKind::TestUnlock
            } else {
                TokenKind::Invalid
            };
        }
        if matches!(to, LcState::Dev | LcState::Prod | LcState::ProdEnd) {
            return TokenKind::TestExit;
        }
        return TokenKind::Invalid;
    }
    if let Some(unlock_level) = from.test_unlocked_level() {
        if let Some(lock_level) = to.test_locked_level() {
            return if lock_level >= unlock_level {
                TokenKind::Zero
            } else {
                TokenKind::Invalid
            };
        }
        if let Some(to_level) = to.test_unlocked_level() {
            return if to_level > unlock_level {
                TokenKind::TestUnlock
            } else {
                TokenKind::Invalid
            };
        }
        if matches!(to, LcState::Dev | LcState::Prod | LcState::ProdEnd) {
            return TokenKind::TestExit;
        }
        if to == LcState::Rma {
            return TokenKind::Rma;
        }
        return TokenKind::Invalid;
    }
    match (from, to) {
        // Production ramp.
        (LcState::Dev, LcState::Prod) => TokenKind::TestExit,
        (LcState::Dev, LcState::Rma) | (LcState::Prod, LcState::Rma) => TokenKind::Rma,
        _ => TokenKind::Invalid,
    }
}

/// Capability broadcast bit assignments. Every peripheral receives this
/// bitmap as a bundle of one-bit wires.
pub mod broadcast {
    pub const RAW_TEST_RMA: u32 = 1 << 0;
    pub const DFT_EN: u32 = 1 << 1;
    pub const NVM_DEBUG_EN: u32 = 1 << 2;
    pub const HW_DEBUG_EN: u32 = 1 << 3;
    pub const CPU_EN: u32 = 1 << 4;
    pub const KEYMGR_EN: u32 = 1 << 5;
    pub const ESCALATE_EN: u32 = 1 << 6;
    pub const CHECK_BYP_EN: u32 = 1 << 7;
    pub const CREATOR_SEED_SW_RW_EN: u32 = 1 << 8;
    pub const OWNER_SEED_SW_RW_EN: u32 = 1 << 9;
    pub const ISO_PART_SW_RD_EN: u32 = 1 << 10;
    pub const ISO_PART_SW_WR_EN: u32 = 1 << 11;
    pub const SEED_HW_RD_EN: u32 = 1 << 12;
}

/// OTP word templates for the lifecycle sequences.
///
/// A sequence of length W encodes a small integer k as k "last" words
/// followed by (W - k) "first" words; k = 0 is the special all-zero
/// sequence. The lifecycle state uses k as the state index (RAW all-zero,
/// SCRAP all-"last"), the transition counter uses k as the count.
#[derive(Clone)]
pub struct LcTemplates {
    pub state_first: [u16; LC_STATE_WORDS],
    pub state_last: [u16; LC_STATE_WORDS],
    pub cnt_first: [u16; LC_CNT_WORDS],
    pub cnt_last: [u16; LC_CNT_WORDS],
    pub ownership_first: [u16; OWNERSHIP_WORDS],
    pub ownership_last: [u16; OWNERSHIP_WORDS],
    pub socdbg_first: [u16; SOC_DBG_WORDS],
    pub socdbg_last: [u16; SOC_DBG_WORDS],
}

fn sequence_words<const W: usize>(first: &[u16; W], last: &[u16; W], k: usize) -> [u16; W] {
    if k == 0 {
        return [0; W];
    }
    let mut words = *first;
    words[..k].copy_from_slice(&last[..k]);
    words
}

fn decode_sequence<const W: usize>(
    first: &[u16; W],
    last: &[u16; W],
    words: &[u16; W],
) -> Option<usize> {
    (0..=W).find(|&k| sequence_words(first, last, k) == *words)
}

impl LcTemplates {
    /// OTP words for a productive lifecycle state. Pseudo states have no OTP
    /// representation.
    pub fn state_words(&self, state: LcState) -> Option<[u16; LC_STATE_WORDS]> {
        if !state.is_productive() {
            return None;
        }
        Some(sequence_words(
            &self.state_first,
            &self.state_last,
            state as u32 as usize,
        ))
    }

    /// Match OTP words against the 21 state templates.
    pub fn decode_state(&self, words: &[u16; LC_STATE_WORDS]) -> Option<LcState> {
        decode_sequence(&self.state_first, &self.state_last, words)
            .and_then(|k| LcState::try_from(k as u32).ok())
    }

    /// OTP words for a transition count.
    pub fn cnt_words(&self, count: u32) -> Option<[u16; LC_CNT_WORDS]> {
        if count > MAX_TRANSITION_COUNT {
            return None;
        }
        Some(sequence_words(&self.cnt_first, &self.cnt_last, count as usize))
    }

    /// Match OTP words against the 25 counter templates.
    pub fn decode_cnt(&self, words: &[u16; LC_CNT_WORDS]) -> Option<u32> {
        decode_sequence(&self.cnt_first, &self.cnt_last, words).map(|k| k as u32)
    }

    /// OTP words for an ownership level.
    pub fn ownership_words(&self, level: u32) -> Option<[u16; OWNERSHIP_WORDS]> {
        if level > OWNERSHIP_WORDS as u32 {
            return None;
        }
        Some(sequence_words(
            &self.ownership_first,
            &self.ownership_last,
            level as usize,
        ))
    }

    /// Match OTP words against the ownership templates.
    pub fn decode_ownership(&self, words: &[u16; OWNERSHIP_WORDS]) -> Option<u32> {
        decode_sequence(&self.ownership_first, &self.ownership_last, words).map(|k| k as u32)
    }

    /// OTP words for a SoC debug state.
    pub fn socdbg_words(&self, state: SocDbgState) -> [u16; SOC_DBG_WORDS] {
        sequence_words(&self.socdbg_first, &self.socdbg_last, state as u32 as usize)
    }

    /// Match OTP words against the SoC debug templates.
    pub fn decode_socdbg(&self, words: &[u16; SOC_DBG_WORDS]) -> Option<SocDbgState> {
        decode_sequence(&self.socdbg_first, &self.socdbg_last, words)
            .and_then(|k| SocDbgState::try_from(k as u32).ok())
    }
}
