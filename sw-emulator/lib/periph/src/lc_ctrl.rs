/*++

Licensed under the Apache-2.0 license.

File Name:

    lc_ctrl.rs

Abstract:

    File contains the lifecycle controller implementation: register file with
    SW and DMI apertures, the transition FSM, token validation and capability
    broadcast.

--*/

use std::cell::RefCell;
use std::rc::Rc;

use sentinel_emu_bus::{ActionHandle, Bus, BusError, Clock, Signal, Timer};
use sentinel_emu_derive::Bus;
use sentinel_emu_types::{RvAddr, RvData, RvSize};
use smlang::statemachine;
use tock_registers::{register_bitfields, LocalRegisterCopy};

use crate::config::SocConfig;
use crate::helpers::{bytes_from_words_le, MUBI8_TRUE};
use crate::kmac::Kmac;
use crate::lifecycle::{
    broadcast, IdState, KeyMgrDiv, LcState, SocDbgState, TokenKind, NUM_TOKEN_KINDS,
    TRANSITION_MATRIX,
};
use crate::otp_ctrl::{OtpCtrl, OtpError, OtpProgram};
use crate::pwr_mgr::{event, PwrEventLatch};

/// The number of clock cycles between FSM steps.
const LC_STEP_TICKS: u64 = 4;

/// Registers in the per-interface exclusive window (four token words plus
/// the transition target).
const EXCLUSIVE_COUNT: usize = 5;
const XREG_TARGET: usize = 4;

register_bitfields! [
    u32,

    /// Status Register Fields
    pub Status [
        INITIALIZED OFFSET(0) NUMBITS(1) [],
        READY OFFSET(1) NUMBITS(1) [],
        EXT_CLOCK_SWITCHED OFFSET(2) NUMBITS(1) [],
        TRANSITION_SUCCESSFUL OFFSET(3) NUMBITS(1) [],
        TRANSITION_COUNT_ERROR OFFSET(4) NUMBITS(1) [],
        TRANSITION_ERROR OFFSET(5) NUMBITS(1) [],
        TOKEN_ERROR OFFSET(6) NUMBITS(1) [],
        FLASH_RMA_ERROR OFFSET(7) NUMBITS(1) [],
        OTP_ERROR OFFSET(8) NUMBITS(1) [],
        STATE_ERROR OFFSET(9) NUMBITS(1) [],
        BUS_INTEG_ERROR OFFSET(10) NUMBITS(1) [],
        OTP_PARTITION_ERROR OFFSET(11) NUMBITS(1) [],
    ],

    /// Transition Control Register Fields
    pub TransitionCtrl [
        EXT_CLOCK_EN OFFSET(0) NUMBITS(1) [],
        VOLATILE_RAW_UNLOCK OFFSET(1) NUMBITS(1) [],
    ],
];

type StatusRegister = LocalRegisterCopy<u32, Status::Register>;

/// Internal init-error bitmap. Any nonzero value forces the FSM to
/// `Invalid` and withholds INITIALIZED / READY.
mod init_error {
    pub const STATE_DECODE: u32 = 1 << 0;
    pub const CNT_DECODE: u32 = 1 << 1;
    pub const PARTITION: u32 = 1 << 2;
    pub const ID_STATE: u32 = 1 << 3;
    pub const CNT_ZERO: u32 = 1 << 4;
}

/// Lifecycle controller FSM state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LcCtrlFsm {
    Reset,
    Idle,
    ClkMux,
    CntIncr,
    CntProg,
    TransCheck,
    TokenHash,
    FlashRma,
    TokenCheck0,
    TokenCheck1,
    TransProg,
    PostTrans,
    Scrap,
    Escalate,
    Invalid,
}

/// The interface issuing the current register access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LcCtrlRequester {
    Sw = 0,
    Dmi = 1,
}

statemachine! {
    transitions: {
        // CurrentState Event [guard] / action = NextState

        *Unclaimed + Claim(LcCtrlRequester) / set_owner = Claimed,

        // Re-writing the claim pattern is idempotent for the owner.
        Claimed + Claim(LcCtrlRequester) [is_owner] = Claimed,

        Claimed + Release(LcCtrlRequester) [is_owner] / clear_owner = Unclaimed,
    }
}

/// Mutex state machine extended variables.
pub struct Context {
    owner: Option<LcCtrlRequester>,
}

impl StateMachineContext for Context {
    fn is_owner(&mut self, requester: &LcCtrlRequester) -> Result<(), ()> {
        if self.owner == Some(*requester) {
            Ok(())
        } else {
            Err(())
        }
    }

    fn set_owner(&mut self, requester: &LcCtrlRequester) {
        self.owner = Some(*requester);
    }

    fn clear_owner(&mut self, _requester: &LcCtrlRequester) {
        self.owner = None;
    }
}

/// Lifecycle controller register file, shared between the SW and DMI
/// apertures. The exclusive window 0x1C..=0x2C is backed per interface; all
/// other registers share storage.
#[derive(Bus)]
#[poll_fn(poll)]
#[cold_reset_fn(cold_reset)]
pub struct LcCtrlRegs {
    #[register(offset = 0x0000_0000, read_fn = on_read_alert_test, write_fn = on_write_alert_test)]
    #[register(offset = 0x0000_0004, read_fn = on_read_status, write_fn = on_write_read_only)]
    #[register(offset = 0x0000_0008, read_fn = on_read_claim_regwen, write_fn = on_write_claim_regwen)]
    #[register(offset = 0x0000_000c, read_fn = on_read_claim, write_fn = on_write_claim)]
    #[register(offset = 0x0000_0010, read_fn = on_read_transition_regwen, write_fn = on_write_read_only)]
    #[register(offset = 0x0000_0014, read_fn = on_read_write_only, write_fn = on_write_transition_cmd)]
    #[register(offset = 0x0000_0018, read_fn = on_read_transition_ctrl, write_fn = on_write_transition_ctrl)]
    #[register_array(offset = 0x0000_001c, item_size = 4, len = 4, read_fn = on_read_token, write_fn = on_write_token)]
    #[register(offset = 0x0000_002c, read_fn = on_read_target, write_fn = on_write_target)]
    #[register(offset = 0x0000_0030, read_fn = on_read_vendor_test_ctrl, write_fn = on_write_vendor_test_ctrl)]
    #[register(offset = 0x0000_0034, read_fn = on_read_vendor_test_status, write_fn = on_write_read_only)]
    #[register(offset = 0x0000_0038, read_fn = on_read_lc_state, write_fn = on_write_read_only)]
    #[register(offset = 0x0000_003c, read_fn = on_read_transition_cnt, write_fn = on_write_read_only)]
    #[register(offset = 0x0000_0040, read_fn = on_read_id_state, write_fn = on_write_read_only)]
    #[register(offset = 0x0000_0044, read_fn = on_read_hw_revision0, write_fn = on_write_read_only)]
    #[register(offset = 0x0000_0048, read_fn = on_read_hw_revision1, write_fn = on_write_read_only)]
    #[register_array(offset = 0x0000_004c, item_size = 4, len = 8, read_fn = on_read_device_id, write_fn = on_write_read_only_array)]
    #[register_array(offset = 0x0000_006c, item_size = 4, len = 8, read_fn = on_read_manuf_state, write_fn = on_write_read_only_array)]
    _fieldless_regs: (),

    /// Interface issuing the current access
    requester: LcCtrlRequester,

    /// Transition mutex
    mutex: StateMachine<Context>,

    /// RW0C gate over mutex claims
    claim_regwen: bool,

    /// Latched alert-test lines
    alert_test: u32,

    /// STATUS register
    status: StatusRegister,

    /// Sticky external clock request
    ext_clock_en: bool,

    /// Per-interface volatile raw unlock enables
    volatile_raw_unlock: [bool; 2],

    /// Per-interface exclusive window storage
    xregs: [[u32; EXCLUSIVE_COUNT]; 2],

    vendor_test_ctrl: u32,

    /// FSM state
    fsm: LcCtrlFsm,

    /// Decoded lifecycle state
    lc_state: LcState,

    /// Decoded transition count
    lc_cnt: u32,

    /// Decoded identity state
    id_state: IdState,

    /// Init-error bitmap
    init_error_mask: u32,

    /// Count waiting for the first OTP program ack
    pending_cnt: u32,

    /// Target of the in-flight transition
    pending_target: LcState,

    /// Interface that started the in-flight transition
    transition_requester: LcCtrlRequester,

    /// Digest of the user-supplied token, once KMAC returns it
    pending_digest: Option<[u8; 16]>,

    /// Hashed token table (ZERO and RAW_UNLOCK are computed locally, the
    /// rest imported from OTP)
    hashed_tokens: [[u8; 16]; NUM_TOKEN_KINDS],

    /// Bitmap over `TokenKind` of provisioned tokens
    token_valid: u8,

    device_id: [u32; 8],
    manuf_state: [u32; 8],

    /// Substitute the RAW template words at init time
    force_raw: bool,

    config: SocConfig,
    otp: Rc<RefCell<OtpCtrl>>,
    kmac: Rc<RefCell<Kmac>>,
    events: Rc<RefCell<PwrEventLatch>>,

    /// Capability broadcast wires
    broadcast: Rc<RefCell<Signal<u32>>>,

    /// Key manager diversification wire
    keymgr_div: Rc<RefCell<Signal<KeyMgrDiv>>>,

    /// SoC debug state wire
    socdbg_tx: Rc<RefCell<Signal<u32>>>,

    /// Timer
    timer: Timer,

    /// FSM step action
    step_action: Option<ActionHandle>,
}

impl LcCtrlRegs {
    pub fn new(
        clock: &Clock,
        config: SocConfig,
        otp: Rc<RefCell<OtpCtrl>>,
        kmac: Rc<RefCell<Kmac>>,
        events: Rc<RefCell<PwrEventLatch>>,
    ) -> Self {
        Self {
            _fieldless_regs: (),
            requester: LcCtrlRequester::Sw,
            mutex: StateMachine::new(Context { owner: None }),
            claim_regwen: true,
            alert_test: 0,
            status: LocalRegisterCopy::new(0),
            ext_clock_en: false,
            volatile_raw_unlock: [false; 2],
            xregs: [[0; EXCLUSIVE_COUNT]; 2],
            vendor_test_ctrl: 0,
            fsm: LcCtrlFsm::Reset,
            lc_state: LcState::Invalid,
            lc_cnt: 0,
            id_state: IdState::Blank,
            init_error_mask: 0,
            pending_cnt: 0,
            pending_target: LcState::Invalid,
            transition_requester: LcCtrlRequester::Sw,
            pending_digest: None,
            hashed_tokens: [[0; 16]; NUM_TOKEN_KINDS],
            token_valid: 0,
            device_id: [0; 8],
            manuf_state: [0; 8],
            force_raw: false,
            config,
            otp,
            kmac,
            events,
            broadcast: Rc::new(RefCell::new(Signal::new(0))),
            keymgr_div: Rc::new(RefCell::new(Signal::new(KeyMgrDiv::Invalid))),
            socdbg_tx: Rc::new(RefCell::new(Signal::new(SocDbgState::Raw as u32))),
            timer: Timer::new(clock),
            step_action: None,
        }
    }

    /// Tag the interface for the next access.
    pub fn request(&mut self, requester: LcCtrlRequester) {
        self.requester = requester;
    }

    /// Assert the force-raw input wire. Takes effect at the next init.
    pub fn set_force_raw(&mut self, force_raw: bool) {
        self.force_raw = force_raw;
    }

    pub fn fsm(&self) -> LcCtrlFsm {
        self.fsm
    }

    pub fn lc_state(&self) -> LcState {
        self.lc_state
    }

    pub fn transition_count(&self) -> u32 {
        self.lc_cnt
    }

    pub fn status_bits(&self) -> u32 {
        self.status.get()
    }

    pub fn alert_test_bits(&self) -> u32 {
        self.alert_test
    }

    pub fn broadcast_signal(&self) -> Rc<RefCell<Signal<u32>>> {
        self.broadcast.clone()
    }

    pub fn keymgr_div_signal(&self) -> Rc<RefCell<Signal<KeyMgrDiv>>> {
        self.keymgr_div.clone()
    }

    pub fn socdbg_signal(&self) -> Rc<RefCell<Signal<u32>>> {
        self.socdbg_tx.clone()
    }

    fn owner(&self) -> Option<LcCtrlRequester> {
        self.mutex.context.owner
    }

    fn is_owner(&self) -> bool {
        self.owner() == Some(self.requester)
    }

    /// TRANSITION_REGWEN level for the current requester.
    fn transition_regwen(&self) -> bool {
        self.is_owner() && self.fsm == LcCtrlFsm::Idle
    }

    fn xreg_token_bytes(&self, requester: LcCtrlRequester) -> [u8; 16] {
        let xregs = &self.xregs[requester as usize];
        bytes_from_words_le(&[xregs[0], xregs[1], xregs[2], xregs[3]])
    }

    // ------------------------------------------------------------------
    // Register callbacks
    // ------------------------------------------------------------------

    fn on_read_alert_test(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        println!("[lc_ctrl] read of write-only ALERT_TEST register");
        Ok(0)
    }

    fn on_write_alert_test(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        self.alert_test |= val & 0x7;
        Ok(())
    }

    fn on_read_status(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        Ok(self.status.get())
    }

    fn on_write_read_only(&mut self, size: RvSize, _val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        println!("[lc_ctrl] write to read-only register ignored");
        Ok(())
    }

    fn on_write_read_only_array(
        &mut self,
        size: RvSize,
        _index: usize,
        _val: RvData,
    ) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        println!("[lc_ctrl] write to read-only register ignored");
        Ok(())
    }

    fn on_read_write_only(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        println!("[lc_ctrl] read of write-only register");
        Ok(0)
    }

    fn on_read_claim_regwen(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        Ok(self.claim_regwen as u32)
    }

    fn on_write_claim_regwen(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        // RW0C: software can only clear.
        if val & 1 == 0 {
            self.claim_regwen = false;
        }
        Ok(())
    }

    fn on_read_claim(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        if self.is_owner() {
            Ok(MUBI8_TRUE)
        } else {
            Ok(0)
        }
    }

    fn on_write_claim(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        if !self.claim_regwen {
            println!("[lc_ctrl] mutex claim blocked by CLAIM_TRANSITION_IF_REGWEN");
            return Ok(());
        }
        if (val & 0xff) == MUBI8_TRUE {
            let _ = self.mutex.process_event(Events::Claim(self.requester));
        } else {
            let _ = self.mutex.process_event(Events::Release(self.requester));
        }
        Ok(())
    }

    fn on_read_transition_regwen(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        Ok(self.transition_regwen() as u32)
    }

    fn on_write_transition_cmd(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        if val & 1 == 0 {
            return Ok(());
        }
        if !self.transition_regwen() {
            println!("[lc_ctrl] TRANSITION_CMD.START ignored (no mutex or FSM busy)");
            return Ok(());
        }
        self.start_transition();
        Ok(())
    }

    fn on_read_transition_ctrl(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        let mut reg = LocalRegisterCopy::<u32, TransitionCtrl::Register>::new(0);
        reg.modify(TransitionCtrl::EXT_CLOCK_EN.val(self.ext_clock_en as u32));
        reg.modify(
            TransitionCtrl::VOLATILE_RAW_UNLOCK
                .val(self.volatile_raw_unlock[self.requester as usize] as u32),
        );
        Ok(reg.get())
    }

    fn on_write_transition_ctrl(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        if !self.transition_regwen() {
            println!("[lc_ctrl] TRANSITION_CTRL write ignored (no mutex or FSM busy)");
            return Ok(());
        }
        let reg = LocalRegisterCopy::<u32, TransitionCtrl::Register>::new(val);
        // EXT_CLOCK_EN is sticky; only a reset clears it.
        if reg.is_set(TransitionCtrl::EXT_CLOCK_EN) {
            self.ext_clock_en = true;
        }
        if self.config.volatile_raw_unlock {
            self.volatile_raw_unlock[self.requester as usize] =
                reg.is_set(TransitionCtrl::VOLATILE_RAW_UNLOCK);
        }
        Ok(())
    }

    fn on_read_token(&mut self, size: RvSize, index: usize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        if self.is_owner() {
            Ok(self.xregs[self.requester as usize][index])
        } else {
            Ok(0)
        }
    }

    fn on_write_token(&mut self, size: RvSize, index: usize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        if self.transition_regwen() {
            self.xregs[self.requester as usize][index] = val;
        } else {
            println!("[lc_ctrl] TRANSITION_TOKEN write ignored (no mutex or FSM busy)");
        }
        Ok(())
    }

    fn on_read_target(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        if self.is_owner() {
            Ok(self.xregs[self.requester as usize][XREG_TARGET])
        } else {
            Ok(0)
        }
    }

    fn on_write_target(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        if self.transition_regwen() {
            self.xregs[self.requester as usize][XREG_TARGET] = val;
        } else {
            println!("[lc_ctrl] TRANSITION_TARGET write ignored (no mutex or FSM busy)");
        }
        Ok(())
    }

    fn on_read_vendor_test_ctrl(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        Ok(self.vendor_test_ctrl)
    }

    fn on_write_vendor_test_ctrl(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        if self.transition_regwen() {
            self.vendor_test_ctrl = val;
        } else {
            println!("[lc_ctrl] OTP_VENDOR_TEST_CTRL write ignored (no mutex or FSM busy)");
        }
        Ok(())
    }

    fn on_read_vendor_test_status(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        Ok(0)
    }

    fn on_read_lc_state(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        Ok(self.reported_state().encode())
    }

    fn on_read_transition_cnt(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        Ok(self.lc_cnt)
    }

    fn on_read_id_state(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        Ok(self.id_state.into())
    }

    fn on_read_hw_revision0(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        Ok(self.config.hw_revision0())
    }

    fn on_read_hw_revision1(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        Ok(self.config.hw_revision1())
    }

    fn on_read_device_id(&mut self, size: RvSize, index: usize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        Ok(self.device_id[index])
    }

    fn on_read_manuf_state(&mut self, size: RvSize, index: usize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        Ok(self.manuf_state[index])
    }

    fn word_sized_read(size: RvSize) -> Result<(), BusError> {
        if size != RvSize::Word {
            Err(BusError::LoadAccessFault)?
        }
        Ok(())
    }

    fn word_sized_write(size: RvSize) -> Result<(), BusError> {
        if size != RvSize::Word {
            Err(BusError::StoreAccessFault)?
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    /// Power manager `lc_req` wire: load the lifecycle partition out of OTP
    /// and bring the FSM out of reset. Raises `lc_done` when finished.
    pub fn initialize(&mut self) {
        let bundle = self.otp.borrow().init_read();

        let state_words = if self.force_raw {
            [0u16; crate::lifecycle::LC_STATE_WORDS]
        } else {
            bundle.lc_state_words
        };

        self.id_state = IdState::from(bundle.secret_valid);
        self.device_id = bundle.device_id;
        self.manuf_state = bundle.manuf_state;

        // ZERO and RAW_UNLOCK hashes are computed locally at realization;
        // the secret tokens come out of OTP.
        self.hashed_tokens[TokenKind::Zero as usize] = Kmac::hash_token(&[0u8; 16]);
        self.hashed_tokens[TokenKind::RawUnlock as usize] =
            Kmac::hash_token(&self.config.raw_unlock_token);
        self.token_valid = (1 << TokenKind::Zero as usize) | (1 << TokenKind::RawUnlock as usize);
        for kind in [TokenKind::TestUnlock, TokenKind::TestExit, TokenKind::Rma] {
            if bundle.token_valid & (1 << kind as usize) != 0 {
                self.hashed_tokens[kind as usize] = bundle.hashed_tokens[kind as usize];
                self.token_valid |= 1 << kind as usize;
            }
        }

        let mut errors = 0u32;
        let state = match self.config.templates.decode_state(&state_words) {
            Some(state) => state,
            None => {
                errors |= init_error::STATE_DECODE;
                LcState::Invalid
            }
        };
        let count = match self.config.templates.decode_cnt(&bundle.lc_cnt_words) {
            Some(count) => count,
            None => {
                errors |= init_error::CNT_DECODE;
                0
            }
        };
        if !bundle.lc_valid {
            errors |= init_error::PARTITION;
        }
        match self.id_state {
            // A personalized secret partition is only consistent with the
            // provisioned-product states.
            IdState::Personalized => {
                if !matches!(
                    state,
                    LcState::Dev | LcState::Prod | LcState::ProdEnd | LcState::Rma | LcState::Scrap
                ) {
                    errors |= init_error::ID_STATE;
                }
            }
            IdState::Invalid => errors |= init_error::ID_STATE,
            IdState::Blank => {}
        }
        if state != LcState::Raw && count == 0 && errors & init_error::CNT_DECODE == 0 {
            errors |= init_error::CNT_ZERO;
        }

        if errors != 0 {
            println!("[lc_ctrl] init failed, error mask {errors:#x}");
            self.init_error_mask = errors;
            self.status.modify(Status::STATE_ERROR::SET);
            if errors & init_error::PARTITION != 0 {
                self.status.modify(Status::OTP_PARTITION_ERROR::SET);
            }
            self.fsm = LcCtrlFsm::Invalid;
        } else {
            self.lc_state = state;
            self.lc_cnt = count;
            self.status.modify(Status::READY::SET);
            self.status.modify(Status::INITIALIZED::SET);
            self.fsm = if state == LcState::Scrap {
                LcCtrlFsm::Scrap
            } else {
                LcCtrlFsm::Idle
            };
        }

        if self.config.socdbg {
            let socdbg = self
                .config
                .templates
                .decode_socdbg(&bundle.socdbg_words)
                .unwrap_or(SocDbgState::Raw);
            self.socdbg_tx.borrow_mut().set(socdbg as u32);
        }

        self.update_broadcast();
        self.events.borrow_mut().raise(event::LC_DONE);
    }

    /// Escalation input: absorbing. Only a device reset recovers.
    pub fn escalate(&mut self) {
        self.fsm = LcCtrlFsm::Escalate;
        self.update_broadcast();
    }

    // ------------------------------------------------------------------
    // Transition FSM
    // ------------------------------------------------------------------

    fn start_transition(&mut self) {
        let requester = self.requester;
        let target = LcState::decode(self.xregs[requester as usize][XREG_TARGET]);

        if self.volatile_raw_unlock[requester as usize]
            && (self.lc_state == LcState::Raw || target == LcState::TestUnlocked0)
        {
            self.volatile_raw_unlock_transition(requester, target);
            return;
        }

        self.pending_target = target;
        self.transition_requester = requester;
        self.pending_digest = None;
        self.set_fsm(LcCtrlFsm::ClkMux);
        self.schedule_step();
    }

    /// Volatile RAW unlock: the token registers carry the pre-hashed unlock
    /// token and the new state is not programmed to OTP. The FSM never
    /// leaves IDLE on success.
    fn volatile_raw_unlock_transition(&mut self, requester: LcCtrlRequester, target: LcState) {
        if self.lc_state != LcState::Raw || target != LcState::TestUnlocked0 {
            self.status.modify(Status::TRANSITION_ERROR::SET);
            self.enter_post_trans();
            return;
        }
        let provided = self.xreg_token_bytes(requester);
        if provided != self.hashed_tokens[TokenKind::RawUnlock as usize] {
            self.status.modify(Status::TOKEN_ERROR::SET);
            self.status.modify(Status::TRANSITION_ERROR::SET);
            self.enter_post_trans();
            return;
        }
        self.lc_state = LcState::TestUnlocked0;
        self.lc_cnt = self.lc_cnt.max(1);
        self.status.modify(Status::TRANSITION_SUCCESSFUL::SET);
        self.update_broadcast();
    }

    fn set_fsm(&mut self, fsm: LcCtrlFsm) {
        self.fsm = fsm;
        self.update_broadcast();
    }

    fn schedule_step(&mut self) {
        self.step_action = Some(self.timer.schedule_poll_in(LC_STEP_TICKS));
    }

    fn enter_post_trans(&mut self) {
        // The interface sees READY=0 until the next device reset.
        self.status.modify(Status::READY::CLEAR);
        self.set_fsm(LcCtrlFsm::PostTrans);
    }

    /// True for states allowed to switch to the external clock.
    fn ext_clock_capable(&self) -> bool {
        self.lc_state == LcState::Raw
            || self.lc_state == LcState::Rma
            || self.lc_state.test_unlocked_level().is_some()
            || self.lc_state.test_locked_level().is_some()
    }

    fn fsm_step(&mut self) {
        match self.fsm {
            LcCtrlFsm::ClkMux => {
                if self.ext_clock_en && self.ext_clock_capable() {
                    self.status.modify(Status::EXT_CLOCK_SWITCHED::SET);
                }
                self.set_fsm(LcCtrlFsm::CntIncr);
                self.schedule_step();
            }
            LcCtrlFsm::CntIncr => {
                if self.lc_cnt >= crate::lifecycle::MAX_TRANSITION_COUNT {
                    self.status.modify(Status::TRANSITION_COUNT_ERROR::SET);
                    self.enter_post_trans();
                    return;
                }
                // A transition into SCRAP burns the counter to its ceiling.
                self.pending_cnt = if self.pending_target == LcState::Scrap {
                    crate::lifecycle::MAX_TRANSITION_COUNT
                } else {
                    self.lc_cnt + 1
                };
                let words = self
                    .config
                    .templates
                    .cnt_words(self.pending_cnt)
                    .expect("pending count is bounded by the ceiling");
                self.set_fsm(LcCtrlFsm::CntProg);
                self.otp.borrow_mut().program(OtpProgram::Counter(words));
            }
            LcCtrlFsm::TransCheck => {
                let target = self.pending_target;
                let kind = if target.is_productive() {
                    TRANSITION_MATRIX[self.lc_state as usize][target as usize]
                } else {
                    TokenKind::Invalid
                };
                if kind == TokenKind::Invalid {
                    self.status.modify(Status::TRANSITION_ERROR::SET);
                    self.enter_post_trans();
                    return;
                }
                self.set_fsm(LcCtrlFsm::TokenHash);
                let token = self.xreg_token_bytes(self.transition_requester);
                let mut kmac = self.kmac.borrow_mut();
                kmac.absorb(token[..8].try_into().unwrap(), false);
                kmac.absorb(token[8..].try_into().unwrap(), true);
            }
            LcCtrlFsm::TokenCheck0 => {
                if self.token_check() {
                    self.set_fsm(LcCtrlFsm::TokenCheck1);
                    self.schedule_step();
                }
            }
            LcCtrlFsm::TokenCheck1 => {
                // Redundant second comparison of the same digest.
                if self.token_check() {
                    if self.pending_target == LcState::Rma {
                        self.set_fsm(LcCtrlFsm::FlashRma);
                        self.schedule_step();
                    } else {
                        self.program_target_state();
                    }
                }
            }
            LcCtrlFsm::FlashRma => {
                println!("[lc_ctrl] flash RMA wipe not modeled, continuing");
                self.program_target_state();
            }
            _ => {}
        }
    }

    /// Compare the hashed user token against the bucket selected by the
    /// transition matrix. On mismatch latches TOKEN_ERROR and enters
    /// POST_TRANS; returns false.
    fn token_check(&mut self) -> bool {
        let kind = TRANSITION_MATRIX[self.lc_state as usize][self.pending_target as usize];
        let provisioned = self.token_valid & (1 << kind as usize) != 0;
        let matches = provisioned
            && self.pending_digest == Some(self.hashed_tokens[kind as usize]);
        if !matches {
            self.status.modify(Status::TOKEN_ERROR::SET);
            self.enter_post_trans();
            return false;
        }
        true
    }

    fn program_target_state(&mut self) {
        let words = self
            .config
            .templates
            .state_words(self.pending_target)
            .expect("target was validated against the transition matrix");
        self.set_fsm(LcCtrlFsm::TransProg);
        self.otp.borrow_mut().program(OtpProgram::State(words));
    }

    fn on_otp_ack(&mut self, result: Result<(), OtpError>) {
        match self.fsm {
            LcCtrlFsm::CntProg => match result {
                Ok(()) => {
                    self.lc_cnt = self.pending_cnt;
                    self.set_fsm(LcCtrlFsm::TransCheck);
                    self.schedule_step();
                }
                Err(OtpError::Rejected) => {
                    self.status.modify(Status::STATE_ERROR::SET);
                    self.enter_post_trans();
                }
                Err(OtpError::Failed) => {
                    self.status.modify(Status::OTP_ERROR::SET);
                    self.enter_post_trans();
                }
            },
            LcCtrlFsm::TransProg => {
                match result {
                    Ok(()) => {
                        self.status.modify(Status::TRANSITION_SUCCESSFUL::SET);
                    }
                    Err(OtpError::Rejected) => {
                        self.status.modify(Status::STATE_ERROR::SET);
                    }
                    Err(OtpError::Failed) => {
                        self.status.modify(Status::OTP_ERROR::SET);
                    }
                }
                self.enter_post_trans();
            }
            _ => {}
        }
    }

    /// Called by Bus::poll() to indicate that time has passed.
    fn poll(&mut self) {
        self.kmac.borrow_mut().poll();

        if self.timer.fired(&mut self.step_action) {
            self.fsm_step();
        }

        match self.fsm {
            LcCtrlFsm::CntProg | LcCtrlFsm::TransProg => {
                let ack = self.otp.borrow_mut().take_ack();
                if let Some(result) = ack {
                    self.on_otp_ack(result);
                }
            }
            LcCtrlFsm::TokenHash => {
                let response = self.kmac.borrow_mut().take_response();
                if let Some(shares) = response {
                    self.pending_digest = Some(shares.combine());
                    self.set_fsm(LcCtrlFsm::TokenCheck0);
                    self.schedule_step();
                }
            }
            LcCtrlFsm::Escalate => {
                // Completions arriving after escalation are ignored.
                let _ = self.otp.borrow_mut().take_ack();
                let _ = self.kmac.borrow_mut().take_response();
            }
            _ => {}
        }
    }

    fn cold_reset(&mut self) {
        if let Some(action) = self.step_action.take() {
            self.timer.cancel(action);
        }
        self.kmac.borrow_mut().reset();
        self.mutex = StateMachine::new(Context { owner: None });
        self.claim_regwen = true;
        self.alert_test = 0;
        self.status = LocalRegisterCopy::new(0);
        self.ext_clock_en = false;
        self.volatile_raw_unlock = [false; 2];
        self.xregs = [[0; EXCLUSIVE_COUNT]; 2];
        self.vendor_test_ctrl = 0;
        self.fsm = LcCtrlFsm::Reset;
        self.lc_state = LcState::Invalid;
        self.lc_cnt = 0;
        self.id_state = IdState::Blank;
        self.init_error_mask = 0;
        self.pending_digest = None;
        self.update_broadcast();
    }

    // ------------------------------------------------------------------
    // Broadcast
    // ------------------------------------------------------------------

    fn update_broadcast(&mut self) {
        let (bits, div) = self.compute_broadcast();
        self.broadcast.borrow_mut().set(bits);
        self.keymgr_div.borrow_mut().set(div);
        // Wake consumers so they observe the new levels.
        self.timer.schedule_poll_in(1);
    }

    fn compute_broadcast(&self) -> (u32, KeyMgrDiv) {
        use broadcast::*;

        match self.fsm {
            LcCtrlFsm::Reset => return (0, KeyMgrDiv::Invalid),
            LcCtrlFsm::PostTrans
            | LcCtrlFsm::Scrap
            | LcCtrlFsm::Escalate
            | LcCtrlFsm::Invalid => return (ESCALATE_EN, KeyMgrDiv::Invalid),
            _ => {}
        }

        let seed_bits = match self.id_state {
            IdState::Blank => CREATOR_SEED_SW_RW_EN,
            IdState::Personalized => SEED_HW_RD_EN,
            IdState::Invalid => 0,
        };

        match self.lc_state {
            LcState::Raw => (RAW_TEST_RMA, KeyMgrDiv::Invalid),
            state if state.test_locked_level().is_some() => (RAW_TEST_RMA, KeyMgrDiv::Invalid),
            LcState::TestUnlocked7 => (
                RAW_TEST_RMA | DFT_EN | HW_DEBUG_EN | CPU_EN | ISO_PART_SW_WR_EN,
                KeyMgrDiv::TestDevRma,
            ),
            state if state.test_unlocked_level().is_some() => (
                RAW_TEST_RMA | DFT_EN | NVM_DEBUG_EN | HW_DEBUG_EN | CPU_EN | ISO_PART_SW_WR_EN,
                KeyMgrDiv::TestDevRma,
            ),
            LcState::Dev => (
                HW_DEBUG_EN
                    | CPU_EN
                    | KEYMGR_EN
                    | OWNER_SEED_SW_RW_EN
                    | ISO_PART_SW_WR_EN
                    | seed_bits,
                KeyMgrDiv::TestDevRma,
            ),
            LcState::Prod | LcState::ProdEnd => (
                CPU_EN
                    | KEYMGR_EN
                    | OWNER_SEED_SW_RW_EN
                    | ISO_PART_SW_RD_EN
                    | ISO_PART_SW_WR_EN
                    | seed_bits,
                KeyMgrDiv::Prod,
            ),
            LcState::Rma => (
                RAW_TEST_RMA
                    | DFT_EN
                    | NVM_DEBUG_EN
                    | HW_DEBUG_EN
                    | CPU_EN
                    | KEYMGR_EN
                    | CHECK_BYP_EN
                    | CREATOR_SEED_SW_RW_EN
                    | OWNER_SEED_SW_RW_EN
                    | SEED_HW_RD_EN
                    | ISO_PART_SW_RD_EN
                    | ISO_PART_SW_WR_EN,
                KeyMgrDiv::TestDevRma,
            ),
            // SCRAP is handled through the FSM state above; pseudo states
            // never reach here.
            _ => (ESCALATE_EN, KeyMgrDiv::Invalid),
        }
    }

    fn reported_state(&self) -> LcState {
        match self.fsm {
            LcCtrlFsm::PostTrans => LcState::PostTransition,
            LcCtrlFsm::Escalate => LcState::Escalate,
            LcCtrlFsm::Invalid => LcState::Invalid,
            _ => self.lc_state,
        }
    }
}

/// SW (core firmware) aperture of the lifecycle controller.
#[derive(Clone)]
pub struct LcCtrl {
    pub regs: Rc<RefCell<LcCtrlRegs>>,
}

impl LcCtrl {
    pub fn new(regs: Rc<RefCell<LcCtrlRegs>>) -> Self {
        Self { regs }
    }
}

impl Bus for LcCtrl {
    fn read(&mut self, size: RvSize, addr: RvAddr) -> Result<RvData, BusError> {
        self.regs.borrow_mut().request(LcCtrlRequester::Sw);
        self.regs.borrow_mut().read(size, addr)
    }

    fn write(&mut self, size: RvSize, addr: RvAddr, val: RvData) -> Result<(), BusError> {
        self.regs.borrow_mut().request(LcCtrlRequester::Sw);
        self.regs.borrow_mut().write(size, addr, val)
    }

    fn poll(&mut self) {
        self.regs.borrow_mut().poll();
    }

    fn cold_reset(&mut self) {
        self.regs.borrow_mut().cold_reset();
    }
}

/// DMI (debug) aperture of the lifecycle controller.
#[derive(Clone)]
pub struct LcCtrlDmi {
    pub regs: Rc<RefCell<LcCtrlRegs>>,
}

impl LcCtrlDmi {
    pub fn new(regs: Rc<RefCell<LcCtrlRegs>>) -> Self {
        Self { regs }
    }
}

impl Bus for LcCtrlDmi {
    fn read(&mut self, size: RvSize, addr: RvAddr) -> Result<RvData, BusError> {
        self.regs.borrow_mut().request(LcCtrlRequester::Dmi);
        self.regs.borrow_mut().read(size, addr)
    }

    fn write(&mut self, size: RvSize, addr: RvAddr, val: RvData) -> Result<(), BusError> {
        self.regs.borrow_mut().request(LcCtrlRequester::Dmi);
        self.regs.borrow_mut().write(size, addr, val)
    }

    fn poll(&mut self) {
        // The shared register file is polled through the SW aperture.
    }

    fn cold_reset(&mut self) {
        // The shared register file is reset through the SW aperture.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocProperties;
    use crate::helpers::words_from_bytes_le;
    use crate::lifecycle::MAX_TRANSITION_COUNT;
    use crate::otp_ctrl::OtpInitBundle;

    const OFFSET_ALERT_TEST: RvAddr = 0x00;
    const OFFSET_STATUS: RvAddr = 0x04;
    const OFFSET_CLAIM_REGWEN: RvAddr = 0x08;
    const OFFSET_CLAIM: RvAddr = 0x0c;
    const OFFSET_TRANSITION_REGWEN: RvAddr = 0x10;
    const OFFSET_TRANSITION_CMD: RvAddr = 0x14;
    const OFFSET_TRANSITION_CTRL: RvAddr = 0x18;
    const OFFSET_TOKEN_0: RvAddr = 0x1c;
    const OFFSET_TARGET: RvAddr = 0x2c;
    const OFFSET_LC_STATE: RvAddr = 0x38;
    const OFFSET_TRANSITION_CNT: RvAddr = 0x3c;
    const OFFSET_ID_STATE: RvAddr = 0x40;
    const OFFSET_HW_REVISION0: RvAddr = 0x44;

    const TEST_UNLOCK_TOKEN: [u8; 16] = [0x55; 16];
    const TEST_EXIT_TOKEN: [u8; 16] = [0x66; 16];
    const RMA_TOKEN: [u8; 16] = [0x77; 16];

    struct Harness {
        clock: Clock,
        lc: LcCtrl,
        dmi: LcCtrlDmi,
        otp: Rc<RefCell<OtpCtrl>>,
        events: Rc<RefCell<PwrEventLatch>>,
    }

    impl Harness {
        fn new(state: LcState, count: u32, id_state: IdState) -> Self {
            let config = SocConfig::new(&SocProperties::default()).unwrap();
            Self::with_config(config, state, count, id_state)
        }

        fn with_config(config: SocConfig, state: LcState, count: u32, id_state: IdState) -> Self {
            let clock = Clock::new();
            let events = Rc::new(RefCell::new(PwrEventLatch::new(&clock)));
            let bundle = OtpInitBundle::for_state(
                &config.templates,
                state,
                count,
                id_state,
                &[
                    (TokenKind::TestUnlock, TEST_UNLOCK_TOKEN),
                    (TokenKind::TestExit, TEST_EXIT_TOKEN),
                    (TokenKind::Rma, RMA_TOKEN),
                ],
            );
            let otp = Rc::new(RefCell::new(OtpCtrl::new(&clock, events.clone(), bundle)));
            let kmac = Rc::new(RefCell::new(Kmac::new(&clock)));
            let regs = Rc::new(RefCell::new(LcCtrlRegs::new(
                &clock,
                config,
                otp.clone(),
                kmac,
                events.clone(),
            )));
            regs.borrow_mut().initialize();
            Self {
                clock,
                lc: LcCtrl::new(regs.clone()),
                dmi: LcCtrlDmi::new(regs),
                otp,
                events,
            }
        }

        fn step(&mut self, ticks: u64) {
            for _ in 0..ticks {
                self.clock.increment(1);
                self.lc.regs.borrow_mut().poll();
                self.otp.borrow_mut().poll();
            }
        }

        fn read(&mut self, addr: RvAddr) -> u32 {
            self.lc.read(RvSize::Word, addr).unwrap()
        }

        fn write(&mut self, addr: RvAddr, val: u32) {
            self.lc.write(RvSize::Word, addr, val).unwrap()
        }

        fn claim_mutex(&mut self) {
            self.write(OFFSET_CLAIM, MUBI8_TRUE);
            assert_eq!(self.read(OFFSET_CLAIM), MUBI8_TRUE);
        }

        fn write_token(&mut self, token: &[u8; 16]) {
            for (i, word) in words_from_bytes_le(token).iter().enumerate() {
                self.write(OFFSET_TOKEN_0 + (i as u32) * 4, *word);
            }
        }

        fn start_transition(&mut self, target: LcState, token: &[u8; 16]) {
            self.claim_mutex();
            self.write_token(token);
            self.write(OFFSET_TARGET, target.encode());
            self.write(OFFSET_TRANSITION_CMD, 1);
        }

        fn status(&mut self) -> StatusRegister {
            LocalRegisterCopy::new(self.read(OFFSET_STATUS))
        }

        fn fsm(&self) -> LcCtrlFsm {
            self.lc.regs.borrow().fsm()
        }

        fn broadcast(&self) -> u32 {
            self.lc.regs.borrow().broadcast.borrow().level()
        }
    }

    // Enough ticks to flush a complete transition: two OTP programs, the
    // KMAC digest, and the FSM steps in between.
    const FULL_TRANSITION_TICKS: u64 = 400;

    #[test]
    fn test_init_from_raw() {
        let mut harness = Harness::new(LcState::Raw, 0, IdState::Blank);
        let status = harness.status();
        assert!(status.is_set(Status::READY));
        assert!(status.is_set(Status::INITIALIZED));
        assert_eq!(harness.read(OFFSET_LC_STATE), LcState::Raw.encode());
        assert_eq!(harness.read(OFFSET_TRANSITION_CNT), 0);
        assert_eq!(harness.read(OFFSET_ID_STATE), 0);
        assert_eq!(harness.broadcast(), broadcast::RAW_TEST_RMA);
        assert_ne!(
            harness.events.borrow_mut().take() & event::LC_DONE,
            0,
            "init must raise lc_done"
        );
    }

    #[test]
    fn test_init_personalized_test_state_fails() {
        let harness = Harness::new(LcState::TestUnlocked0, 1, IdState::Personalized);
        let regs = harness.lc.regs.borrow();
        assert_eq!(regs.fsm(), LcCtrlFsm::Invalid);
        assert_ne!(regs.init_error_mask, 0);
        let status = LocalRegisterCopy::<u32, Status::Register>::new(regs.status_bits());
        assert!(status.is_set(Status::STATE_ERROR));
        assert!(!status.is_set(Status::READY));
        assert!(!status.is_set(Status::INITIALIZED));
    }

    #[test]
    fn test_init_nonraw_zero_count_fails() {
        let harness = Harness::new(LcState::Dev, 0, IdState::Personalized);
        assert_eq!(harness.lc.regs.borrow().fsm(), LcCtrlFsm::Invalid);
    }

    #[test]
    fn test_init_scrap_goes_to_scrap_fsm() {
        let harness = Harness::new(LcState::Scrap, MAX_TRANSITION_COUNT, IdState::Personalized);
        assert_eq!(harness.fsm(), LcCtrlFsm::Scrap);
        assert_eq!(harness.broadcast(), broadcast::ESCALATE_EN);
    }

    #[test]
    fn test_hw_revision() {
        let mut harness = Harness::new(LcState::Raw, 0, IdState::Blank);
        assert_eq!(harness.read(OFFSET_HW_REVISION0), 0x1001_2002);
    }

    #[test]
    fn test_mutex_exclusive_views() {
        let mut harness = Harness::new(LcState::Raw, 0, IdState::Blank);
        harness.claim_mutex();
        harness.write(OFFSET_TOKEN_0, 0xdead_beef);
        harness.write(OFFSET_TARGET, LcState::TestUnlocked0.encode());

        // The owner reads back its own values.
        assert_eq!(harness.read(OFFSET_TOKEN_0), 0xdead_beef);
        assert_eq!(harness.read(OFFSET_TRANSITION_REGWEN), 1);

        // The non-owner interface observes zeros.
        assert_eq!(harness.dmi.read(RvSize::Word, OFFSET_CLAIM).unwrap(), 0);
        assert_eq!(harness.dmi.read(RvSize::Word, OFFSET_TOKEN_0).unwrap(), 0);
        assert_eq!(harness.dmi.read(RvSize::Word, OFFSET_TARGET).unwrap(), 0);
        assert_eq!(
            harness
                .dmi
                .read(RvSize::Word, OFFSET_TRANSITION_REGWEN)
                .unwrap(),
            0
        );

        // A claim attempt by the non-owner fails silently.
        harness
            .dmi
            .write(RvSize::Word, OFFSET_CLAIM, MUBI8_TRUE)
            .unwrap();
        assert_eq!(harness.dmi.read(RvSize::Word, OFFSET_CLAIM).unwrap(), 0);
        assert_eq!(harness.read(OFFSET_CLAIM), MUBI8_TRUE);

        // Re-claiming by the owner is idempotent.
        harness.claim_mutex();
        assert_eq!(harness.read(OFFSET_TOKEN_0), 0xdead_beef);
    }

    #[test]
    fn test_mutex_release_and_reacquire() {
        let mut harness = Harness::new(LcState::Raw, 0, IdState::Blank);
        harness.claim_mutex();
        harness.write(OFFSET_CLAIM, 0);
        assert_eq!(harness.read(OFFSET_CLAIM), 0);

        // Now the DMI side can take it.
        harness
            .dmi
            .write(RvSize::Word, OFFSET_CLAIM, MUBI8_TRUE)
            .unwrap();
        assert_eq!(
            harness.dmi.read(RvSize::Word, OFFSET_CLAIM).unwrap(),
            MUBI8_TRUE
        );
        assert_eq!(harness.read(OFFSET_CLAIM), 0);
    }

    #[test]
    fn test_claim_regwen_blocks_mutex() {
        let mut harness = Harness::new(LcState::Raw, 0, IdState::Blank);
        harness.write(OFFSET_CLAIM_REGWEN, 0);
        assert_eq!(harness.read(OFFSET_CLAIM_REGWEN), 0);
        harness.write(OFFSET_CLAIM, MUBI8_TRUE);
        assert_eq!(harness.read(OFFSET_CLAIM), 0);

        // RW0C: cannot be set again.
        harness.write(OFFSET_CLAIM_REGWEN, 1);
        assert_eq!(harness.read(OFFSET_CLAIM_REGWEN), 0);
    }

    #[test]
    fn test_token_writes_require_mutex() {
        let mut harness = Harness::new(LcState::Raw, 0, IdState::Blank);
        harness.write(OFFSET_TOKEN_0, 0x1234_5678);
        harness.claim_mutex();
        assert_eq!(harness.read(OFFSET_TOKEN_0), 0);
    }

    #[test]
    fn test_volatile_raw_unlock_success() {
        let mut harness = Harness::new(LcState::Raw, 0, IdState::Blank);
        let hashed = Kmac::hash_token(&SocConfig::default().raw_unlock_token);

        harness.claim_mutex();
        harness.write(OFFSET_TRANSITION_CTRL, 0x2);
        harness.write_token(&hashed);
        harness.write(OFFSET_TARGET, LcState::TestUnlocked0.encode());
        harness.write(OFFSET_TRANSITION_CMD, 1);

        let status = harness.status();
        assert!(status.is_set(Status::TRANSITION_SUCCESSFUL));
        assert!(status.is_set(Status::READY));
        assert_eq!(harness.fsm(), LcCtrlFsm::Idle);
        assert_eq!(
            harness.read(OFFSET_LC_STATE),
            LcState::TestUnlocked0.encode()
        );
        assert_eq!(harness.read(OFFSET_TRANSITION_CNT), 1);
        assert_ne!(harness.broadcast() & broadcast::DFT_EN, 0);
    }

    #[test]
    fn test_volatile_raw_unlock_bad_token() {
        let mut harness = Harness::new(LcState::Raw, 0, IdState::Blank);
        harness.claim_mutex();
        harness.write(OFFSET_TRANSITION_CTRL, 0x2);
        harness.write_token(&[0xba; 16]);
        harness.write(OFFSET_TARGET, LcState::TestUnlocked0.encode());
        harness.write(OFFSET_TRANSITION_CMD, 1);

        let status = harness.status();
        assert!(status.is_set(Status::TOKEN_ERROR));
        assert!(status.is_set(Status::TRANSITION_ERROR));
        assert!(!status.is_set(Status::READY));
        assert_eq!(harness.fsm(), LcCtrlFsm::PostTrans);
        assert_eq!(
            harness.read(OFFSET_LC_STATE),
            LcState::PostTransition.encode()
        );
    }

    #[test]
    fn test_volatile_raw_unlock_disabled_by_config() {
        let mut props = SocProperties::default();
        props.volatile_raw_unlock = false;
        let config = SocConfig::new(&props).unwrap();
        let mut harness = Harness::with_config(config, LcState::Raw, 0, IdState::Blank);

        harness.claim_mutex();
        harness.write(OFFSET_TRANSITION_CTRL, 0x2);
        // The enable bit did not stick.
        assert_eq!(harness.read(OFFSET_TRANSITION_CTRL) & 0x2, 0);
    }

    #[test]
    fn test_full_transition_with_token() {
        let mut harness = Harness::new(LcState::TestLocked0, 1, IdState::Blank);
        harness.start_transition(LcState::TestUnlocked1, &TEST_UNLOCK_TOKEN);
        harness.step(FULL_TRANSITION_TICKS);

        let status = harness.status();
        assert!(status.is_set(Status::TRANSITION_SUCCESSFUL), "status: {:#x}", status.get());
        assert!(!status.is_set(Status::READY));
        assert_eq!(harness.fsm(), LcCtrlFsm::PostTrans);
        assert_eq!(
            harness.read(OFFSET_LC_STATE),
            LcState::PostTransition.encode()
        );

        // OTP now holds the target state and the incremented count; a cold
        // boot would decode them.
        let config = SocConfig::default();
        let bundle = harness.otp.borrow().init_read();
        assert_eq!(
            config.templates.decode_state(&bundle.lc_state_words),
            Some(LcState::TestUnlocked1)
        );
        assert_eq!(config.templates.decode_cnt(&bundle.lc_cnt_words), Some(2));
    }

    #[test]
    fn test_bad_token_sets_token_error() {
        let mut harness = Harness::new(LcState::TestLocked0, 1, IdState::Blank);
        harness.start_transition(LcState::TestUnlocked1, &[0u8; 16]);
        harness.step(FULL_TRANSITION_TICKS);

        let status = harness.status();
        assert!(status.is_set(Status::TOKEN_ERROR));
        assert!(!status.is_set(Status::TRANSITION_SUCCESSFUL));
        assert!(!status.is_set(Status::READY));
        assert_eq!(harness.fsm(), LcCtrlFsm::PostTrans);

        // The counter was programmed before the token check failed.
        let config = SocConfig::default();
        let bundle = harness.otp.borrow().init_read();
        assert_eq!(config.templates.decode_cnt(&bundle.lc_cnt_words), Some(2));
        assert_eq!(
            config.templates.decode_state(&bundle.lc_state_words),
            Some(LcState::TestLocked0)
        );
    }

    #[test]
    fn test_invalid_matrix_cell_beats_valid_token() {
        // PRODEND -> RMA is not in the matrix; even the correct RMA token
        // must not help.
        let mut harness = Harness::new(LcState::ProdEnd, 5, IdState::Personalized);
        harness.start_transition(LcState::Rma, &RMA_TOKEN);
        harness.step(FULL_TRANSITION_TICKS);

        let status = harness.status();
        assert!(status.is_set(Status::TRANSITION_ERROR));
        assert!(!status.is_set(Status::TOKEN_ERROR));
        assert_eq!(harness.fsm(), LcCtrlFsm::PostTrans);
    }

    #[test]
    fn test_invalid_target_encoding_is_transition_error() {
        let mut harness = Harness::new(LcState::TestUnlocked0, 1, IdState::Blank);
        harness.claim_mutex();
        harness.write_token(&[0u8; 16]);
        harness.write(OFFSET_TARGET, 0xdead_beef);
        harness.write(OFFSET_TRANSITION_CMD, 1);
        harness.step(FULL_TRANSITION_TICKS);

        assert!(harness.status().is_set(Status::TRANSITION_ERROR));
        assert_eq!(harness.fsm(), LcCtrlFsm::PostTrans);
    }

    #[test]
    fn test_transition_count_ceiling() {
        let mut harness = Harness::new(LcState::TestUnlocked0, MAX_TRANSITION_COUNT, IdState::Blank);
        harness.start_transition(LcState::TestLocked0, &[0u8; 16]);
        harness.step(FULL_TRANSITION_TICKS);

        let status = harness.status();
        assert!(status.is_set(Status::TRANSITION_COUNT_ERROR));
        assert_eq!(harness.fsm(), LcCtrlFsm::PostTrans);
        assert_eq!(harness.read(OFFSET_TRANSITION_CNT), MAX_TRANSITION_COUNT);
    }

    #[test]
    fn test_scrap_transition_burns_counter() {
        let mut harness = Harness::new(LcState::Prod, 7, IdState::Personalized);
        harness.start_transition(LcState::Scrap, &[0u8; 16]);
        harness.step(FULL_TRANSITION_TICKS);

        assert!(harness.status().is_set(Status::TRANSITION_SUCCESSFUL));
        let config = SocConfig::default();
        let bundle = harness.otp.borrow().init_read();
        assert_eq!(
            config.templates.decode_cnt(&bundle.lc_cnt_words),
            Some(MAX_TRANSITION_COUNT)
        );
        assert_eq!(
            config.templates.decode_state(&bundle.lc_state_words),
            Some(LcState::Scrap)
        );
    }

    #[test]
    fn test_otp_rejection_sets_state_error() {
        let mut harness = Harness::new(LcState::TestLocked0, 1, IdState::Blank);
        harness.otp.borrow_mut().set_reject_programs(true);
        harness.start_transition(LcState::TestUnlocked1, &TEST_UNLOCK_TOKEN);
        harness.step(FULL_TRANSITION_TICKS);

        assert!(harness.status().is_set(Status::STATE_ERROR));
        assert_eq!(harness.fsm(), LcCtrlFsm::PostTrans);
    }

    #[test]
    fn test_ext_clock_switch() {
        let mut harness = Harness::new(LcState::TestLocked0, 1, IdState::Blank);
        harness.claim_mutex();
        harness.write(OFFSET_TRANSITION_CTRL, 0x1);
        harness.write_token(&TEST_UNLOCK_TOKEN);
        harness.write(OFFSET_TARGET, LcState::TestUnlocked1.encode());
        harness.write(OFFSET_TRANSITION_CMD, 1);
        harness.step(FULL_TRANSITION_TICKS);

        assert!(harness.status().is_set(Status::EXT_CLOCK_SWITCHED));
        assert!(harness.status().is_set(Status::TRANSITION_SUCCESSFUL));
    }

    #[test]
    fn test_escalation_is_absorbing() {
        let mut harness = Harness::new(LcState::Prod, 5, IdState::Personalized);
        assert_ne!(harness.broadcast() & broadcast::CPU_EN, 0);

        harness.lc.regs.borrow_mut().escalate();
        assert_eq!(harness.broadcast(), broadcast::ESCALATE_EN);
        assert_eq!(harness.fsm(), LcCtrlFsm::Escalate);
        assert_eq!(harness.read(OFFSET_LC_STATE), LcState::Escalate.encode());

        // Transitions are impossible now; the command is ignored.
        harness.write(OFFSET_TRANSITION_CMD, 1);
        harness.step(FULL_TRANSITION_TICKS);
        assert_eq!(harness.fsm(), LcCtrlFsm::Escalate);
        assert_eq!(harness.broadcast(), broadcast::ESCALATE_EN);
    }

    #[test]
    fn test_cold_reset_recovers_from_post_trans() {
        let mut harness = Harness::new(LcState::TestLocked0, 1, IdState::Blank);
        harness.start_transition(LcState::TestUnlocked1, &TEST_UNLOCK_TOKEN);
        harness.step(FULL_TRANSITION_TICKS);
        assert_eq!(harness.fsm(), LcCtrlFsm::PostTrans);

        harness.lc.regs.borrow_mut().cold_reset();
        assert_eq!(harness.fsm(), LcCtrlFsm::Reset);
        assert_eq!(harness.read(OFFSET_STATUS), 0);

        // Re-init decodes the state that was programmed before the reset.
        harness.lc.regs.borrow_mut().initialize();
        assert_eq!(
            harness.read(OFFSET_LC_STATE),
            LcState::TestUnlocked1.encode()
        );
        assert_eq!(harness.read(OFFSET_TRANSITION_CNT), 2);
        assert!(harness.status().is_set(Status::READY));
    }

    #[test]
    fn test_broadcast_levels_per_state() {
        use broadcast::*;

        let harness = Harness::new(LcState::Dev, 3, IdState::Blank);
        let bits = harness.broadcast();
        assert_eq!(
            bits,
            HW_DEBUG_EN | CPU_EN | KEYMGR_EN | OWNER_SEED_SW_RW_EN | ISO_PART_SW_WR_EN
                | CREATOR_SEED_SW_RW_EN
        );

        let harness = Harness::new(LcState::Prod, 3, IdState::Personalized);
        let bits = harness.broadcast();
        assert_eq!(
            bits,
            CPU_EN | KEYMGR_EN | OWNER_SEED_SW_RW_EN | ISO_PART_SW_RD_EN | ISO_PART_SW_WR_EN
                | SEED_HW_RD_EN
        );
        assert_eq!(
            harness.lc.regs.borrow().keymgr_div.borrow().level(),
            KeyMgrDiv::Prod
        );

        let harness = Harness::new(LcState::TestUnlocked7, 8, IdState::Blank);
        assert_eq!(harness.broadcast() & NVM_DEBUG_EN, 0);
        assert_ne!(harness.broadcast() & DFT_EN, 0);
    }

    #[test]
    fn test_alert_test_lines_accumulate() {
        let mut harness = Harness::new(LcState::Raw, 0, IdState::Blank);
        harness.write(OFFSET_ALERT_TEST, 0x1);
        harness.write(OFFSET_ALERT_TEST, 0x4);
        assert_eq!(harness.lc.regs.borrow().alert_test_bits(), 0x5);
        assert_eq!(harness.read(OFFSET_ALERT_TEST), 0);
    }

    #[test]
    fn test_sub_word_access_faults() {
        let mut harness = Harness::new(LcState::Raw, 0, IdState::Blank);
        assert_eq!(
            harness.lc.read(RvSize::Byte, OFFSET_STATUS).err(),
            Some(BusError::LoadAccessFault)
        );
        assert_eq!(
            harness.lc.write(RvSize::HalfWord, OFFSET_CLAIM, 1).err(),
            Some(BusError::StoreAccessFault)
        );
    }

    #[test]
    fn test_unmapped_offset_faults() {
        let mut harness = Harness::new(LcState::Raw, 0, IdState::Blank);
        assert_eq!(
            harness.lc.read(RvSize::Word, 0x8c).err(),
            Some(BusError::LoadAccessFault)
        );
    }
}
