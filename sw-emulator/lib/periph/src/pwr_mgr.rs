/*++

Licensed under the Apache-2.0 license.

File Name:

    pwr_mgr.rs

Abstract:

    File contains the power manager implementation: fast and slow boot FSMs,
    OTP/LC init sequencing, ROM check aggregation and reset request routing.

--*/

use std::cell::RefCell;
use std::rc::Rc;

use sentinel_emu_bus::{ActionHandle, BusError, Clock, ReadWriteRegister, Signal, Timer};
use sentinel_emu_derive::Bus;
use sentinel_emu_types::{RvData, RvSize};
use tock_registers::interfaces::{Readable, Writeable};

use crate::config::SocConfig;
use crate::lc_ctrl::LcCtrlRegs;
use crate::otp_ctrl::OtpCtrl;
use crate::root_bus::{ShutdownCb, ESCALATION_EXIT_CODE};
use crate::rst_mgr::{ResetCause, RstMgr};

/// 100 microseconds at the 100 MHz emulated clock.
const CDC_SYNC_TICKS: u64 = 10_000;

/// Reset-request sources that are armed regardless of RESET_EN (the
/// external reset pin).
const UNMASKED_RESET_REQS: u32 = 1 << 0;

/// Number of reset-request input wires.
const NUM_RESET_REQS: usize = 8;

/// RESET_STATUS bit recording a software-initiated reset.
const RESET_STATUS_SW: u32 = 1 << 8;

/// Events latched for the fast FSM. Writers OR bits in; the FSM consumer
/// drains the latch as it steps.
pub mod event {
    pub const HW_RESET: u32 = 1 << 0;
    pub const SW_RESET: u32 = 1 << 1;
    pub const OTP_DONE: u32 = 1 << 2;
    pub const LC_DONE: u32 = 1 << 3;
    pub const ESCALATE: u32 = 1 << 4;
    pub const HOLDON_FETCH: u32 = 1 << 5;

    const ROM_GOOD_BASE: usize = 8;
    const ROM_DONE_BASE: usize = 16;

    pub fn rom_good(index: usize) -> u32 {
        1 << (ROM_GOOD_BASE + index)
    }

    pub fn rom_done(index: usize) -> u32 {
        1 << (ROM_DONE_BASE + index)
    }
}

/// Boot-status bitmap published to the debug controller.
pub mod boot_status {
    pub const MAIN_CLK: u32 = 1 << 0;
    pub const IO_CLK: u32 = 1 << 1;
    pub const USB_CLK: u32 = 1 << 2;
    pub const OTP_DONE: u32 = 1 << 3;
    pub const LC_DONE: u32 = 1 << 4;
    pub const ROM_DONE_BASE: usize = 5;
    pub const ROM_GOOD_BASE: usize = 8;
    pub const CPU_FETCH_EN: u32 = 1 << 11;
}

/// The shared event latch. This is the only inter-controller writable
/// field; raising an event schedules a poll so the FSM ticks.
pub struct PwrEventLatch {
    bits: u32,
    timer: Timer,
}

impl PwrEventLatch {
    pub fn new(clock: &Clock) -> Self {
        Self {
            bits: 0,
            timer: Timer::new(clock),
        }
    }

    pub fn raise(&mut self, bits: u32) {
        self.bits |= bits;
        self.timer.schedule_poll_in(1);
    }

    pub fn take(&mut self) -> u32 {
        std::mem::take(&mut self.bits)
    }
}

/// Fast FSM state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FastState {
    LowPower,
    EnableClocks,
    ReleaseLcRst,
    OtpInit,
    LcInit,
    AckPwrUp,
    Strap,
    RomCheckDone,
    RomCheckGood,
    Active,
    DisClks,
    FallThrough,
    NvmIdleChk,
    NvmShutDown,
    LowPowerPrep,
    ResetPrep,
    ResetWait,
    ReqPwrDn,
}

/// Slow FSM state. At cold boot the power-up leg is fast-forwarded straight
/// to `Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlowState {
    Reset,
    LowPower,
    MainPowerOn,
    PwrClampOff,
    ClocksOn,
    ReqPwrUp,
    Idle,
    AckPwrDn,
    ClocksOff,
    PwrClampOn,
    MainPowerOff,
}

/// Power manager peripheral.
#[derive(Bus)]
#[poll_fn(poll)]
#[cold_reset_fn(cold_reset)]
pub struct PwrMgr {
    #[register(offset = 0x0000_0008, read_fn = on_read_intr_test, write_fn = on_write_intr_test)]
    #[register(offset = 0x0000_000c, read_fn = on_read_alert_test, write_fn = on_write_alert_test)]
    _fieldless_regs: (),

    /// INTR_STATE register (RW1C)
    #[register(offset = 0x0000_0000, write_fn = on_write_intr_state)]
    intr_state: u32,

    /// INTR_ENABLE register
    #[register(offset = 0x0000_0004)]
    intr_enable: ReadWriteRegister<u32>,

    /// CTRL_CFG_REGWEN register (RW0C)
    #[register(offset = 0x0000_0010, write_fn = on_write_ctrl_cfg_regwen)]
    ctrl_cfg_regwen: u32,

    /// CONTROL register, gated by CTRL_CFG_REGWEN
    #[register(offset = 0x0000_0014, write_fn = on_write_control)]
    control: u32,

    /// CFG_CDC_SYNC register (RW1S, self-clearing)
    #[register(offset = 0x0000_0018, write_fn = on_write_cfg_cdc_sync)]
    cfg_cdc_sync: u32,

    /// WAKEUP_EN_REGWEN register (RW0C)
    #[register(offset = 0x0000_001c, write_fn = on_write_wakeup_en_regwen)]
    wakeup_en_regwen: u32,

    /// WAKEUP_EN register, gated by WAKEUP_EN_REGWEN
    #[register(offset = 0x0000_0020, write_fn = on_write_wakeup_en)]
    wakeup_en: u32,

    /// WAKE_STATUS register
    #[register(offset = 0x0000_0024, write_fn = on_write_read_only)]
    wake_status: u32,

    /// RESET_EN_REGWEN register (RW0C)
    #[register(offset = 0x0000_0028, write_fn = on_write_reset_en_regwen)]
    reset_en_regwen: u32,

    /// RESET_EN register, gated by RESET_EN_REGWEN
    #[register(offset = 0x0000_002c, write_fn = on_write_reset_en)]
    reset_en: u32,

    /// RESET_STATUS register
    #[register(offset = 0x0000_0030, write_fn = on_write_read_only)]
    reset_status: u32,

    /// ESCALATE_RESET_STATUS register
    #[register(offset = 0x0000_0034, write_fn = on_write_read_only)]
    escalate_reset_status: u32,

    /// WAKE_INFO_CAPTURE_DIS register
    #[register(offset = 0x0000_0038)]
    wake_info_capture_dis: ReadWriteRegister<u32>,

    /// WAKE_INFO register (RW1C)
    #[register(offset = 0x0000_003c, write_fn = on_write_wake_info)]
    wake_info: u32,

    /// FAULT_STATUS register
    #[register(offset = 0x0000_0040, write_fn = on_write_read_only)]
    fault_status: u32,

    /// Latched alert-test lines
    alert_test: u32,

    /// Fast FSM state
    fast: FastState,

    /// Slow FSM state
    slow: SlowState,

    /// Event latch shared with the other controllers
    events: Rc<RefCell<PwrEventLatch>>,

    lc: Rc<RefCell<LcCtrlRegs>>,
    otp: Rc<RefCell<OtpCtrl>>,
    rst: RstMgr,

    /// Latched completion flags
    otp_done_seen: bool,
    lc_done_seen: bool,

    /// Per-ROM aggregation bitmaps
    rom_done_seen: u8,
    rom_good_seen: u8,

    /// Fetch-holdoff input level
    holdon_fetch: bool,

    /// Escalation received
    escalated: bool,

    /// Clocks enabled by the fast FSM
    clocks_on: bool,

    /// CPU fetch released
    fetch_en: bool,

    /// (domain, cause) for the reset dispatched in RESET_PREP
    pending_reset: Option<(bool, ResetCause)>,

    /// Low-power path logged once
    low_power_logged: bool,

    /// Boot status wire to the debug controller
    boot_status: Rc<RefCell<Signal<u32>>>,

    num_rom: usize,
    fetch_ctrl: bool,

    /// This instance owns host shutdown on escalation
    main: bool,

    shutdown_cb: ShutdownCb,

    /// CDC sync self-clear action
    cdc_action: Option<ActionHandle>,

    /// Timer
    timer: Timer,
}

impl PwrMgr {
    pub fn new(
        clock: &Clock,
        config: &SocConfig,
        events: Rc<RefCell<PwrEventLatch>>,
        lc: Rc<RefCell<LcCtrlRegs>>,
        otp: Rc<RefCell<OtpCtrl>>,
        rst: RstMgr,
        shutdown_cb: ShutdownCb,
    ) -> Self {
        let timer = Timer::new(clock);
        // Kick the boot sequence off.
        timer.schedule_poll_in(1);
        Self {
            _fieldless_regs: (),
            intr_state: 0,
            intr_enable: ReadWriteRegister::new(0),
            ctrl_cfg_regwen: 1,
            control: 0,
            cfg_cdc_sync: 0,
            wakeup_en_regwen: 1,
            wakeup_en: 0,
            wake_status: 0,
            reset_en_regwen: 1,
            reset_en: 0,
            reset_status: 0,
            escalate_reset_status: 0,
            wake_info_capture_dis: ReadWriteRegister::new(0),
            wake_info: 0,
            fault_status: 0,
            alert_test: 0,
            fast: FastState::LowPower,
            slow: SlowState::Reset,
            events,
            lc,
            otp,
            rst,
            otp_done_seen: false,
            lc_done_seen: false,
            rom_done_seen: 0,
            rom_good_seen: 0,
            holdon_fetch: false,
            escalated: false,
            clocks_on: false,
            fetch_en: false,
            pending_reset: None,
            low_power_logged: false,
            boot_status: Rc::new(RefCell::new(Signal::new(0))),
            num_rom: config.num_rom,
            fetch_ctrl: config.fetch_ctrl,
            main: config.main,
            shutdown_cb,
            cdc_action: None,
            timer,
        }
    }

    pub fn fast_state(&self) -> FastState {
        self.fast
    }

    pub fn slow_state(&self) -> SlowState {
        self.slow
    }

    pub fn boot_status_signal(&self) -> Rc<RefCell<Signal<u32>>> {
        self.boot_status.clone()
    }

    /// External reset-request wire `src`. Must be armed in RESET_EN unless
    /// the platform leaves the source unmasked.
    pub fn reset_request(&mut self, src: usize) {
        if src >= NUM_RESET_REQS {
            println!("[pwr_mgr] reset request from unknown source {src}");
            return;
        }
        let mask = 1u32 << src;
        if (self.reset_en | UNMASKED_RESET_REQS) & mask == 0 {
            println!("[pwr_mgr] reset request {src} not enabled in RESET_EN");
            return;
        }
        if self.reset_status != 0 {
            // A reset is already in progress; duplicates are dropped.
            return;
        }
        self.reset_status = mask;
        self.pending_reset = Some((true, ResetCause::Peripheral(src)));
        self.events.borrow_mut().raise(event::HW_RESET);
    }

    /// Software reset request, routed here by the reset manager.
    fn sw_reset_request(&mut self) {
        if self.reset_status != 0 {
            return;
        }
        self.reset_status = RESET_STATUS_SW;
        self.pending_reset = Some((true, ResetCause::Sw));
    }

    /// Wakeup-request wire `src`; gated by WAKEUP_EN and latched into
    /// WAKE_INFO unless capture is disabled.
    pub fn wakeup_request(&mut self, src: usize) {
        let mask = 1u32 << src;
        if self.wakeup_en & mask == 0 {
            return;
        }
        self.wake_status |= mask;
        if self.wake_info_capture_dis.reg.get() & 1 == 0 {
            self.wake_info |= mask;
        }
        self.intr_state |= 1;
    }

    pub fn rom_done(&mut self, index: usize) {
        if index < self.num_rom {
            self.events.borrow_mut().raise(event::rom_done(index));
        }
    }

    pub fn rom_good(&mut self, index: usize) {
        if index < self.num_rom {
            self.events.borrow_mut().raise(event::rom_good(index));
        }
    }

    /// Fetch-holdoff input level.
    pub fn set_holdon_fetch(&mut self, holdon: bool) {
        self.holdon_fetch = holdon;
        self.timer.schedule_poll_in(1);
    }

    // ------------------------------------------------------------------
    // Register callbacks
    // ------------------------------------------------------------------

    fn on_write_intr_state(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        self.intr_state &= !val;
        Ok(())
    }

    fn on_read_intr_test(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        println!("[pwr_mgr] read of write-only INTR_TEST register");
        Ok(0)
    }

    fn on_write_intr_test(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        self.intr_state |= val & 1;
        Ok(())
    }

    fn on_read_alert_test(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        println!("[pwr_mgr] read of write-only ALERT_TEST register");
        Ok(0)
    }

    fn on_write_alert_test(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        self.alert_test |= val & 1;
        Ok(())
    }

    fn on_write_ctrl_cfg_regwen(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        if val & 1 == 0 {
            self.ctrl_cfg_regwen = 0;
        }
        Ok(())
    }

    fn on_write_control(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        if self.ctrl_cfg_regwen & 1 == 0 {
            println!("[pwr_mgr] CONTROL write blocked by CTRL_CFG_REGWEN");
            return Ok(());
        }
        self.control = val;
        self.timer.schedule_poll_in(1);
        Ok(())
    }

    fn on_write_cfg_cdc_sync(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        // RW1S: the bit can only be set; it clears itself once the sync
        // pulse has propagated.
        if val & 1 != 0 && self.cfg_cdc_sync == 0 {
            self.cfg_cdc_sync = 1;
            self.cdc_action = Some(self.timer.schedule_poll_in(CDC_SYNC_TICKS));
        }
        Ok(())
    }

    fn on_write_wakeup_en_regwen(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        if val & 1 == 0 {
            self.wakeup_en_regwen = 0;
        }
        Ok(())
    }

    fn on_write_wakeup_en(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        if self.wakeup_en_regwen & 1 == 0 {
            println!("[pwr_mgr] WAKEUP_EN write blocked by WAKEUP_EN_REGWEN");
            return Ok(());
        }
        self.wakeup_en = val;
        Ok(())
    }

    fn on_write_reset_en_regwen(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        if val & 1 == 0 {
            self.reset_en_regwen = 0;
        }
        Ok(())
    }

    fn on_write_reset_en(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        if self.reset_en_regwen & 1 == 0 {
            println!("[pwr_mgr] RESET_EN write blocked by RESET_EN_REGWEN");
            return Ok(());
        }
        self.reset_en = val;
        Ok(())
    }

    fn on_write_wake_info(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        self.wake_info &= !val;
        Ok(())
    }

    fn on_write_read_only(&mut self, size: RvSize, _val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        println!("[pwr_mgr] write to read-only register ignored");
        Ok(())
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
    // FSM
    // ------------------------------------------------------------------

    fn absorb_events(&mut self, bits: u32) {
        if bits & event::OTP_DONE != 0 {
            self.otp_done_seen = true;
        }
        if bits & event::LC_DONE != 0 {
            self.lc_done_seen = true;
        }
        if bits & event::ESCALATE != 0 {
            self.escalated = true;
        }
        if bits & event::HOLDON_FETCH != 0 {
            self.holdon_fetch = true;
        }
        if bits & event::SW_RESET != 0 {
            self.sw_reset_request();
        }
        for index in 0..self.num_rom {
            if bits & event::rom_done(index) != 0 {
                self.rom_done_seen |= 1 << index;
            }
            if bits & event::rom_good(index) != 0 {
                self.rom_good_seen |= 1 << index;
            }
        }
    }

    fn all_roms_done(&self) -> bool {
        let all = ((1u16 << self.num_rom) - 1) as u8;
        self.rom_done_seen & all == all
    }

    fn all_roms_good(&self) -> bool {
        let all = ((1u16 << self.num_rom) - 1) as u8;
        self.rom_good_seen & all == all
    }

    fn low_power_hint(&self) -> bool {
        self.control & 1 != 0
    }

    fn step(&mut self) {
        let bits = self.events.borrow_mut().take();
        self.absorb_events(bits);

        // The slow FSM fast-forwards its power-up leg to IDLE at boot.
        while self.slow != SlowState::Idle {
            self.slow = match self.slow {
                SlowState::Reset => SlowState::LowPower,
                SlowState::LowPower => SlowState::MainPowerOn,
                SlowState::MainPowerOn => SlowState::PwrClampOff,
                SlowState::PwrClampOff => SlowState::ClocksOn,
                SlowState::ClocksOn => SlowState::ReqPwrUp,
                SlowState::ReqPwrUp => SlowState::Idle,
                // The power-down leg is not modeled.
                SlowState::AckPwrDn
                | SlowState::ClocksOff
                | SlowState::PwrClampOn
                | SlowState::MainPowerOff
                | SlowState::Idle => SlowState::Idle,
            };
        }

        if self.escalated && self.fast != FastState::ReqPwrDn {
            self.fast = FastState::ReqPwrDn;
            self.escalate_reset_status = 1;
            println!("[pwr_mgr] escalation received, requesting power down");
            if self.main {
                (self.shutdown_cb.0)(ESCALATION_EXIT_CODE);
            }
            self.publish_boot_status();
            return;
        }

        // Edge-triggered drain: keep stepping while the state changes.
        loop {
            let next = self.next_fast_state();
            if next == self.fast {
                break;
            }
            self.enter_fast_state(next);
        }

        self.publish_boot_status();
    }

    fn next_fast_state(&self) -> FastState {
        match self.fast {
            FastState::LowPower => FastState::EnableClocks,
            FastState::EnableClocks => FastState::ReleaseLcRst,
            FastState::ReleaseLcRst => FastState::OtpInit,
            FastState::OtpInit => {
                if self.otp_done_seen {
                    FastState::LcInit
                } else {
                    FastState::OtpInit
                }
            }
            FastState::LcInit => {
                if self.lc_done_seen {
                    FastState::AckPwrUp
                } else {
                    FastState::LcInit
                }
            }
            FastState::AckPwrUp => FastState::Strap,
            FastState::Strap => FastState::RomCheckDone,
            FastState::RomCheckDone => {
                if self.all_roms_done() {
                    FastState::RomCheckGood
                } else {
                    FastState::RomCheckDone
                }
            }
            FastState::RomCheckGood => {
                if self.all_roms_good() && !self.holdon_fetch {
                    FastState::Active
                } else {
                    FastState::RomCheckGood
                }
            }
            FastState::Active => {
                if self.reset_status != 0 {
                    FastState::DisClks
                } else if self.low_power_hint() {
                    FastState::FallThrough
                } else {
                    FastState::Active
                }
            }
            FastState::DisClks => FastState::ResetPrep,
            FastState::ResetPrep => FastState::ResetWait,
            FastState::ResetWait => FastState::ResetWait,
            FastState::FallThrough => FastState::NvmIdleChk,
            FastState::NvmIdleChk => FastState::NvmShutDown,
            FastState::NvmShutDown => FastState::LowPowerPrep,
            FastState::LowPowerPrep => FastState::Active,
            FastState::ReqPwrDn => FastState::ReqPwrDn,
        }
    }

    fn enter_fast_state(&mut self, next: FastState) {
        self.fast = next;
        match next {
            FastState::EnableClocks => {
                self.clocks_on = true;
            }
            FastState::OtpInit => {
                self.otp.borrow_mut().init();
            }
            FastState::LcInit => {
                // The OTP wire drops, the LC wire rises.
                self.lc.borrow_mut().initialize();
            }
            FastState::Strap => {
                println!("[pwr_mgr] strap sampling pulse");
            }
            FastState::Active => {
                if self.fetch_ctrl {
                    self.fetch_en = true;
                }
            }
            FastState::ResetPrep => {
                if let Some((fast_domain, cause)) = self.pending_reset.take() {
                    self.rst.reset_req(fast_domain, cause);
                }
            }
            FastState::FallThrough => {
                if !self.low_power_logged {
                    println!("[pwr_mgr] low power entry not modeled, resuming");
                    self.low_power_logged = true;
                }
            }
            FastState::LowPowerPrep => {
                // Drop the hint so the FSM settles back in ACTIVE.
                self.control &= !1;
            }
            _ => {}
        }
    }

    fn publish_boot_status(&mut self) {
        let mut bits = 0;
        if self.clocks_on {
            bits |= boot_status::MAIN_CLK | boot_status::IO_CLK | boot_status::USB_CLK;
        }
        if self.otp_done_seen {
            bits |= boot_status::OTP_DONE;
        }
        if self.lc_done_seen {
            bits |= boot_status::LC_DONE;
        }
        for index in 0..self.num_rom.min(3) {
            if self.rom_done_seen & (1 << index) != 0 {
                bits |= 1 << (boot_status::ROM_DONE_BASE + index);
            }
            if self.rom_good_seen & (1 << index) != 0 {
                bits |= 1 << (boot_status::ROM_GOOD_BASE + index);
            }
        }
        if self.fetch_en {
            bits |= boot_status::CPU_FETCH_EN;
        }
        self.boot_status.borrow_mut().set(bits);
    }

    /// Called by Bus::poll() to indicate that time has passed.
    fn poll(&mut self) {
        if self.timer.fired(&mut self.cdc_action) {
            self.cfg_cdc_sync = 0;
        }
        self.step();
    }

    fn cold_reset(&mut self) {
        if let Some(action) = self.cdc_action.take() {
            self.timer.cancel(action);
        }
        // Events latched before the reset must not leak into the new boot.
        let _ = self.events.borrow_mut().take();
        self.intr_state = 0;
        self.intr_enable.reg.set(0);
        self.ctrl_cfg_regwen = 1;
        self.control = 0;
        self.cfg_cdc_sync = 0;
        self.wakeup_en_regwen = 1;
        self.wakeup_en = 0;
        self.wake_status = 0;
        self.reset_en_regwen = 1;
        self.reset_en = 0;
        self.reset_status = 0;
        self.escalate_reset_status = 0;
        self.wake_info_capture_dis.reg.set(0);
        self.wake_info = 0;
        self.alert_test = 0;
        self.fast = FastState::LowPower;
        self.slow = SlowState::Reset;
        self.otp_done_seen = false;
        self.lc_done_seen = false;
        self.rom_done_seen = 0;
        self.rom_good_seen = 0;
        self.escalated = false;
        self.clocks_on = false;
        self.fetch_en = false;
        self.pending_reset = None;
        // Reboot.
        self.timer.schedule_poll_in(1);
    }
}
