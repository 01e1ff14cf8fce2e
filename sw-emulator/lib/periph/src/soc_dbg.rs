/*++

Licensed under the Apache-2.0 license.

File Name:

    soc_dbg.rs

Abstract:

    File contains the SoC debug controller implementation: authenticated
    debug-policy derivation and the CPU-boot gating FSM.

--*/

use std::cell::RefCell;
use std::rc::Rc;

use sentinel_emu_bus::{Bus, BusError, Clock, Signal, Timer};
use sentinel_emu_derive::Bus;
use sentinel_emu_types::{RvAddr, RvData, RvSize};

use crate::lifecycle::{broadcast, SocDbgState};
use crate::pwr_mgr::boot_status;

/// Debug policy values (4-bit category plus relock).
pub const DBG_POLICY_LOCKED: u32 = 0x0;
pub const DBG_POLICY_UNLOCKED: u32 = 0x7;

/// Validity flag published alongside the policy.
pub const DBG_POLICY_VALID: u32 = 1 << 4;

/// Debug controller FSM state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbgFsm {
    Idle,
    CheckLcSt,
    Wait4DftEn,
    CheckHaltPin,
    CheckJtagGo,
    ContinueBoot,
    HaltDone,
}

/// Debug controller state shared between the core and DMI apertures.
pub struct SocDbgRegs {
    /// INTR_STATE register (RW1C)
    intr_state: u32,

    /// INTR_ENABLE register
    intr_enable: u32,

    /// Latched alert-test lines
    alert_test: u32,

    /// DEBUG_POLICY_CTRL register (4-bit)
    debug_policy_ctrl: u32,

    /// DEBUG_POLICY_VALID register
    debug_policy_valid: u32,

    /// BOOT_CONTINUE register (DMI aperture)
    boot_continue: u32,

    /// FSM state
    fsm: DbgFsm,

    /// Lifecycle capability broadcast input
    lc_broadcast: Rc<RefCell<Signal<u32>>>,

    /// SoC debug state input (socdbg_tx from the lifecycle controller)
    socdbg_rx: Rc<RefCell<Signal<u32>>>,

    /// Boot status input from the power manager
    boot_status: Rc<RefCell<Signal<u32>>>,

    /// HALT_CPU_BOOT pin level
    halt_cpu_boot: bool,

    /// A0 auxiliary debug signals
    a0_debug_en: bool,
    a0_force_raw: bool,

    /// Skip the DFT_EN wait in test-capable lifecycle states
    dft_ignore: bool,

    /// Escalation received
    escalated: bool,

    /// Published debug policy (policy | valid flag)
    policy: Rc<RefCell<Signal<u32>>>,

    /// CPU boot-done wire; high only once the FSM reaches HALT_DONE
    cpu_boot_done: Rc<RefCell<Signal<bool>>>,

    /// Timer
    timer: Timer,
}

impl SocDbgRegs {
    pub fn new(
        clock: &Clock,
        lc_broadcast: Rc<RefCell<Signal<u32>>>,
        socdbg_rx: Rc<RefCell<Signal<u32>>>,
        boot_status: Rc<RefCell<Signal<u32>>>,
    ) -> Self {
        Self {
            intr_state: 0,
            intr_enable: 0,
            alert_test: 0,
            debug_policy_ctrl: DBG_POLICY_LOCKED,
            debug_policy_valid: 0,
            boot_continue: 0,
            fsm: DbgFsm::Idle,
            lc_broadcast,
            socdbg_rx,
            boot_status,
            halt_cpu_boot: false,
            a0_debug_en: false,
            a0_force_raw: false,
            dft_ignore: false,
            escalated: false,
            policy: Rc::new(RefCell::new(Signal::new(DBG_POLICY_LOCKED))),
            cpu_boot_done: Rc::new(RefCell::new(Signal::new(false))),
            timer: Timer::new(clock),
        }
    }

    pub fn fsm(&self) -> DbgFsm {
        self.fsm
    }

    pub fn policy_signal(&self) -> Rc<RefCell<Signal<u32>>> {
        self.policy.clone()
    }

    pub fn cpu_boot_done_signal(&self) -> Rc<RefCell<Signal<bool>>> {
        self.cpu_boot_done.clone()
    }

    pub fn set_halt_cpu_boot(&mut self, halt: bool) {
        self.halt_cpu_boot = halt;
        self.timer.schedule_poll_in(1);
    }

    pub fn set_a0_debug_en(&mut self, enable: bool) {
        self.a0_debug_en = enable;
        self.timer.schedule_poll_in(1);
    }

    pub fn set_a0_force_raw(&mut self, force: bool) {
        self.a0_force_raw = force;
        self.timer.schedule_poll_in(1);
    }

    pub fn set_dft_ignore(&mut self, ignore: bool) {
        self.dft_ignore = ignore;
        self.timer.schedule_poll_in(1);
    }

    /// Escalation input: policy goes locked/invalid, the FSM freezes.
    pub fn escalate(&mut self) {
        self.escalated = true;
        self.publish_policy();
    }

    fn lc_done(&self) -> bool {
        self.boot_status.borrow().level() & boot_status::LC_DONE != 0
    }

    /// Policy selection from the effective SoC-debug state.
    fn derive_policy(&self) -> (u32, bool) {
        if self.escalated {
            return (DBG_POLICY_LOCKED, false);
        }

        let effective = if self.a0_debug_en && self.a0_force_raw {
            SocDbgState::Raw
        } else {
            SocDbgState::try_from(self.socdbg_rx.borrow().level()).unwrap_or(SocDbgState::Raw)
        };

        let bcast = self.lc_broadcast.borrow().level();
        match effective {
            SocDbgState::Raw => {
                let unlocked =
                    bcast & (broadcast::DFT_EN | broadcast::HW_DEBUG_EN) != 0 || self.a0_debug_en;
                let policy = if unlocked {
                    DBG_POLICY_UNLOCKED
                } else {
                    DBG_POLICY_LOCKED
                };
                (policy, self.lc_done() || self.a0_debug_en)
            }
            SocDbgState::PreProd => (DBG_POLICY_UNLOCKED, self.lc_done()),
            SocDbgState::Prod => (
                self.debug_policy_ctrl & 0xf,
                self.debug_policy_valid & 1 != 0,
            ),
        }
    }

    fn publish_policy(&mut self) {
        let (policy, valid) = self.derive_policy();
        let value = policy | if valid { DBG_POLICY_VALID } else { 0 };
        self.policy.borrow_mut().set(value);
    }

    fn fsm_step(&mut self) {
        if self.escalated {
            return;
        }
        let bcast = self.lc_broadcast.borrow().level();
        loop {
            let next = match self.fsm {
                DbgFsm::Idle => {
                    if self.lc_done() {
                        DbgFsm::CheckLcSt
                    } else {
                        DbgFsm::Idle
                    }
                }
                DbgFsm::CheckLcSt => {
                    if bcast & broadcast::RAW_TEST_RMA != 0 && !self.dft_ignore {
                        DbgFsm::Wait4DftEn
                    } else {
                        DbgFsm::CheckHaltPin
                    }
                }
                DbgFsm::Wait4DftEn => {
                    if bcast & broadcast::DFT_EN != 0 {
                        DbgFsm::CheckHaltPin
                    } else {
                        DbgFsm::Wait4DftEn
                    }
                }
                DbgFsm::CheckHaltPin => {
                    if self.halt_cpu_boot {
                        DbgFsm::CheckJtagGo
                    } else {
                        DbgFsm::ContinueBoot
                    }
                }
                DbgFsm::CheckJtagGo => {
                    if self.boot_continue & 1 != 0 {
                        DbgFsm::ContinueBoot
                    } else {
                        DbgFsm::CheckJtagGo
                    }
                }
                DbgFsm::ContinueBoot => DbgFsm::HaltDone,
                DbgFsm::HaltDone => DbgFsm::HaltDone,
            };
            if next == self.fsm {
                break;
            }
            self.fsm = next;
        }
        self.cpu_boot_done
            .borrow_mut()
            .set(self.fsm == DbgFsm::HaltDone);
    }

    fn poll(&mut self) {
        self.publish_policy();
        self.fsm_step();
    }

    fn cold_reset(&mut self) {
        self.intr_state = 0;
        self.intr_enable = 0;
        self.alert_test = 0;
        self.debug_policy_ctrl = DBG_POLICY_LOCKED;
        self.debug_policy_valid = 0;
        self.boot_continue = 0;
        self.fsm = DbgFsm::Idle;
        self.escalated = false;
        self.policy.borrow_mut().set(DBG_POLICY_LOCKED);
        self.cpu_boot_done.borrow_mut().set(false);
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
}

/// Core register aperture of the debug controller.
#[derive(Bus)]
#[poll_fn(poll)]
#[cold_reset_fn(cold_reset)]
pub struct SocDbg {
    #[register(offset = 0x0000_0000, read_fn = on_read_intr_state, write_fn = on_write_intr_state)]
    #[register(offset = 0x0000_0004, read_fn = on_read_intr_enable, write_fn = on_write_intr_enable)]
    #[register(offset = 0x0000_0008, read_fn = on_read_intr_test, write_fn = on_write_intr_test)]
    #[register(offset = 0x0000_000c, read_fn = on_read_alert_test, write_fn = on_write_alert_test)]
    #[register(offset = 0x0000_0010, read_fn = on_read_policy_ctrl, write_fn = on_write_policy_ctrl)]
    #[register(offset = 0x0000_0014, read_fn = on_read_policy_valid, write_fn = on_write_policy_valid)]
    _fieldless_regs: (),

    pub regs: Rc<RefCell<SocDbgRegs>>,
}

impl SocDbg {
    pub fn new(regs: Rc<RefCell<SocDbgRegs>>) -> Self {
        Self {
            _fieldless_regs: (),
            regs,
        }
    }

    fn on_read_intr_state(&mut self, size: RvSize) -> Result<u32, BusError> {
        SocDbgRegs::word_sized_read(size)?;
        Ok(self.regs.borrow().intr_state)
    }

    fn on_write_intr_state(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        SocDbgRegs::word_sized_write(size)?;
        let mut regs = self.regs.borrow_mut();
        regs.intr_state &= !val;
        Ok(())
    }

    fn on_read_intr_enable(&mut self, size: RvSize) -> Result<u32, BusError> {
        SocDbgRegs::word_sized_read(size)?;
        Ok(self.regs.borrow().intr_enable)
    }

    fn on_write_intr_enable(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        SocDbgRegs::word_sized_write(size)?;
        self.regs.borrow_mut().intr_enable = val;
        Ok(())
    }

    fn on_read_intr_test(&mut self, size: RvSize) -> Result<u32, BusError> {
        SocDbgRegs::word_sized_read(size)?;
        println!("[soc_dbg] read of write-only INTR_TEST register");
        Ok(0)
    }

    fn on_write_intr_test(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        SocDbgRegs::word_sized_write(size)?;
        let mut regs = self.regs.borrow_mut();
        regs.intr_state |= val & 1;
        Ok(())
    }

    fn on_read_alert_test(&mut self, size: RvSize) -> Result<u32, BusError> {
        SocDbgRegs::word_sized_read(size)?;
        println!("[soc_dbg] read of write-only ALERT_TEST register");
        Ok(0)
    }

    fn on_write_alert_test(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        SocDbgRegs::word_sized_write(size)?;
        let mut regs = self.regs.borrow_mut();
        regs.alert_test |= val & 1;
        Ok(())
    }

    fn on_read_policy_ctrl(&mut self, size: RvSize) -> Result<u32, BusError> {
        SocDbgRegs::word_sized_read(size)?;
        Ok(self.regs.borrow().debug_policy_ctrl)
    }

    fn on_write_policy_ctrl(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        SocDbgRegs::word_sized_write(size)?;
        let mut regs = self.regs.borrow_mut();
        regs.debug_policy_ctrl = val & 0xf;
        regs.timer.schedule_poll_in(1);
        Ok(())
    }

    fn on_read_policy_valid(&mut self, size: RvSize) -> Result<u32, BusError> {
        SocDbgRegs::word_sized_read(size)?;
        Ok(self.regs.borrow().debug_policy_valid)
    }

    fn on_write_policy_valid(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        SocDbgRegs::word_sized_write(size)?;
        let mut regs = self.regs.borrow_mut();
        regs.debug_policy_valid = val & 1;
        regs.timer.schedule_poll_in(1);
        Ok(())
    }

    fn poll(&mut self) {
        self.regs.borrow_mut().poll();
    }

    fn cold_reset(&mut self) {
        self.regs.borrow_mut().cold_reset();
    }
}

/// DMI register aperture of the debug controller.
#[derive(Bus)]
pub struct SocDbgDmi {
    #[register(offset = 0x0000_0000, read_fn = on_read_boot_continue, write_fn = on_write_boot_continue)]
    #[register(offset = 0x0000_0004, read_fn = on_read_jtag_boot_status, write_fn = on_write_read_only)]
    #[register(offset = 0x0000_0008, read_fn = on_read_policy_mirror, write_fn = on_write_read_only)]
    _fieldless_regs: (),

    pub regs: Rc<RefCell<SocDbgRegs>>,
}

impl SocDbgDmi {
    pub fn new(regs: Rc<RefCell<SocDbgRegs>>) -> Self {
        Self {
            _fieldless_regs: (),
            regs,
        }
    }

    fn on_read_boot_continue(&mut self, size: RvSize) -> Result<u32, BusError> {
        SocDbgRegs::word_sized_read(size)?;
        Ok(self.regs.borrow().boot_continue)
    }

    fn on_write_boot_continue(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        SocDbgRegs::word_sized_write(size)?;
        let mut regs = self.regs.borrow_mut();
        regs.boot_continue = val & 1;
        regs.timer.schedule_poll_in(1);
        Ok(())
    }

    fn on_read_jtag_boot_status(&mut self, size: RvSize) -> Result<u32, BusError> {
        SocDbgRegs::word_sized_read(size)?;
        let regs = self.regs.borrow();
        let status = regs.boot_status.borrow().level();
        Ok(status & 0xffff)
    }

    fn on_read_policy_mirror(&mut self, size: RvSize) -> Result<u32, BusError> {
        SocDbgRegs::word_sized_read(size)?;
        let regs = self.regs.borrow();
        let policy = regs.policy.borrow().level();
        Ok(policy)
    }

    fn on_write_read_only(&mut self, size: RvSize, _val: RvData) -> Result<(), BusError> {
        SocDbgRegs::word_sized_write(size)?;
        println!("[soc_dbg] write to read-only register ignored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFSET_INTR_STATE: RvAddr = 0x00;
    const OFFSET_INTR_TEST: RvAddr = 0x08;
    const OFFSET_POLICY_CTRL: RvAddr = 0x10;
    const OFFSET_POLICY_VALID: RvAddr = 0x14;

    const DMI_BOOT_CONTINUE: RvAddr = 0x00;
    const DMI_JTAG_BOOT_STATUS: RvAddr = 0x04;
    const DMI_POLICY: RvAddr = 0x08;

    struct Harness {
        clock: Clock,
        dbg: SocDbg,
        dmi: SocDbgDmi,
        lc_broadcast: Rc<RefCell<Signal<u32>>>,
        socdbg_rx: Rc<RefCell<Signal<u32>>>,
        boot_status: Rc<RefCell<Signal<u32>>>,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Clock::new();
            let lc_broadcast = Rc::new(RefCell::new(Signal::new(0)));
            let socdbg_rx = Rc::new(RefCell::new(Signal::new(SocDbgState::Raw as u32)));
            let boot_status = Rc::new(RefCell::new(Signal::new(0)));
            let regs = Rc::new(RefCell::new(SocDbgRegs::new(
                &clock,
                lc_broadcast.clone(),
                socdbg_rx.clone(),
                boot_status.clone(),
            )));
            Self {
                clock,
                dbg: SocDbg::new(regs.clone()),
                dmi: SocDbgDmi::new(regs),
                lc_broadcast,
                socdbg_rx,
                boot_status,
            }
        }

        fn step(&mut self) {
            self.clock.increment(1);
            self.dbg.poll();
        }

        fn policy(&self) -> u32 {
            self.dbg.regs.borrow().policy.borrow().level()
        }

        fn fsm(&self) -> DbgFsm {
            self.dbg.regs.borrow().fsm()
        }

        fn boot_done(&self) -> bool {
            self.dbg.regs.borrow().cpu_boot_done.borrow().level()
        }

        fn set_lc_done(&mut self) {
            let level = self.boot_status.borrow().level();
            self.boot_status
                .borrow_mut()
                .set(level | boot_status::LC_DONE);
        }
    }

    #[test]
    fn test_raw_policy_locked_without_debug_caps() {
        let mut harness = Harness::new();
        harness.step();
        assert_eq!(harness.policy(), DBG_POLICY_LOCKED);
        assert_eq!(harness.fsm(), DbgFsm::Idle);
        assert!(!harness.boot_done());
    }

    #[test]
    fn test_raw_policy_unlocks_on_hw_debug_en() {
        let mut harness = Harness::new();
        harness.set_lc_done();
        harness
            .lc_broadcast
            .borrow_mut()
            .set(broadcast::HW_DEBUG_EN);
        harness.step();
        assert_eq!(harness.policy(), DBG_POLICY_UNLOCKED | DBG_POLICY_VALID);
    }

    #[test]
    fn test_raw_policy_a0_debug_overrides() {
        let mut harness = Harness::new();
        // No lc_done yet, but A0 debug counts as valid.
        harness.dbg.regs.borrow_mut().set_a0_debug_en(true);
        harness.step();
        assert_eq!(harness.policy(), DBG_POLICY_UNLOCKED | DBG_POLICY_VALID);
    }

    #[test]
    fn test_preprod_policy_unlocked() {
        let mut harness = Harness::new();
        harness
            .socdbg_rx
            .borrow_mut()
            .set(SocDbgState::PreProd as u32);
        harness.step();
        // Not valid until lc_done.
        assert_eq!(harness.policy(), DBG_POLICY_UNLOCKED);
        harness.set_lc_done();
        harness.step();
        assert_eq!(harness.policy(), DBG_POLICY_UNLOCKED | DBG_POLICY_VALID);
    }

    #[test]
    fn test_prod_policy_comes_from_registers() {
        let mut harness = Harness::new();
        harness.socdbg_rx.borrow_mut().set(SocDbgState::Prod as u32);
        harness.step();
        assert_eq!(harness.policy(), DBG_POLICY_LOCKED);

        harness
            .dbg
            .write(RvSize::Word, OFFSET_POLICY_CTRL, 0x5)
            .unwrap();
        harness
            .dbg
            .write(RvSize::Word, OFFSET_POLICY_VALID, 1)
            .unwrap();
        harness.step();
        assert_eq!(harness.policy(), 0x5 | DBG_POLICY_VALID);
        assert_eq!(
            harness.dmi.read(RvSize::Word, DMI_POLICY).unwrap(),
            0x5 | DBG_POLICY_VALID
        );
    }

    #[test]
    fn test_a0_force_raw_downgrades_prod() {
        let mut harness = Harness::new();
        harness.socdbg_rx.borrow_mut().set(SocDbgState::Prod as u32);
        let mut_regs = harness.dbg.regs.clone();
        mut_regs.borrow_mut().set_a0_debug_en(true);
        mut_regs.borrow_mut().set_a0_force_raw(true);
        harness.step();
        // Effective state is RAW with A0 debug: unlocked and valid.
        assert_eq!(harness.policy(), DBG_POLICY_UNLOCKED | DBG_POLICY_VALID);
    }

    #[test]
    fn test_fsm_bypass_path_without_halt() {
        let mut harness = Harness::new();
        // Non-test lifecycle state: no RAW_TEST_RMA capability.
        harness.lc_broadcast.borrow_mut().set(broadcast::CPU_EN);
        harness.set_lc_done();
        harness.step();
        assert_eq!(harness.fsm(), DbgFsm::HaltDone);
        assert!(harness.boot_done());
    }

    #[test]
    fn test_fsm_waits_for_dft_en_in_test_states() {
        let mut harness = Harness::new();
        harness
            .lc_broadcast
            .borrow_mut()
            .set(broadcast::RAW_TEST_RMA);
        harness.set_lc_done();
        harness.step();
        assert_eq!(harness.fsm(), DbgFsm::Wait4DftEn);
        assert!(!harness.boot_done());

        harness
            .lc_broadcast
            .borrow_mut()
            .set(broadcast::RAW_TEST_RMA | broadcast::DFT_EN);
        harness.step();
        assert_eq!(harness.fsm(), DbgFsm::HaltDone);
        assert!(harness.boot_done());
    }

    #[test]
    fn test_fsm_halt_waits_for_boot_continue() {
        let mut harness = Harness::new();
        harness.dbg.regs.borrow_mut().set_halt_cpu_boot(true);
        harness.lc_broadcast.borrow_mut().set(broadcast::CPU_EN);
        harness.set_lc_done();
        harness.step();
        assert_eq!(harness.fsm(), DbgFsm::CheckJtagGo);
        assert!(!harness.boot_done());

        harness
            .dmi
            .write(RvSize::Word, DMI_BOOT_CONTINUE, 1)
            .unwrap();
        harness.step();
        assert_eq!(harness.fsm(), DbgFsm::HaltDone);
        assert!(harness.boot_done());
    }

    #[test]
    fn test_jtag_boot_status_mirror() {
        let mut harness = Harness::new();
        harness
            .boot_status
            .borrow_mut()
            .set(boot_status::MAIN_CLK | boot_status::LC_DONE);
        assert_eq!(
            harness.dmi.read(RvSize::Word, DMI_JTAG_BOOT_STATUS).unwrap(),
            boot_status::MAIN_CLK | boot_status::LC_DONE
        );
    }

    #[test]
    fn test_escalation_locks_policy_and_freezes_fsm() {
        let mut harness = Harness::new();
        harness
            .lc_broadcast
            .borrow_mut()
            .set(broadcast::HW_DEBUG_EN);
        harness.set_lc_done();
        harness.step();
        assert_eq!(harness.policy(), DBG_POLICY_UNLOCKED | DBG_POLICY_VALID);

        harness.dbg.regs.borrow_mut().escalate();
        harness.step();
        assert_eq!(harness.policy(), DBG_POLICY_LOCKED);
    }

    #[test]
    fn test_alert_test_lines_accumulate() {
        let mut harness = Harness::new();
        harness
            .dbg
            .write(RvSize::Word, 0x0c, 1)
            .unwrap();
        assert_eq!(harness.dbg.regs.borrow().alert_test, 1);
        assert_eq!(harness.dbg.read(RvSize::Word, 0x0c).unwrap(), 0);
    }

    #[test]
    fn test_intr_state_rw1c() {
        let mut harness = Harness::new();
        harness.dbg.write(RvSize::Word, OFFSET_INTR_TEST, 1).unwrap();
        assert_eq!(
            harness.dbg.read(RvSize::Word, OFFSET_INTR_STATE).unwrap(),
            1
        );
        harness
            .dbg
            .write(RvSize::Word, OFFSET_INTR_STATE, 1)
            .unwrap();
        assert_eq!(
            harness.dbg.read(RvSize::Word, OFFSET_INTR_STATE).unwrap(),
            0
        );
    }
}
