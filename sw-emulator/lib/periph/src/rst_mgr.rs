/*++

Licensed under the Apache-2.0 license.

File Name:

    rst_mgr.rs

Abstract:

    File contains the reset manager implementation: reset-cause latch,
    per-device software reset gating and the bus-wide cold reset fan-out.

--*/

use std::cell::RefCell;
use std::rc::Rc;

use sentinel_emu_bus::{Bus, BusError, Clock, Signal, Timer, TimerAction};
use sentinel_emu_derive::Bus;
use sentinel_emu_types::{RvAddr, RvData, RvSize};

use crate::helpers::{MUBI4_FALSE, MUBI4_TRUE};
use crate::pwr_mgr::{event, PwrEventLatch};

/// Number of peripherals under software reset control.
pub const SW_RST_DEVICES: usize = 8;

/// The number of clock cycles between latching a reset request and the
/// bus-wide fan-out.
const RESET_FANOUT_TICKS: u64 = 4;

/// Cause recorded in RESET_INFO (write-1-to-clear).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetCause {
    /// Power-on reset; first boot only.
    Por,
    LowPower,
    Sw,
    /// Request from a peripheral reset-request wire.
    Peripheral(usize),
}

impl ResetCause {
    /// Bit recorded in the RESET_INFO register.
    pub fn info_bit(&self) -> u32 {
        match self {
            ResetCause::Por => 1 << 0,
            ResetCause::LowPower => 1 << 1,
            ResetCause::Sw => 1 << 2,
            ResetCause::Peripheral(src) => 1 << (3 + src),
        }
    }
}

/// Reset manager register file.
#[derive(Bus)]
#[cold_reset_fn(cold_reset)]
pub struct RstMgrRegs {
    #[register(offset = 0x0000_0000, read_fn = on_read_alert_test, write_fn = on_write_alert_test)]
    #[register(offset = 0x0000_0004, read_fn = on_read_reset_req, write_fn = on_write_reset_req)]
    _fieldless_regs: (),

    /// RESET_INFO register (RW1C)
    #[register(offset = 0x0000_0008, write_fn = on_write_reset_info)]
    reset_info: u32,

    /// ALERT_REGWEN register (RW0C)
    #[register(offset = 0x0000_000c, write_fn = on_write_alert_regwen)]
    alert_regwen: u32,

    /// ALERT_INFO_CTRL register, gated by ALERT_REGWEN
    #[register(offset = 0x0000_0010, write_fn = on_write_alert_info_ctrl)]
    alert_info_ctrl: u32,

    /// ALERT_INFO_ATTR register
    #[register(offset = 0x0000_0014, write_fn = on_write_read_only)]
    alert_info_attr: u32,

    /// ALERT_INFO register
    #[register(offset = 0x0000_0018, write_fn = on_write_read_only)]
    alert_info: u32,

    /// CPU_REGWEN register (RW0C)
    #[register(offset = 0x0000_001c, write_fn = on_write_cpu_regwen)]
    cpu_regwen: u32,

    /// CPU_INFO_CTRL register, gated by CPU_REGWEN
    #[register(offset = 0x0000_0020, write_fn = on_write_cpu_info_ctrl)]
    cpu_info_ctrl: u32,

    /// CPU_INFO_ATTR register
    #[register(offset = 0x0000_0024, write_fn = on_write_read_only)]
    cpu_info_attr: u32,

    /// CPU_INFO register
    #[register(offset = 0x0000_0028, write_fn = on_write_read_only)]
    cpu_info: u32,

    /// SW_RST_REGWEN registers (RW0C)
    #[register_array(offset = 0x0000_002c, write_fn = on_write_sw_rst_regwen)]
    sw_rst_regwen: [u32; SW_RST_DEVICES],

    /// SW_RST_CTRL_N registers (active low)
    #[register_array(offset = 0x0000_004c, write_fn = on_write_sw_rst_ctrl_n)]
    sw_rst_ctrl_n: [u32; SW_RST_DEVICES],

    /// ERR_CODE register
    #[register(offset = 0x0000_006c, write_fn = on_write_read_only)]
    err_code: u32,

    /// Latched alert-test lines
    alert_test: u32,

    /// RESET_REQ register value (mubi4)
    reset_req: u32,

    /// Power manager event latch; SW_RESET is raised here
    events: Rc<RefCell<PwrEventLatch>>,

    /// SW_RST output wire
    sw_rst: Rc<RefCell<Signal<bool>>>,

    /// Bitmap of devices currently held in cold reset by software
    dev_resets: Rc<RefCell<Signal<u32>>>,

    /// Timer
    timer: Timer,
}

impl RstMgrRegs {
    pub fn new(clock: &Clock, events: Rc<RefCell<PwrEventLatch>>, por: bool) -> Self {
        Self {
            _fieldless_regs: (),
            reset_info: if por { ResetCause::Por.info_bit() } else { 0 },
            alert_regwen: 1,
            alert_info_ctrl: 0,
            alert_info_attr: 0,
            alert_info: 0,
            cpu_regwen: 1,
            cpu_info_ctrl: 0,
            cpu_info_attr: 0,
            cpu_info: 0,
            sw_rst_regwen: [1; SW_RST_DEVICES],
            sw_rst_ctrl_n: [1; SW_RST_DEVICES],
            err_code: 0,
            alert_test: 0,
            reset_req: MUBI4_FALSE,
            events,
            sw_rst: Rc::new(RefCell::new(Signal::new(false))),
            dev_resets: Rc::new(RefCell::new(Signal::new(0))),
            timer: Timer::new(clock),
        }
    }

    /// Latch the reset cause and fan a cold reset out to every sibling
    /// peripheral on the bus.
    pub fn reset_req(&mut self, fast_clock_domain: bool, cause: ResetCause) {
        if !fast_clock_domain {
            println!("[rst_mgr] slow-domain reset request treated as fast-domain");
        }
        self.reset_info = cause.info_bit();
        self.timer
            .schedule_action_in(RESET_FANOUT_TICKS, TimerAction::ColdReset);
    }

    pub fn reset_info_bits(&self) -> u32 {
        self.reset_info
    }

    pub fn sw_rst_signal(&self) -> Rc<RefCell<Signal<bool>>> {
        self.sw_rst.clone()
    }

    /// Bitmap of devices currently held in reset (1 = in reset).
    pub fn dev_reset_signal(&self) -> Rc<RefCell<Signal<u32>>> {
        self.dev_resets.clone()
    }

    fn on_read_alert_test(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        println!("[rst_mgr] read of write-only ALERT_TEST register");
        Ok(0)
    }

    fn on_write_alert_test(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        self.alert_test |= val & 0x3;
        Ok(())
    }

    fn on_read_reset_req(&mut self, size: RvSize) -> Result<u32, BusError> {
        Self::word_sized_read(size)?;
        Ok(self.reset_req)
    }

    /// Software reset request: only the multibit-true pattern arms it.
    fn on_write_reset_req(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        self.reset_req = val & 0xf;
        if self.reset_req == MUBI4_TRUE {
            self.sw_rst.borrow_mut().set(true);
            self.events.borrow_mut().raise(event::SW_RESET);
        }
        Ok(())
    }

    fn on_write_reset_info(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        // RW1C
        self.reset_info &= !val;
        Ok(())
    }

    fn on_write_alert_regwen(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        if val & 1 == 0 {
            self.alert_regwen = 0;
        }
        Ok(())
    }

    fn on_write_alert_info_ctrl(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        if self.alert_regwen & 1 != 0 {
            self.alert_info_ctrl = val;
        } else {
            println!("[rst_mgr] ALERT_INFO_CTRL write blocked by ALERT_REGWEN");
        }
        Ok(())
    }

    fn on_write_cpu_regwen(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        if val & 1 == 0 {
            self.cpu_regwen = 0;
        }
        Ok(())
    }

    fn on_write_cpu_info_ctrl(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        if self.cpu_regwen & 1 != 0 {
            self.cpu_info_ctrl = val;
        } else {
            println!("[rst_mgr] CPU_INFO_CTRL write blocked by CPU_REGWEN");
        }
        Ok(())
    }

    fn on_write_read_only(&mut self, size: RvSize, _val: RvData) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        println!("[rst_mgr] write to read-only register ignored");
        Ok(())
    }

    fn on_write_sw_rst_regwen(
        &mut self,
        size: RvSize,
        index: usize,
        val: RvData,
    ) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        // RW0C: once cleared, stays cleared until device reset.
        if val & 1 == 0 {
            self.sw_rst_regwen[index] = 0;
        }
        Ok(())
    }

    fn on_write_sw_rst_ctrl_n(
        &mut self,
        size: RvSize,
        index: usize,
        val: RvData,
    ) -> Result<(), BusError> {
        Self::word_sized_write(size)?;
        if self.sw_rst_regwen[index] & 1 == 0 {
            println!("[rst_mgr] SW_RST_CTRL_N_{index} write blocked by SW_RST_REGWEN_{index}");
            return Ok(());
        }
        self.sw_rst_ctrl_n[index] = val & 1;
        let mut resets = self.dev_resets.borrow_mut();
        let mut bitmap = resets.level();
        if val & 1 == 0 {
            bitmap |= 1 << index;
        } else {
            bitmap &= !(1 << index);
        }
        resets.set(bitmap);
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

    /// Non-POR reset entry: the latched cause survives, test/debug state is
    /// scrubbed and every lock re-arms.
    fn cold_reset(&mut self) {
        self.alert_test = 0;
        self.reset_req = MUBI4_FALSE;
        self.alert_regwen = 1;
        self.cpu_regwen = 1;
        self.sw_rst_regwen = [1; SW_RST_DEVICES];
        self.sw_rst_ctrl_n = [1; SW_RST_DEVICES];
        self.sw_rst.borrow_mut().set(false);
        self.dev_resets.borrow_mut().set(0);
    }
}

/// Reset manager peripheral.
#[derive(Clone)]
pub struct RstMgr {
    pub regs: Rc<RefCell<RstMgrRegs>>,
}

impl RstMgr {
    pub fn new(clock: &Clock, events: Rc<RefCell<PwrEventLatch>>, por: bool) -> Self {
        Self {
            regs: Rc::new(RefCell::new(RstMgrRegs::new(clock, events, por))),
        }
    }

    pub fn reset_req(&self, fast_clock_domain: bool, cause: ResetCause) {
        self.regs.borrow_mut().reset_req(fast_clock_domain, cause);
    }
}

impl Bus for RstMgr {
    fn read(&mut self, size: RvSize, addr: RvAddr) -> Result<RvData, BusError> {
        self.regs.borrow_mut().read(size, addr)
    }

    fn write(&mut self, size: RvSize, addr: RvAddr, val: RvData) -> Result<(), BusError> {
        self.regs.borrow_mut().write(size, addr, val)
    }

    fn poll(&mut self) {
        self.regs.borrow_mut().poll();
    }

    fn cold_reset(&mut self) {
        self.regs.borrow_mut().cold_reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFSET_ALERT_TEST: RvAddr = 0x00;
    const OFFSET_RESET_REQ: RvAddr = 0x04;
    const OFFSET_RESET_INFO: RvAddr = 0x08;
    const OFFSET_SW_RST_REGWEN_0: RvAddr = 0x2c;
    const OFFSET_SW_RST_CTRL_N_0: RvAddr = 0x4c;

    fn new_rst(clock: &Clock, por: bool) -> (RstMgr, Rc<RefCell<PwrEventLatch>>) {
        let events = Rc::new(RefCell::new(PwrEventLatch::new(clock)));
        let rst = RstMgr::new(clock, events.clone(), por);
        (rst, events)
    }

    #[test]
    fn test_por_sets_reset_info() {
        let clock = Clock::new();
        let (mut rst, _events) = new_rst(&clock, true);
        assert_eq!(
            rst.read(RvSize::Word, OFFSET_RESET_INFO).unwrap(),
            ResetCause::Por.info_bit()
        );

        // RW1C: write-one clears, a second write is a no-op.
        rst.write(RvSize::Word, OFFSET_RESET_INFO, ResetCause::Por.info_bit())
            .unwrap();
        assert_eq!(rst.read(RvSize::Word, OFFSET_RESET_INFO).unwrap(), 0);
        rst.write(RvSize::Word, OFFSET_RESET_INFO, ResetCause::Por.info_bit())
            .unwrap();
        assert_eq!(rst.read(RvSize::Word, OFFSET_RESET_INFO).unwrap(), 0);
    }

    #[test]
    fn test_reset_req_latches_cause_and_fans_out() {
        let clock = Clock::new();
        let (rst, _events) = new_rst(&clock, true);

        rst.reset_req(true, ResetCause::Peripheral(2));
        assert_eq!(
            rst.regs.borrow().reset_info_bits(),
            ResetCause::Peripheral(2).info_bit()
        );

        let fired = clock.increment(RESET_FANOUT_TICKS + 1);
        assert!(fired.contains(&TimerAction::ColdReset));
    }

    #[test]
    fn test_sw_reset_request_mubi() {
        let clock = Clock::new();
        let (mut rst, events) = new_rst(&clock, true);
        let sw_rst = rst.regs.borrow().sw_rst_signal();

        // A non-true pattern does nothing.
        rst.write(RvSize::Word, OFFSET_RESET_REQ, MUBI4_FALSE).unwrap();
        assert!(!sw_rst.borrow().level());
        assert_eq!(events.borrow_mut().take() & event::SW_RESET, 0);

        rst.write(RvSize::Word, OFFSET_RESET_REQ, MUBI4_TRUE).unwrap();
        assert!(sw_rst.borrow().level());
        assert_ne!(events.borrow_mut().take() & event::SW_RESET, 0);
        assert_eq!(
            rst.read(RvSize::Word, OFFSET_RESET_REQ).unwrap(),
            MUBI4_TRUE
        );
    }

    #[test]
    fn test_sw_rst_gating() {
        let clock = Clock::new();
        let (mut rst, _events) = new_rst(&clock, true);
        let dev_resets = rst.regs.borrow().dev_reset_signal();

        let regwen_1 = OFFSET_SW_RST_REGWEN_0 + 4;
        let ctrl_n_1 = OFFSET_SW_RST_CTRL_N_0 + 4;

        // Clear the lock for device 1, then try to assert its reset.
        rst.write(RvSize::Word, regwen_1, 0).unwrap();
        assert_eq!(rst.read(RvSize::Word, regwen_1).unwrap(), 0);
        rst.write(RvSize::Word, ctrl_n_1, 0).unwrap();

        // The write had no effect: register keeps its value, no reset edge.
        assert_eq!(rst.read(RvSize::Word, ctrl_n_1).unwrap(), 1);
        assert_eq!(dev_resets.borrow().level(), 0);

        // The lock cannot be re-armed by software.
        rst.write(RvSize::Word, regwen_1, 1).unwrap();
        assert_eq!(rst.read(RvSize::Word, regwen_1).unwrap(), 0);
    }

    #[test]
    fn test_sw_rst_assert_release() {
        let clock = Clock::new();
        let (mut rst, _events) = new_rst(&clock, true);
        let dev_resets = rst.regs.borrow().dev_reset_signal();

        let ctrl_n_3 = OFFSET_SW_RST_CTRL_N_0 + 12;
        rst.write(RvSize::Word, ctrl_n_3, 0).unwrap();
        assert_eq!(rst.read(RvSize::Word, ctrl_n_3).unwrap(), 0);
        assert_eq!(dev_resets.borrow_mut().take_edge(), Some(1 << 3));

        rst.write(RvSize::Word, ctrl_n_3, 1).unwrap();
        assert_eq!(dev_resets.borrow_mut().take_edge(), Some(0));
    }

    #[test]
    fn test_cold_reset_rearms_locks() {
        let clock = Clock::new();
        let (mut rst, _events) = new_rst(&clock, true);

        rst.write(RvSize::Word, OFFSET_SW_RST_REGWEN_0, 0).unwrap();
        rst.write(RvSize::Word, OFFSET_ALERT_TEST, 0x3).unwrap();
        rst.reset_req(true, ResetCause::Sw);
        rst.cold_reset();

        assert_eq!(rst.read(RvSize::Word, OFFSET_SW_RST_REGWEN_0).unwrap(), 1);
        assert_eq!(rst.regs.borrow().alert_test, 0);
        // The cause latched before the reset survives it.
        assert_eq!(
            rst.read(RvSize::Word, OFFSET_RESET_INFO).unwrap(),
            ResetCause::Sw.info_bit()
        );
    }
}
