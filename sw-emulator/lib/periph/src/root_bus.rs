/*++

Licensed under the Apache-2.0 license.

File Name:

    root_bus.rs

Abstract:

    File contains the root Bus implementation for the Sentinel lifecycle
    control plane: the four controllers, their OTP and KMAC collaborators,
    and the wires between them.

--*/

use std::cell::RefCell;
use std::rc::Rc;

use sentinel_emu_bus::Clock;
use sentinel_emu_derive::Bus;

use crate::config::{ConfigError, SocConfig, SocProperties};
use crate::kmac::Kmac;
use crate::lc_ctrl::{LcCtrl, LcCtrlDmi, LcCtrlRegs};
use crate::lifecycle::{IdState, LcState, TokenKind};
use crate::otp_ctrl::{OtpCtrl, OtpInitBundle};
use crate::pwr_mgr::{event, PwrEventLatch, PwrMgr};
use crate::rst_mgr::RstMgr;
use crate::soc_dbg::{SocDbg, SocDbgDmi, SocDbgRegs};

/// Host process exit code used when the main power manager instance sees an
/// escalation.
pub const ESCALATION_EXIT_CODE: i32 = 39;

pub const LC_CTRL_OFFSET: u32 = 0x3000_0000;
pub const LC_CTRL_DMI_OFFSET: u32 = 0x3001_0000;
pub const PWR_MGR_OFFSET: u32 = 0x3002_0000;
pub const RST_MGR_OFFSET: u32 = 0x3003_0000;
pub const SOC_DBG_OFFSET: u32 = 0x3004_0000;
pub const SOC_DBG_DMI_OFFSET: u32 = 0x3005_0000;

/// Callback invoked to shut the host down on escalation.
pub struct ShutdownCb(pub Box<dyn FnMut(i32)>);
impl ShutdownCb {
    pub fn new(f: impl FnMut(i32) + 'static) -> Self {
        Self(Box::new(f))
    }
}
impl Default for ShutdownCb {
    fn default() -> Self {
        Self(Box::new(|code| std::process::exit(code)))
    }
}
impl std::fmt::Debug for ShutdownCb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ShutdownCb")
            .field(&"<unknown closure>")
            .finish()
    }
}

/// Sentinel Root Bus Arguments
pub struct SentinelRootBusArgs {
    pub props: SocProperties,

    /// Lifecycle state provisioned into the OTP image
    pub lifecycle_state: LcState,

    /// Transition count provisioned into the OTP image
    pub transition_count: u32,

    /// Secret-partition state provisioned into the OTP image
    pub id_state: IdState,

    /// Unhashed secret tokens provisioned into the OTP image
    pub secret_tokens: Vec<(TokenKind, [u8; 16])>,

    /// Level of the lifecycle force-raw input wire
    pub force_raw: bool,

    /// Level of the HALT_CPU_BOOT pin
    pub halt_cpu_boot: bool,

    /// Callback invoked when the main power manager escalates
    pub shutdown_cb: ShutdownCb,
}

impl Default for SentinelRootBusArgs {
    fn default() -> Self {
        Self {
            props: SocProperties::default(),
            lifecycle_state: LcState::Raw,
            transition_count: 0,
            id_state: IdState::Blank,
            secret_tokens: Vec::new(),
            force_raw: false,
            halt_cpu_boot: false,
            shutdown_cb: ShutdownCb::default(),
        }
    }
}

#[derive(Bus)]
#[poll_fn(poll)]
pub struct SentinelRootBus {
    #[peripheral(offset = 0x3000_0000, len = 0x8c)]
    pub lc_ctrl: LcCtrl,

    #[peripheral(offset = 0x3001_0000, len = 0x8c)]
    pub lc_ctrl_dmi: LcCtrlDmi,

    #[peripheral(offset = 0x3002_0000, len = 0x44)]
    pub pwr_mgr: PwrMgr,

    #[peripheral(offset = 0x3003_0000, len = 0x70)]
    pub rst_mgr: RstMgr,

    #[peripheral(offset = 0x3004_0000, len = 0x1c)]
    pub soc_dbg: SocDbg,

    #[peripheral(offset = 0x3005_0000, len = 0xc)]
    pub soc_dbg_dmi: SocDbgDmi,

    pub otp: Rc<RefCell<OtpCtrl>>,
    pub kmac: Rc<RefCell<Kmac>>,

    events: Rc<RefCell<PwrEventLatch>>,
}

impl SentinelRootBus {
    /// Build the control plane. Property validation failures are fatal.
    pub fn new(clock: &Clock, args: SentinelRootBusArgs) -> Result<Self, ConfigError> {
        let config = SocConfig::new(&args.props)?;

        let events = Rc::new(RefCell::new(PwrEventLatch::new(clock)));
        let bundle = OtpInitBundle::for_state(
            &config.templates,
            args.lifecycle_state,
            args.transition_count,
            args.id_state,
            &args.secret_tokens,
        );
        let otp = Rc::new(RefCell::new(OtpCtrl::new(clock, events.clone(), bundle)));
        let kmac = Rc::new(RefCell::new(Kmac::new(clock)));

        let lc_regs = Rc::new(RefCell::new(LcCtrlRegs::new(
            clock,
            config.clone(),
            otp.clone(),
            kmac.clone(),
            events.clone(),
        )));
        lc_regs.borrow_mut().set_force_raw(args.force_raw);

        let rst_mgr = RstMgr::new(clock, events.clone(), config.por);

        let pwr_mgr = PwrMgr::new(
            clock,
            &config,
            events.clone(),
            lc_regs.clone(),
            otp.clone(),
            rst_mgr.clone(),
            args.shutdown_cb,
        );

        let dbg_regs = Rc::new(RefCell::new(SocDbgRegs::new(
            clock,
            lc_regs.borrow().broadcast_signal(),
            lc_regs.borrow().socdbg_signal(),
            pwr_mgr.boot_status_signal(),
        )));
        dbg_regs.borrow_mut().set_halt_cpu_boot(args.halt_cpu_boot);

        Ok(Self {
            lc_ctrl: LcCtrl::new(lc_regs.clone()),
            lc_ctrl_dmi: LcCtrlDmi::new(lc_regs),
            pwr_mgr,
            rst_mgr,
            soc_dbg: SocDbg::new(dbg_regs.clone()),
            soc_dbg_dmi: SocDbgDmi::new(dbg_regs),
            otp,
            kmac,
            events,
        })
    }

    /// Escalation wire from the alert handler: fans out to LC, PWR and DBG.
    pub fn escalate(&mut self) {
        self.lc_ctrl.regs.borrow_mut().escalate();
        self.soc_dbg.regs.borrow_mut().escalate();
        self.events.borrow_mut().raise(event::ESCALATE);
    }

    pub fn rom_done(&mut self, index: usize) {
        self.pwr_mgr.rom_done(index);
    }

    pub fn rom_good(&mut self, index: usize) {
        self.pwr_mgr.rom_good(index);
    }

    pub fn reset_request(&mut self, src: usize) {
        self.pwr_mgr.reset_request(src);
    }

    pub fn wakeup_request(&mut self, src: usize) {
        self.pwr_mgr.wakeup_request(src);
    }

    pub fn set_holdon_fetch(&mut self, holdon: bool) {
        self.pwr_mgr.set_holdon_fetch(holdon);
    }

    fn poll(&mut self) {
        self.otp.borrow_mut().poll();
    }
}
