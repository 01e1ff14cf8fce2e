/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains exports for the Sentinel Emulator Peripheral library.

--*/

mod config;
mod helpers;
mod kmac;
mod lc_ctrl;
mod lifecycle;
mod otp_ctrl;
mod pwr_mgr;
mod rst_mgr;
mod soc_dbg;
mod root_bus;

pub use config::{ConfigError, SocConfig, SocProperties};
pub use helpers::{MUBI4_FALSE, MUBI4_TRUE, MUBI8_FALSE, MUBI8_TRUE};
pub use kmac::{Kmac, KmacDigestShares, LC_TOKEN_CUSTOMIZATION};
pub use lc_ctrl::{LcCtrl, LcCtrlDmi, LcCtrlFsm, LcCtrlRegs, LcCtrlRequester, Status as LcCtrlStatus};
pub use lifecycle::{
    broadcast, IdState, KeyMgrDiv, LcState, LcTemplates, SocDbgState, TokenKind, TRANSITION_MATRIX,
};
pub use otp_ctrl::{OtpCtrl, OtpError, OtpInitBundle, OtpProgram};
pub use pwr_mgr::{boot_status, event, FastState, PwrEventLatch, PwrMgr, SlowState};
pub use root_bus::{
    SentinelRootBus, SentinelRootBusArgs, ShutdownCb, ESCALATION_EXIT_CODE, LC_CTRL_DMI_OFFSET,
    LC_CTRL_OFFSET, PWR_MGR_OFFSET, RST_MGR_OFFSET, SOC_DBG_DMI_OFFSET, SOC_DBG_OFFSET,
};
pub use rst_mgr::{ResetCause, RstMgr, SW_RST_DEVICES};
pub use soc_dbg::{
    DbgFsm, SocDbg, SocDbgDmi, SocDbgRegs, DBG_POLICY_LOCKED, DBG_POLICY_UNLOCKED,
    DBG_POLICY_VALID,
};
