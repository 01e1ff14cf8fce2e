/*++

Licensed under the Apache-2.0 license.

File Name:

    otp_ctrl.rs

Abstract:

    File contains the OTP controller collaborator model. It serves the
    lifecycle partition bundle to the lifecycle controller and accepts
    asynchronous program requests for the state and counter sequences.

--*/

use std::cell::RefCell;
use std::rc::Rc;

use sentinel_emu_bus::{ActionHandle, Clock, Timer};

use crate::kmac::Kmac;
use crate::lifecycle::{
    IdState, LcState, LcTemplates, SocDbgState, TokenKind, LC_CNT_WORDS, LC_STATE_WORDS,
    NUM_TOKEN_KINDS, OWNERSHIP_WORDS, SOC_DBG_WORDS,
};
use crate::pwr_mgr::{event, PwrEventLatch};

/// The number of clock cycles OTP takes to come out of its init sequence.
const OTP_INIT_TICKS: u64 = 20;

/// The number of clock cycles one program operation takes.
const OTP_PROG_TICKS: u64 = 50;

/// Everything the lifecycle controller reads out of OTP at init time.
#[derive(Clone)]
pub struct OtpInitBundle {
    pub lc_state_words: [u16; LC_STATE_WORDS],
    pub lc_cnt_words: [u16; LC_CNT_WORDS],

    /// Lifecycle partition integrity, as reported by OTP.
    pub lc_valid: bool,

    /// Raw secret-partition validity word, decoded into `LC_ID_STATE`.
    pub secret_valid: u32,

    /// Hashed token table; only entries flagged in `token_valid` are
    /// provisioned.
    pub hashed_tokens: [[u8; 16]; NUM_TOKEN_KINDS],

    /// Bitmap over `TokenKind` of provisioned entries.
    pub token_valid: u8,

    pub socdbg_words: [u16; SOC_DBG_WORDS],
    pub ownership_words: [u16; OWNERSHIP_WORDS],
    pub device_id: [u32; 8],
    pub manuf_state: [u32; 8],
}

impl OtpInitBundle {
    /// Build a bundle describing a device provisioned into `state` with the
    /// given transition count. Secret tokens are hashed here, the same way
    /// the silicon provisioning flow would store them.
    pub fn for_state(
        templates: &LcTemplates,
        state: LcState,
        count: u32,
        id_state: IdState,
        secret_tokens: &[(TokenKind, [u8; 16])],
    ) -> Self {
        let mut bundle = Self {
            lc_state_words: templates.state_words(state).unwrap_or([0; LC_STATE_WORDS]),
            lc_cnt_words: templates.cnt_words(count).unwrap_or([0; LC_CNT_WORDS]),
            lc_valid: true,
            secret_valid: id_state.into(),
            hashed_tokens: [[0; 16]; NUM_TOKEN_KINDS],
            token_valid: 0,
            socdbg_words: templates.socdbg_words(SocDbgState::Raw),
            ownership_words: templates.ownership_words(0).unwrap(),
            device_id: [0; 8],
            manuf_state: [0; 8],
        };
        for (kind, token) in secret_tokens {
            bundle.hashed_tokens[*kind as usize] = Kmac::hash_token(token);
            bundle.token_valid |= 1 << (*kind as usize);
        }
        bundle
    }
}

/// Program error reported through the asynchronous ack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OtpError {
    /// The partition refused the write (consistency check failed).
    Rejected,

    /// The write was attempted but did not stick.
    Failed,
}

/// One outstanding program request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OtpProgram {
    Counter([u16; LC_CNT_WORDS]),
    State([u16; LC_STATE_WORDS]),
}

/// OTP controller model.
pub struct OtpCtrl {
    /// Timer
    timer: Timer,

    /// Power manager event latch; OTP_DONE is raised here
    events: Rc<RefCell<PwrEventLatch>>,

    /// Lifecycle partition contents
    bundle: OtpInitBundle,

    /// Pending init request
    init_action: Option<ActionHandle>,

    /// Pending program request
    program: Option<OtpProgram>,

    /// Program completion action
    program_action: Option<ActionHandle>,

    /// Ack waiting to be claimed by the lifecycle controller
    ack: Option<Result<(), OtpError>>,

    /// Error injection: refuse program requests
    reject_programs: bool,

    /// Error injection: fail program requests
    fail_programs: bool,
}

impl OtpCtrl {
    /// Create a new instance of the OTP controller model.
    pub fn new(clock: &Clock, events: Rc<RefCell<PwrEventLatch>>, bundle: OtpInitBundle) -> Self {
        Self {
            timer: Timer::new(clock),
            events,
            bundle,
            init_action: None,
            program: None,
            program_action: None,
            ack: None,
            reject_programs: false,
            fail_programs: false,
        }
    }

    /// Power manager `otp_req` wire: start the init sequence. The `otp_done`
    /// event fires when it completes.
    pub fn init(&mut self) {
        if self.init_action.is_none() {
            self.init_action = Some(self.timer.schedule_poll_in(OTP_INIT_TICKS));
        }
    }

    /// Lifecycle partition bundle, as read during lifecycle init.
    pub fn init_read(&self) -> OtpInitBundle {
        self.bundle.clone()
    }

    /// Submit an asynchronous program request. Returns false if another
    /// request is still in flight.
    pub fn program(&mut self, request: OtpProgram) -> bool {
        if self.program.is_some() {
            return false;
        }
        self.program = Some(request);
        self.program_action = Some(self.timer.schedule_poll_in(OTP_PROG_TICKS));
        true
    }

    /// Claim a completed program ack.
    pub fn take_ack(&mut self) -> Option<Result<(), OtpError>> {
        self.ack.take()
    }

    /// Error injection: refuse subsequent program requests.
    pub fn set_reject_programs(&mut self, reject: bool) {
        self.reject_programs = reject;
    }

    /// Error injection: fail subsequent program requests.
    pub fn set_fail_programs(&mut self, fail: bool) {
        self.fail_programs = fail;
    }

    /// Called by the root bus on every poll.
    pub fn poll(&mut self) {
        if self.timer.fired(&mut self.init_action) {
            self.events.borrow_mut().raise(event::OTP_DONE);
        }
        if self.timer.fired(&mut self.program_action) {
            self.program_complete();
        }
    }

    fn program_complete(&mut self) {
        let Some(request) = self.program.take() else {
            return;
        };
        self.ack = Some(if self.reject_programs {
            Err(OtpError::Rejected)
        } else if self.fail_programs {
            Err(OtpError::Failed)
        } else {
            match request {
                OtpProgram::Counter(words) => self.bundle.lc_cnt_words = words,
                OtpProgram::State(words) => self.bundle.lc_state_words = words,
            }
            Ok(())
        });

        // Let the lifecycle controller drain the ack on the next tick.
        self.timer.schedule_poll_in(1);
    }
}
