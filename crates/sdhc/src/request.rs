//! Request engine: issues a command with its optional data phase, waits on
//! the completion channel and retries transient failures.

use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::Instant;

use sdhc_hw::card::opcode;
use sdhc_hw::mmio::sdhc::adma_error;
use tracing::{debug, debug_span, trace, warn};

use crate::command::{Command, Response, ResponseType};
use crate::config::{AutoCmd, TransferMode};
use crate::data::{DataDescriptor, Direction, DmaLimits, Termination, Transfer};
use crate::error::{Error, Result};
use crate::host::{Host, HostState, RequestPhase};
use crate::irq::{CompletionEvent, EventKind, HostEvent};
use crate::regs::{IrqStatus, PresentState, Regs, TransferModeFlags};

/// Transfer-mode register value plus the auto-CMD23 argument, if any
struct DataSetup {
    flags: TransferModeFlags,
    argument2: Option<u32>,
    manual_stop: bool,
}

/// Maps the error bits of an interrupt batch to a driver error
pub(crate) fn status_error(event: &CompletionEvent) -> Option<Error> {
    let s = event.status;
    if !s.has_error() {
        return None;
    }
    let err = if s.contains(IrqStatus::COMMAND_TIMEOUT) {
        Error::CommandTimeout
    } else if s.contains(IrqStatus::COMMAND_CRC) {
        Error::CommandCrc
    } else if s.contains(IrqStatus::COMMAND_END_BIT) {
        Error::CommandEndBit
    } else if s.contains(IrqStatus::COMMAND_INDEX) {
        Error::CommandIndex
    } else if s.contains(IrqStatus::ADMA) {
        Error::AdmaDescriptorError {
            state: event.adma_error & adma_error::STATE_MASK,
            length_mismatch: event.adma_error & adma_error::LENGTH_MISMATCH != 0,
        }
    } else if s.contains(IrqStatus::AUTO_CMD) {
        Error::AutoCmd12Failure {
            status: event.auto_cmd_status,
        }
    } else if s.contains(IrqStatus::TUNING) {
        Error::TuningFailure
    } else if s.contains(IrqStatus::DATA_TIMEOUT) {
        Error::DataTimeout
    } else if s.contains(IrqStatus::DATA_CRC) {
        Error::DataCrc
    } else if s.contains(IrqStatus::DATA_END_BIT) {
        Error::DataEndBit
    } else {
        Error::CurrentLimit
    };
    Some(err)
}

impl Host {
    /// Runs one command (plus data phase) with the retry policy applied.
    /// The caller holds the slot lock for the whole request.
    pub(crate) fn do_request(
        &self,
        st: &mut HostState,
        cmd: &Command,
        mut data: Option<&mut DataDescriptor<'_>>,
    ) -> Result<Response> {
        if !self.bridge.card_present() {
            return Err(Error::CardNotPresent);
        }
        cmd.check_direction(data.as_deref().map(|d| d.direction()))?;
        if !st.retune.in_progress {
            self.maybe_retune(st)?;
        }

        let span = debug_span!("request", cmd = cmd.opcode, arg = cmd.argument);
        let _enter = span.enter();
        let attempts = cmd.retries.unwrap_or(self.config.command_retries) + 1;
        let mut attempt = 1;
        loop {
            let result = self.execute(st, cmd, data.as_deref_mut());
            match result {
                Ok(response) => {
                    self.bridge.publish(HostEvent::CommandComplete {
                        controller: self.controller(),
                        slot: self.slot(),
                        opcode: cmd.opcode,
                        response: response.words,
                    });
                    if let Some(desc) = data.as_deref() {
                        self.bridge.publish(HostEvent::DataComplete {
                            controller: self.controller(),
                            slot: self.slot(),
                            bytes: desc.buffer.len(),
                        });
                    }
                    return Ok(response);
                }
                Err(err) => {
                    self.recover(st, cmd, data.as_deref(), &err);
                    if err == Error::CardInvalid {
                        st.card = None;
                    }
                    if err.is_transient() && attempt < attempts {
                        warn!(attempt, error = %err, "transient error, retrying");
                        attempt += 1;
                        continue;
                    }
                    debug!(error = %err, "request failed");
                    return Err(err);
                }
            }
        }
    }

    /// CMD55 followed by the application command, retried as a pair
    pub(crate) fn app_request(
        &self,
        st: &mut HostState,
        cmd: &Command,
        mut data: Option<&mut DataDescriptor<'_>>,
    ) -> Result<Response> {
        let rca_arg = st.card.as_ref().map_or(0, |c| c.rca_arg());
        let attempts = cmd.retries.unwrap_or(self.config.command_retries) + 1;
        let single = cmd.clone().with_retries(0);
        let mut attempt = 1;
        loop {
            let app = Command::new(opcode::APP_CMD, rca_arg, ResponseType::R1).with_retries(0);
            let result = match self.do_request(st, &app, None) {
                Ok(_) => self.do_request(st, &single, data.as_deref_mut()),
                Err(e) => Err(e),
            };
            match result {
                Err(err) if err.is_transient() && attempt < attempts => attempt += 1,
                other => return other,
            }
        }
    }

    /// One attempt: no retry, no recovery
    pub(crate) fn execute(
        &self,
        st: &mut HostState,
        cmd: &Command,
        mut data: Option<&mut DataDescriptor<'_>>,
    ) -> Result<Response> {
        cmd.check_direction(data.as_deref().map(|d| d.direction()))?;
        let regs = self.regs();
        st.drain_events();
        self.bridge.buffer_event_taken();

        let mut xfer = match data.as_deref_mut() {
            Some(desc) => Some(Transfer::prepare(
                &regs,
                &self.dma,
                &self.caps,
                desc,
                st.bus.transfer_mode,
                DmaLimits {
                    sdma_boundary: self.config.sdma_boundary,
                    adma_max_segment: self.config.adma_max_segment,
                },
            )?),
            None => None,
        };
        let setup = match (&xfer, data.as_deref()) {
            (Some(x), Some(desc)) => Some(self.data_setup(st, x, desc)),
            _ => None,
        };
        let manual_stop = setup.as_ref().is_some_and(|s| s.manual_stop);

        self.issue(&regs, cmd, setup.as_ref())?;
        st.phase = RequestPhase::CommandIssued;

        let busy = cmd.response.busy();
        let mut response: Option<Response> = None;
        let mut data_done = xfer.is_none() && !busy;
        let mut stop_sent = false;
        let mut deadline = Instant::now() + self.config.command_timeout;

        while response.is_none() || !data_done {
            let event = self.wait_event(st, deadline, response.is_some())?;
            if event.kind == EventKind::CardRemoved {
                return Err(Error::CardInvalid);
            }
            if let Some(err) = status_error(&event) {
                return Err(err);
            }
            let status = event.status;

            if status.contains(IrqStatus::COMMAND_COMPLETE) {
                if response.is_none() {
                    let decoded = Response::decode(cmd.response, regs.response());
                    if !cmd.raw_status {
                        decoded.check(cmd.opcode)?;
                    }
                    response = Some(decoded);
                    if !data_done {
                        st.phase = RequestPhase::DataInFlight;
                        let window = match (&xfer, cmd.timeout) {
                            (_, Some(t)) => t,
                            (Some(_), None) => self.config.data_timeout,
                            (None, None) => self.config.busy_timeout,
                        };
                        deadline = Instant::now() + window;
                    }
                } else if stop_sent {
                    trace!("stop acknowledged");
                }
            }

            if let (Some(x), Some(desc)) = (xfer.as_mut(), data.as_deref_mut()) {
                if status.intersects(IrqStatus::BUFFER_READ_READY | IrqStatus::BUFFER_WRITE_READY) {
                    x.service_pio(&regs, desc);
                    if x.is_tuning() && x.pio_complete() {
                        data_done = true;
                    }
                    if let Some(stop) = x.open_ended_stop() {
                        if !stop_sent && x.blocks_done >= stop {
                            debug!(blocks = x.blocks_done, "stopping open-ended transfer");
                            self.issue(&regs, &Command::stop_transmission(), None)?;
                            stop_sent = true;
                            st.phase = RequestPhase::Stopping;
                        }
                    }
                }
                if status.contains(IrqStatus::DMA_INTERRUPT) {
                    x.sdma_continue(&regs);
                }
            }
            if status.contains(IrqStatus::TRANSFER_COMPLETE) {
                data_done = true;
            }
        }

        let response = response.ok_or(Error::Controller("request ended without a response"))?;
        if let (Some(x), Some(desc)) = (xfer.take(), data.as_deref()) {
            trace!(bytes = x.bytes_moved(desc.buffer.len()), mode = ?x.mode, "data phase done");
        }
        st.phase = RequestPhase::Idle;

        if manual_stop {
            self.execute(st, &Command::stop_transmission(), None)?;
        }
        Ok(response)
    }

    fn data_setup(&self, st: &HostState, xfer: &Transfer, desc: &DataDescriptor<'_>) -> DataSetup {
        let mut flags = TransferModeFlags::empty();
        let mut argument2 = None;
        let mut manual_stop = false;
        if xfer.mode != TransferMode::Pio {
            flags |= TransferModeFlags::DMA_ENABLE;
        }
        if desc.direction() == Direction::Read {
            flags |= TransferModeFlags::READ;
        }
        match desc.termination {
            Termination::OpenEnded { .. } => flags |= TransferModeFlags::MULTI_BLOCK,
            Termination::BlockCount => {
                flags |= TransferModeFlags::BLOCK_COUNT_ENABLE;
                if desc.blocks > 1 {
                    flags |= TransferModeFlags::MULTI_BLOCK;
                }
            }
            Termination::AutoStop => {
                flags |= TransferModeFlags::BLOCK_COUNT_ENABLE;
                if desc.blocks > 1 {
                    flags |= TransferModeFlags::MULTI_BLOCK;
                    let cmd23 = self.card_supports_cmd23(st) && xfer.mode != TransferMode::Sdma;
                    match st.bus.auto_cmd {
                        AutoCmd::Cmd23 if cmd23 => {
                            flags |= TransferModeFlags::AUTO_CMD23;
                            argument2 = Some(desc.blocks);
                        }
                        AutoCmd::Cmd23 | AutoCmd::Cmd12 => flags |= TransferModeFlags::AUTO_CMD12,
                        AutoCmd::Disabled => manual_stop = true,
                    }
                }
            }
        }
        DataSetup {
            flags,
            argument2,
            manual_stop,
        }
    }

    pub(crate) fn card_supports_cmd23(&self, st: &HostState) -> bool {
        match &st.card {
            Some(card) if card.card_type.is_mmc() => true,
            Some(card) => card.scr.is_some_and(|scr| scr.supports_cmd23()),
            None => false,
        }
    }

    /// Waits for the lines to free up and writes argument, mode and command
    fn issue(&self, regs: &Regs<'_>, cmd: &Command, setup: Option<&DataSetup>) -> Result<()> {
        let mut mask = PresentState::CMD_INHIBIT;
        if !cmd.abort && (setup.is_some() || cmd.response.busy()) {
            mask |= PresentState::DATA_INHIBIT;
        }
        let deadline = Instant::now() + self.config.command_timeout;
        loop {
            let present = regs.present_state();
            if !present.intersects(mask) {
                break;
            }
            if Instant::now() >= deadline {
                return Err(if present.contains(PresentState::CMD_INHIBIT) {
                    Error::CommandTimeout
                } else {
                    Error::CardBusy
                });
            }
            thread::yield_now();
        }

        if let Some(setup) = setup {
            if let Some(arg2) = setup.argument2 {
                regs.set_argument2(arg2);
            }
            regs.set_argument(cmd.argument);
            regs.set_transfer_mode(setup.flags);
        } else {
            regs.set_argument(cmd.argument);
        }
        trace!(cmd = cmd.opcode, arg = format_args!("0x{:08X}", cmd.argument), "issue");
        regs.set_command(cmd.register_word(setup.is_some()));
        Ok(())
    }

    fn wait_event(&self, st: &mut HostState, deadline: Instant, responded: bool) -> Result<CompletionEvent> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match st.events.recv_timeout(timeout) {
            Ok(event) => {
                if event.status.intersects(IrqStatus::BUFFER) {
                    self.bridge.buffer_event_taken();
                }
                Ok(event)
            }
            Err(RecvTimeoutError::Timeout) => {
                if !self.bridge.card_present() {
                    Err(Error::CardInvalid)
                } else if responded {
                    Err(Error::DataTimeout)
                } else {
                    Err(Error::CommandTimeout)
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::Controller("completion channel closed")),
        }
    }

    /// Sends a single command on behalf of an external caller
    pub fn send_command(&self, cmd: &Command) -> Result<Response> {
        let mut st = self.lock();
        self.do_request(&mut st, cmd, None)
    }

    /// Sends a command with a data phase on behalf of an external caller
    pub fn send_command_with_data(&self, cmd: &Command, data: &mut DataDescriptor<'_>) -> Result<Response> {
        let mut st = self.lock();
        self.do_request(&mut st, cmd, Some(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(status: IrqStatus) -> CompletionEvent {
        CompletionEvent {
            kind: EventKind::Command,
            status,
            auto_cmd_status: 0x2,
            adma_error: 0x5,
        }
    }

    #[test]
    fn command_errors_take_precedence() {
        let e = event(IrqStatus::COMMAND_TIMEOUT | IrqStatus::DATA_CRC | IrqStatus::ERROR);
        assert_eq!(status_error(&e), Some(Error::CommandTimeout));
    }

    #[test]
    fn adma_and_auto_cmd_carry_captured_status() {
        let e = event(IrqStatus::ADMA);
        assert_eq!(
            status_error(&e),
            Some(Error::AdmaDescriptorError {
                state: 1,
                length_mismatch: true
            })
        );
        let e = event(IrqStatus::AUTO_CMD);
        assert_eq!(status_error(&e), Some(Error::AutoCmd12Failure { status: 2 }));
    }

    #[test]
    fn clean_status_is_not_an_error() {
        let e = event(IrqStatus::COMMAND_COMPLETE | IrqStatus::TRANSFER_COMPLETE);
        assert_eq!(status_error(&e), None);
    }
}
