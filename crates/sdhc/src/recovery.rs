use tracing::{debug, warn};

use crate::command::Command;
use crate::data::DataDescriptor;
use crate::error::Error;
use crate::host::{Host, HostState, RequestPhase};
use crate::regs::ResetFlags;

impl Host {
    /// Puts the controller back into a state where the next request can be
    /// issued after `err` ended the current one.
    ///
    /// Command-line errors reset the CMD state machine, anything that touched
    /// the DAT lines resets the data state machine, and a failed multi-block
    /// transfer is closed with CMD12 so the card returns to the transfer
    /// state. Completions that raced with the failure are discarded.
    pub(crate) fn recover(
        &self,
        st: &mut HostState,
        cmd: &Command,
        data: Option<&DataDescriptor<'_>>,
        err: &Error,
    ) {
        if matches!(
            err,
            Error::InvalidRequest(_)
                | Error::InvalidAddressAlignment { .. }
                | Error::UnsupportedMode(_)
                | Error::Dma(_)
                | Error::CardNotPresent
        ) {
            return;
        }
        st.phase = RequestPhase::Recovering;

        let mut lines = ResetFlags::empty();
        if err.is_command_error() || matches!(err, Error::CardInvalid | Error::CardBusy) {
            lines |= ResetFlags::CMD_LINE;
        }
        if data.is_some() || err.is_data_error() || cmd.response.busy() || *err == Error::CardInvalid {
            lines |= ResetFlags::DATA_LINE;
        }
        if !lines.is_empty() {
            debug!(?lines, error = %err, "resetting controller lines");
            if let Err(e) = self.reset_lines(lines) {
                warn!(error = %e, "line reset failed");
            }
        }

        let multi_block = data.is_some_and(|d| d.is_multi_block());
        if multi_block && self.bridge.card_present() && *err != Error::CardInvalid {
            let stop = Command::stop_transmission().with_retries(0).raw_status();
            if let Err(e) = self.execute(st, &stop, None) {
                debug!(error = %e, "stop after failed transfer");
                if let Err(e) = self.reset_lines(ResetFlags::CMD_LINE | ResetFlags::DATA_LINE) {
                    warn!(error = %e, "line reset failed");
                }
            }
        }

        st.drain_events();
        self.bridge.buffer_event_taken();
        st.phase = RequestPhase::Idle;
    }
}
