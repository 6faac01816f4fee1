//! One host controller slot: register window, DMA mapper, interrupt bridge
//! and the request-serialized state behind a mutex.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use sdhc_hw::mmio::sdhc::{clock, host_control2, int_status, power};
use sdhc_hw::specs::voltage;
use tracing::{debug, info, warn};

use crate::card::{Card, SpeedMode};
use crate::config::{AutoCmd, BusWidth, HostConfig, TransferMode};
use crate::dma::DmaMap;
use crate::error::{Error, Result};
use crate::irq::{CompletionEvent, HostEvent, IrqBridge};
use crate::regs::{clock_divider, Capabilities, IrqStatus, PresentState, RegisterBlock, Regs, ResetFlags};

const CLOCK_STABLE_TIMEOUT: Duration = Duration::from_millis(20);

/// Where the slot's current request is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Idle,
    CommandIssued,
    DataInFlight,
    Stopping,
    Recovering,
}

/// Bus configuration as last programmed
#[derive(Debug, Clone)]
pub(crate) struct BusState {
    pub(crate) powered: bool,
    pub(crate) voltage_mv: u32,
    pub(crate) signal_1v8: bool,
    /// Requested card clock; `actual_hz` is what the divider produced
    pub(crate) clock_hz: u32,
    pub(crate) actual_hz: u32,
    pub(crate) width: BusWidth,
    pub(crate) timing: SpeedMode,
    pub(crate) transfer_mode: TransferMode,
    pub(crate) auto_cmd: AutoCmd,
    pub(crate) driver_type: u8,
    pub(crate) current_limit_ma: u32,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RetuneState {
    /// Current timing depends on a tuned sampling point
    pub(crate) active: bool,
    pub(crate) period: Option<Duration>,
    pub(crate) last: Option<Instant>,
    pub(crate) in_progress: bool,
    pub(crate) runs: u32,
}

pub(crate) struct HostState {
    pub(crate) events: Receiver<CompletionEvent>,
    pub(crate) card: Option<Card>,
    pub(crate) bus: BusState,
    pub(crate) retune: RetuneState,
    pub(crate) stop_at_block: Option<u32>,
    pub(crate) phase: RequestPhase,
    /// SDIO function selected through the bus info interface
    pub(crate) function: u8,
}

impl HostState {
    /// Discards completions left over from an earlier, aborted request
    pub(crate) fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => debug!(?event, "discarding stale completion"),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }
}

/// A single SDHC slot and the card behind it
pub struct Host {
    regs: Arc<dyn RegisterBlock>,
    pub(crate) dma: Arc<dyn DmaMap>,
    pub(crate) config: HostConfig,
    pub(crate) caps: Capabilities,
    version: u16,
    pub(crate) bridge: IrqBridge,
    state: Mutex<HostState>,
}

impl Host {
    /// Resets the controller, reads its capabilities and enables interrupts.
    /// The card is not touched until [`Host::init_card`].
    pub fn new(
        controller: usize,
        slot: usize,
        regs: Arc<dyn RegisterBlock>,
        dma: Arc<dyn DmaMap>,
        config: HostConfig,
    ) -> Result<Self> {
        if !config.sdma_boundary.is_power_of_two() || !(4096..=512 * 1024).contains(&config.sdma_boundary) {
            return Err(Error::InvalidRequest("SDMA boundary must be a power of two from 4 KiB to 512 KiB"));
        }
        let (bridge, events) = IrqBridge::new(controller, slot, config.event_queue_depth);
        let r = Regs::new(&*regs);
        reset_and_wait(&r, ResetFlags::ALL)?;

        let caps = r.capabilities();
        let version = r.host_version();
        let transfer_mode = supported_mode(&caps, config.transfer_mode);
        if transfer_mode != config.transfer_mode {
            warn!(
                requested = ?config.transfer_mode,
                using = ?transfer_mode,
                "transfer mode not supported by controller"
            );
        }

        r.set_timeout_control(0x0E);
        let enable = IrqStatus::from_bits_retain(int_status::DEFAULT_ENABLE);
        r.set_int_enable(enable);
        r.set_signal_enable(enable);
        let present = r.present_state().contains(PresentState::CARD_INSERTED);
        bridge.set_card_present(present);

        info!(
            controller,
            slot,
            version = version & 0xFF,
            base_clock_mhz = caps.base_clock_hz() / 1_000_000,
            mode = ?transfer_mode,
            present,
            "SD host ready"
        );

        let state = HostState {
            events,
            card: None,
            bus: BusState {
                powered: false,
                voltage_mv: 0,
                signal_1v8: false,
                clock_hz: 0,
                actual_hz: 0,
                width: BusWidth::One,
                timing: SpeedMode::Legacy,
                transfer_mode,
                auto_cmd: config.auto_cmd,
                driver_type: 0,
                current_limit_ma: 0,
            },
            retune: RetuneState {
                period: caps.retune_period(),
                ..RetuneState::default()
            },
            stop_at_block: None,
            phase: RequestPhase::Idle,
            function: 0,
        };

        Ok(Self {
            regs,
            dma,
            config,
            caps,
            version,
            bridge,
            state: Mutex::new(state),
        })
    }

    /// Interrupt entry for this slot
    pub fn handle_interrupt(&self) {
        self.bridge.handle(&self.regs());
    }

    pub fn controller(&self) -> usize {
        self.bridge.controller()
    }

    pub fn slot(&self) -> usize {
        self.bridge.slot()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn host_version(&self) -> u16 {
        self.version
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn card_present(&self) -> bool {
        self.bridge.card_present()
    }

    /// Interrupt notifications lost to full queues
    pub fn dropped_events(&self) -> u32 {
        self.bridge.dropped_events()
    }

    /// Registers the single listener for [`HostEvent`]s
    pub fn subscribe(&self, depth: usize) -> Result<Receiver<HostEvent>> {
        self.bridge.subscribe(depth)
    }

    pub fn phase(&self) -> RequestPhase {
        self.lock().phase
    }

    pub fn speed_mode(&self) -> SpeedMode {
        self.lock().bus.timing
    }

    pub fn bus_width(&self) -> BusWidth {
        self.lock().bus.width
    }

    pub fn clock_hz(&self) -> u32 {
        self.lock().bus.actual_hz
    }

    /// Number of tuning passes run since the card was initialized
    pub fn tuning_runs(&self) -> u32 {
        self.lock().retune.runs
    }

    /// Makes the next multi-block transfer open-ended, stopped with CMD12
    /// after `blocks` blocks. `None` cancels a pending stop.
    pub fn set_stop_at_block(&self, blocks: Option<u32>) {
        self.lock().stop_at_block = blocks;
    }

    pub(crate) fn regs(&self) -> Regs<'_> {
        Regs::new(&*self.regs)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Card record, if it is still the one enumerated under the current
    /// card-detect generation
    pub(crate) fn card<'s>(&self, st: &'s mut HostState) -> Result<&'s mut Card> {
        if !self.bridge.card_present() {
            if st.card.take().is_some() {
                info!(controller = self.controller(), slot = self.slot(), "card removed");
            }
            return Err(Error::CardNotPresent);
        }
        let generation = self.bridge.generation();
        if st.card.as_ref().is_some_and(|c| c.generation != generation) {
            info!(controller = self.controller(), slot = self.slot(), "card replaced since enumeration");
            st.card = None;
        }
        st.card.as_mut().ok_or(Error::CardNotPresent)
    }

    pub(crate) fn reset_lines(&self, flags: ResetFlags) -> Result<()> {
        reset_and_wait(&self.regs(), flags)
    }

    /// Powers the slot at the highest voltage the controller offers
    pub(crate) fn power_on(&self, st: &mut HostState) -> Result<()> {
        let regs = self.regs();
        let (select, mv) = if self.caps.voltage_3v3() {
            (power::VOLTAGE_3V3, voltage::V3_3_MV)
        } else if self.caps.voltage_3v0() {
            (power::VOLTAGE_3V0, voltage::V3_0_MV)
        } else if self.caps.voltage_1v8() {
            (power::VOLTAGE_1V8, voltage::V1_8_MV)
        } else {
            return Err(Error::UnsupportedMode("controller reports no supported voltage"));
        };
        if st.bus.powered && st.bus.voltage_mv == mv {
            return Ok(());
        }
        regs.set_power_control(select);
        regs.set_power_control(select | power::BUS_POWER_ON);
        thread::sleep(Duration::from_millis(1));
        st.bus.powered = true;
        st.bus.voltage_mv = mv;
        debug!(mv, "bus power on");
        Ok(())
    }

    pub(crate) fn power_off(&self, st: &mut HostState) {
        let regs = self.regs();
        regs.set_clock_control(0);
        regs.set_power_control(0);
        let ctrl2 = regs.host_control2() & !host_control2::SIGNALING_1V8;
        regs.set_host_control2(ctrl2);
        st.bus.powered = false;
        st.bus.voltage_mv = 0;
        st.bus.signal_1v8 = false;
        st.bus.clock_hz = 0;
        st.bus.actual_hz = 0;
        debug!("bus power off");
    }

    /// Selects the supply voltage explicitly (3300, 3000 or 1800 mV)
    pub(crate) fn set_supply_voltage(&self, st: &mut HostState, mv: u32) -> Result<()> {
        let select = match mv {
            3300 if self.caps.voltage_3v3() => power::VOLTAGE_3V3,
            3000 if self.caps.voltage_3v0() => power::VOLTAGE_3V0,
            1800 if self.caps.voltage_1v8() => power::VOLTAGE_1V8,
            _ => return Err(Error::UnsupportedMode("supply voltage not supported by controller")),
        };
        if st.bus.powered && st.bus.voltage_mv == mv {
            return Ok(());
        }
        let regs = self.regs();
        regs.set_power_control(select | power::BUS_POWER_ON);
        st.bus.powered = true;
        st.bus.voltage_mv = mv;
        Ok(())
    }

    /// Programs the card clock. Re-requesting the current clock is a no-op.
    pub(crate) fn set_clock(&self, st: &mut HostState, hz: u32) -> Result<u32> {
        let limit = self.config.max_clock_hz.unwrap_or(u32::MAX);
        let target = hz.min(limit);
        if st.bus.clock_hz == target && st.bus.actual_hz != 0 {
            return Ok(st.bus.actual_hz);
        }
        let regs = self.regs();
        regs.set_clock_control(0);
        if target == 0 {
            st.bus.clock_hz = 0;
            st.bus.actual_hz = 0;
            return Ok(0);
        }

        let (div, actual) = clock_divider(self.caps.base_clock_hz(), target);
        let ctrl = clock::INTERNAL_ENABLE
            | ((div & 0xFF) << clock::DIVIDER_LO_SHIFT)
            | (((div >> 8) << clock::DIVIDER_HI_SHIFT) & clock::DIVIDER_HI_MASK);
        regs.set_clock_control(ctrl);
        let deadline = Instant::now() + CLOCK_STABLE_TIMEOUT;
        while regs.clock_control() & clock::INTERNAL_STABLE == 0 {
            if Instant::now() >= deadline {
                return Err(Error::Controller("internal clock did not stabilize"));
            }
            thread::yield_now();
        }
        regs.set_clock_control(ctrl | clock::SD_CLOCK_ENABLE);
        st.bus.clock_hz = target;
        st.bus.actual_hz = actual;
        debug!(requested = hz, actual, divider = div, "card clock");
        Ok(actual)
    }

    /// Gates the card clock without touching the divider
    pub(crate) fn gate_clock(&self, enable: bool) {
        let regs = self.regs();
        let ctrl = regs.clock_control();
        if enable {
            regs.set_clock_control(ctrl | clock::SD_CLOCK_ENABLE);
        } else {
            regs.set_clock_control(ctrl & !clock::SD_CLOCK_ENABLE);
        }
    }

    pub(crate) fn set_host_bus_width(&self, st: &mut HostState, width: BusWidth) {
        self.regs().set_bus_width(width);
        st.bus.width = width;
    }

    /// Programs the controller's timing for `mode` (high-speed enable and UHS mode select)
    pub(crate) fn set_host_timing(&self, st: &mut HostState, mode: SpeedMode) {
        let regs = self.regs();
        let uhs = match mode {
            SpeedMode::Legacy | SpeedMode::HighSpeed | SpeedMode::Sdr12 => host_control2::UHS_SDR12,
            SpeedMode::Sdr25 => host_control2::UHS_SDR25,
            SpeedMode::Sdr50 => host_control2::UHS_SDR50,
            SpeedMode::Sdr104 | SpeedMode::Hs200 => host_control2::UHS_SDR104,
            SpeedMode::Ddr50 => host_control2::UHS_DDR50,
        };
        regs.set_high_speed(!matches!(mode, SpeedMode::Legacy | SpeedMode::Sdr12));
        regs.set_uhs_mode(uhs);
        st.bus.timing = mode;
        debug!(?mode, "host timing");
    }

    pub(crate) fn set_transfer_mode(&self, st: &mut HostState, mode: TransferMode) -> Result<()> {
        if supported_mode(&self.caps, mode) != mode {
            return Err(Error::UnsupportedMode("transfer mode not supported by controller"));
        }
        st.bus.transfer_mode = mode;
        Ok(())
    }
}

fn supported_mode(caps: &Capabilities, requested: TransferMode) -> TransferMode {
    match requested {
        TransferMode::Adma2 if caps.adma2() => TransferMode::Adma2,
        TransferMode::Adma2 | TransferMode::Sdma if caps.sdma() => TransferMode::Sdma,
        TransferMode::Pio => TransferMode::Pio,
        _ => TransferMode::Pio,
    }
}

fn reset_and_wait(regs: &Regs<'_>, flags: ResetFlags) -> Result<()> {
    regs.set_software_reset(flags);
    let deadline = Instant::now() + Duration::from_millis(100);
    while regs.software_reset().intersects(flags) {
        if Instant::now() >= deadline {
            return Err(Error::Controller("software reset did not complete"));
        }
        thread::yield_now();
    }
    Ok(())
}
