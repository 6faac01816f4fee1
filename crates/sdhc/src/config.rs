use std::time::Duration;

/// How the data phase of a request moves bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// CPU copies through the buffer data port
    Pio,
    /// Single-address DMA that pauses at every buffer boundary
    Sdma,
    /// Descriptor-chained scatter/gather DMA
    Adma2,
}

/// Which command the controller issues around multi-block transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoCmd {
    /// Driver sends CMD12 itself after the data phase
    Disabled,
    Cmd12,
    /// CMD23 ahead of the data command, falls back to CMD12 on cards without it
    Cmd23,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusWidth {
    One,
    Four,
    Eight,
}

impl BusWidth {
    pub fn lines(self) -> u8 {
        match self {
            BusWidth::One => 1,
            BusWidth::Four => 4,
            BusWidth::Eight => 8,
        }
    }
}

/// Per-slot driver configuration
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Preferred data transfer mode; downgraded when the controller lacks it
    pub transfer_mode: TransferMode,

    pub auto_cmd: AutoCmd,

    /// Widest bus the board wiring allows
    pub max_bus_width: BusWidth,

    /// Upper bound on the card clock regardless of what card and host could do
    pub max_clock_hz: Option<u32>,

    /// Attempt UHS-I / HS200 negotiation during initialization
    pub enable_uhs: bool,

    /// Retries after a transient error (so `command_retries + 1` attempts)
    pub command_retries: u32,

    /// Wait for a command response
    pub command_timeout: Duration,

    /// Wait for a data phase to complete
    pub data_timeout: Duration,

    /// Wait for long busy operations (erase, sanitize, sleep, cache flush)
    pub busy_timeout: Duration,

    /// Depth of the interrupt-to-request completion channel
    pub event_queue_depth: usize,

    /// CMD19/CMD21 issued per tuning run before the run is declared failed
    pub tuning_attempts: u32,

    /// Tuning runs before a re-tune demotes the speed mode
    pub retune_attempts: u32,

    /// Polls of CMD1/ACMD41/CMD5 before the card is declared unusable
    pub op_cond_polls: u32,

    /// Delay between operation-condition polls
    pub op_cond_interval: Duration,

    /// CMD13 polls while waiting for a card to leave the programming state
    pub status_poll_limit: u32,

    pub status_poll_interval: Duration,

    /// Wait after switching the signalling voltage before the clock restarts
    pub voltage_switch_settle: Duration,

    /// SDMA pauses at every multiple of this many bytes (power of two, 4 KiB to 512 KiB)
    pub sdma_boundary: usize,

    /// Longest single ADMA2 descriptor
    pub adma_max_segment: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            transfer_mode: TransferMode::Adma2,
            auto_cmd: AutoCmd::Cmd12,
            max_bus_width: BusWidth::Eight,
            max_clock_hz: None,
            enable_uhs: true,
            command_retries: 2,
            command_timeout: Duration::from_millis(500),
            data_timeout: Duration::from_secs(2),
            busy_timeout: Duration::from_secs(10),
            event_queue_depth: 16,
            tuning_attempts: 40,
            retune_attempts: 3,
            op_cond_polls: 1000,
            op_cond_interval: Duration::from_millis(1),
            status_poll_limit: 10_000,
            status_poll_interval: Duration::from_micros(100),
            voltage_switch_settle: Duration::from_millis(5),
            sdma_boundary: 4096,
            adma_max_segment: 65536,
        }
    }
}
