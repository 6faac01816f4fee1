//! Interrupt side of a host slot.
//!
//! The handler reads and acknowledges the interrupt status once, turns it
//! into at most one [`CompletionEvent`] for the request engine and forwards
//! card and completion notifications to an optional listener. It never takes
//! the request lock and never blocks: both channels are bounded and fed with
//! `try_send`, and an overflow is counted rather than waited out.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::OnceLock;

use tracing::trace;

use crate::error::{Error, Result};
use crate::regs::{IrqStatus, Regs};

/// What the interrupt batch was about, from the request engine's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Command,
    Data,
    CardInserted,
    CardRemoved,
}

/// One interrupt batch, as handed to the waiting request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    pub kind: EventKind,
    pub status: IrqStatus,
    /// Auto CMD error status, captured before the acknowledge
    pub auto_cmd_status: u16,
    /// ADMA error status, captured before the acknowledge
    pub adma_error: u8,
}

/// Notifications for an upper layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    CommandComplete {
        controller: usize,
        slot: usize,
        opcode: u8,
        response: [u32; 4],
    },
    DataComplete {
        controller: usize,
        slot: usize,
        bytes: usize,
    },
    CardInserted {
        controller: usize,
        slot: usize,
    },
    CardRemoved {
        controller: usize,
        slot: usize,
    },
    /// SDIO card raised its interrupt line
    CardInterrupt {
        controller: usize,
        slot: usize,
    },
}

pub(crate) struct IrqBridge {
    controller: usize,
    slot: usize,
    completions: SyncSender<CompletionEvent>,
    listener: OnceLock<SyncSender<HostEvent>>,
    card_present: AtomicBool,
    /// Bumped on every removal so stale card records can be detected
    generation: AtomicU64,
    retune_requested: AtomicBool,
    /// A buffer-ready event sits in the completion queue, unread
    buffer_event_queued: AtomicBool,
    dropped: AtomicU32,
}

impl IrqBridge {
    pub(crate) fn new(controller: usize, slot: usize, depth: usize) -> (Self, Receiver<CompletionEvent>) {
        let (tx, rx) = mpsc::sync_channel(depth.max(1));
        let bridge = Self {
            controller,
            slot,
            completions: tx,
            listener: OnceLock::new(),
            card_present: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            retune_requested: AtomicBool::new(false),
            buffer_event_queued: AtomicBool::new(false),
            dropped: AtomicU32::new(0),
        };
        (bridge, rx)
    }

    /// Interrupt service body
    pub(crate) fn handle(&self, regs: &Regs<'_>) {
        let status = regs.int_status();
        if status.is_empty() {
            return;
        }
        let auto_cmd_status = if status.contains(IrqStatus::AUTO_CMD) {
            regs.auto_cmd_status()
        } else {
            0
        };
        let adma_error = if status.contains(IrqStatus::ADMA) {
            regs.adma_error()
        } else {
            0
        };
        regs.clear_int_status(status);
        trace!(status = ?status, "sdhc irq");

        if status.contains(IrqStatus::CARD_REMOVAL) {
            self.card_present.store(false, Ordering::SeqCst);
            self.generation.fetch_add(1, Ordering::SeqCst);
            trace!(controller = self.controller, slot = self.slot, "card removed");
            self.publish(HostEvent::CardRemoved {
                controller: self.controller,
                slot: self.slot,
            });
        }
        if status.contains(IrqStatus::CARD_INSERTION) {
            self.card_present.store(true, Ordering::SeqCst);
            trace!(controller = self.controller, slot = self.slot, "card inserted");
            self.publish(HostEvent::CardInserted {
                controller: self.controller,
                slot: self.slot,
            });
        }
        if status.contains(IrqStatus::RETUNING_EVENT) {
            self.retune_requested.store(true, Ordering::SeqCst);
        }
        if status.contains(IrqStatus::CARD_INTERRUPT) {
            self.publish(HostEvent::CardInterrupt {
                controller: self.controller,
                slot: self.slot,
            });
        }

        let request = status & IrqStatus::REQUEST;
        let kind = if status.contains(IrqStatus::CARD_REMOVAL) {
            EventKind::CardRemoved
        } else if request.is_empty() {
            return;
        } else if request.intersects(IrqStatus::COMMAND_COMPLETE | IrqStatus::COMMAND_ERRORS) {
            EventKind::Command
        } else {
            EventKind::Data
        };

        // The engine drains every ready block per buffer event, so one
        // queued buffer event is enough until the engine picks it up.
        let buffer_bits = request & IrqStatus::BUFFER;
        let mut claimed = false;
        if !buffer_bits.is_empty() {
            let was_queued = self.buffer_event_queued.swap(true, Ordering::SeqCst);
            if was_queued && request == buffer_bits {
                trace!(status = ?request, "buffer event coalesced");
                return;
            }
            claimed = !was_queued;
        }

        let event = CompletionEvent {
            kind,
            status: request,
            auto_cmd_status,
            adma_error,
        };
        match self.completions.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                if claimed {
                    self.buffer_event_queued.store(false, Ordering::SeqCst);
                }
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(status = ?request, "completion queue full, event dropped");
            }
        }
    }

    /// Called by the engine once it has taken a buffer event off the queue
    /// (or discarded the queue), before it services the buffer port
    pub(crate) fn buffer_event_taken(&self) {
        self.buffer_event_queued.store(false, Ordering::SeqCst);
    }

    pub(crate) fn publish(&self, event: HostEvent) {
        if let Some(listener) = self.listener.get() {
            if listener.try_send(event).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn subscribe(&self, depth: usize) -> Result<Receiver<HostEvent>> {
        let (tx, rx) = mpsc::sync_channel(depth.max(1));
        self.listener.set(tx).map_err(|_| Error::ListenerRegistered)?;
        Ok(rx)
    }

    pub(crate) fn controller(&self) -> usize {
        self.controller
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn card_present(&self) -> bool {
        self.card_present.load(Ordering::SeqCst)
    }

    pub(crate) fn set_card_present(&self, present: bool) {
        self.card_present.store(present, Ordering::SeqCst);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn take_retune_request(&self) -> bool {
        self.retune_requested.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn dropped_events(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}
