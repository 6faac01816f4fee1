//! Fault injection for the controller model.

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// No response; the card never sees the command
    CommandTimeout,
    CommandCrc,
    CommandEndBit,
    CommandIndex,
    /// Response arrives, the data phase never starts
    DataTimeout,
    DataCrc,
    DataEndBit,
    /// The automatic CMD12/CMD23 sent by the controller fails
    AutoCmd,
    /// Descriptor fetch error in the ADMA engine
    Adma,
    /// The command is swallowed: no completion and no error interrupt
    Stall,
    /// Tuning runs end without a usable sampling point
    Tuning,
    /// The card never releases DAT[3:0] after CMD11
    VoltageSwitch,
}

impl FaultKind {
    pub(crate) fn stage(self) -> Stage {
        match self {
            FaultKind::CommandTimeout
            | FaultKind::CommandCrc
            | FaultKind::CommandEndBit
            | FaultKind::CommandIndex
            | FaultKind::Stall => Stage::Command,
            FaultKind::DataTimeout | FaultKind::DataCrc | FaultKind::DataEndBit | FaultKind::Adma => Stage::Data,
            FaultKind::AutoCmd => Stage::AutoCmd,
            FaultKind::Tuning => Stage::Tuning,
            FaultKind::VoltageSwitch => Stage::VoltageSwitch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Command,
    Data,
    AutoCmd,
    Tuning,
    VoltageSwitch,
}

/// One armed fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    /// Only commands with this index trigger it; any command when `None`
    pub opcode: Option<u8>,
    /// Triggers left; unlimited when `None`
    pub remaining: Option<u32>,
}

impl Fault {
    pub fn once(kind: FaultKind) -> Self {
        Self::times(kind, 1)
    }

    pub fn times(kind: FaultKind, n: u32) -> Self {
        Self {
            kind,
            opcode: None,
            remaining: Some(n),
        }
    }

    pub fn always(kind: FaultKind) -> Self {
        Self {
            kind,
            opcode: None,
            remaining: None,
        }
    }

    pub fn on(mut self, opcode: u8) -> Self {
        self.opcode = Some(opcode);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    faults: Vec<Fault>,
    fired: u32,
}

impl FaultPlan {
    pub fn push(&mut self, fault: Fault) {
        debug!("Fault armed: {:?}", fault);
        self.faults.push(fault);
    }

    pub fn clear(&mut self) {
        self.faults.clear();
    }

    /// Faults that have triggered so far
    pub fn fired(&self) -> u32 {
        self.fired
    }

    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    /// Consumes one trigger of the first fault armed for `stage` that
    /// matches `opcode`
    pub(crate) fn take(&mut self, stage: Stage, opcode: u8) -> Option<FaultKind> {
        let pos = self
            .faults
            .iter()
            .position(|f| f.kind.stage() == stage && f.opcode.is_none_or(|op| op == opcode))?;
        let fault = &mut self.faults[pos];
        let kind = fault.kind;
        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
            if *n == 0 {
                self.faults.remove(pos);
            }
        }
        self.fired += 1;
        debug!("Fault fired: {:?} on CMD{}", kind, opcode);
        Some(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counted_fault_expires() {
        let mut plan = FaultPlan::default();
        plan.push(Fault::times(FaultKind::CommandCrc, 2).on(17));
        assert_eq!(plan.take(Stage::Command, 18), None);
        assert_eq!(plan.take(Stage::Command, 17), Some(FaultKind::CommandCrc));
        assert_eq!(plan.take(Stage::Data, 17), None);
        assert_eq!(plan.take(Stage::Command, 17), Some(FaultKind::CommandCrc));
        assert_eq!(plan.take(Stage::Command, 17), None);
        assert!(plan.is_empty());
        assert_eq!(plan.fired(), 2);
    }

    #[test]
    fn persistent_fault_stays() {
        let mut plan = FaultPlan::default();
        plan.push(Fault::always(FaultKind::DataTimeout));
        for _ in 0..5 {
            assert_eq!(plan.take(Stage::Data, 24), Some(FaultKind::DataTimeout));
        }
        plan.clear();
        assert_eq!(plan.take(Stage::Data, 24), None);
    }
}
