//! Erase, trim, discard and sanitize.

use std::time::Duration;

use sdhc_hw::card::{erase_arg, ext_csd, opcode};
use tracing::info;

use crate::card::Card;
use crate::command::{Command, ResponseType};
use crate::error::{Error, Result};
use crate::host::{Host, HostState};

/// CMD38 flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseKind {
    /// Whole erase groups; contents become the erased pattern
    Erase,
    /// Write blocks only (eMMC)
    Trim,
    /// Like trim, but contents afterwards are undefined
    Discard,
    SecureErase,
    SecureTrim1,
    SecureTrim2,
}

impl EraseKind {
    pub fn argument(self) -> u32 {
        match self {
            EraseKind::Erase => erase_arg::ERASE,
            EraseKind::Trim => erase_arg::TRIM,
            EraseKind::Discard => erase_arg::DISCARD,
            EraseKind::SecureErase => erase_arg::SECURE_ERASE,
            EraseKind::SecureTrim1 => erase_arg::SECURE_TRIM1,
            EraseKind::SecureTrim2 => erase_arg::SECURE_TRIM2,
        }
    }

    fn supported_by(self, card: &Card) -> bool {
        if card.card_type.is_sd() {
            return matches!(self, EraseKind::Erase | EraseKind::Discard);
        }
        let (sec, rev) = card.ext_csd.as_ref().map_or((0, 0), |e| (e.sec_features(), e.revision()));
        match self {
            EraseKind::Erase => true,
            EraseKind::Trim => sec & ext_csd::SEC_GB_CL_EN != 0,
            EraseKind::Discard => rev >= 6,
            EraseKind::SecureErase => sec & ext_csd::SEC_ER_EN != 0,
            EraseKind::SecureTrim1 | EraseKind::SecureTrim2 => {
                sec & ext_csd::SEC_ER_EN != 0 && sec & ext_csd::SEC_GB_CL_EN != 0
            }
        }
    }
}

/// Busy allowance for erasing `blocks` blocks: the configured floor, or
/// 300 ms times ERASE_TIMEOUT_MULT per erase group when that is longer
fn erase_timeout(card: &Card, blocks: u32, floor: Duration) -> Duration {
    let mult = card
        .ext_csd
        .as_ref()
        .filter(|e| e.erase_group_def())
        .map_or(1, |e| e.byte(ext_csd::ERASE_TIMEOUT_MULT).max(1) as u32);
    let groups = blocks.div_ceil(card.erase_group_blocks().max(1));
    floor.max(Duration::from_millis(300) * mult * groups)
}

impl Host {
    /// Erases blocks `start..end`. Plain erase works on whole erase groups;
    /// the card widens the range to the groups it touches.
    pub fn erase(&self, start: u32, end: u32, kind: EraseKind) -> Result<()> {
        let mut st = self.lock();
        self.erase_locked(&mut st, start, end, kind)
    }

    pub(crate) fn erase_locked(&self, st: &mut HostState, start: u32, end: u32, kind: EraseKind) -> Result<()> {
        self.require_memory(st)?;
        if start >= end {
            return Err(Error::InvalidRequest("empty erase range"));
        }
        let card = self.card(st)?;
        if end as u64 > card.capacity_blocks() {
            return Err(Error::InvalidRequest("erase range runs past the end of the card"));
        }
        if !kind.supported_by(card) {
            return Err(Error::UnsupportedMode("card does not support this erase type"));
        }
        let (start_op, end_op) = if card.card_type.is_sd() {
            (opcode::ERASE_WR_BLK_START, opcode::ERASE_WR_BLK_END)
        } else {
            (opcode::ERASE_GROUP_START, opcode::ERASE_GROUP_END)
        };
        let first = card.data_arg(start).ok_or(Error::InvalidRequest("block address overflow"))?;
        let last = card.data_arg(end - 1).ok_or(Error::InvalidRequest("block address overflow"))?;
        let timeout = erase_timeout(card, end - start, self.config.busy_timeout);

        self.do_request(st, &Command::new(start_op, first, ResponseType::R1), None)?;
        self.do_request(st, &Command::new(end_op, last, ResponseType::R1), None)?;
        self.do_request(
            st,
            &Command::new(opcode::ERASE, kind.argument(), ResponseType::R1b)
                .with_timeout(timeout)
                .with_retries(0),
            None,
        )?;
        self.wait_ready_locked(st, timeout)?;
        info!(start, end, ?kind, "erase complete");
        Ok(())
    }

    /// Starts a sanitize and waits for it to finish
    pub fn sanitize(&self) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_mmc(st)?;
        let sec = self.card(st)?.ext_csd.as_ref().map_or(0, |e| e.sec_features());
        if sec & ext_csd::SEC_SANITIZE == 0 {
            return Err(Error::UnsupportedMode("card does not support sanitize"));
        }
        self.mmc_switch(st, ext_csd::SANITIZE_START, 1)?;
        info!("sanitize complete");
        Ok(())
    }

    /// Pattern erased blocks read back as
    pub fn erased_byte(&self) -> Result<u8> {
        let mut st = self.lock();
        Ok(self.card(&mut st)?.erased_byte())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{CardType, ExtCsd};

    fn emmc(sec: u8, rev: u8) -> Card {
        let mut raw = vec![0u8; 512];
        raw[ext_csd::SEC_FEATURE_SUPPORT] = sec;
        raw[ext_csd::EXT_CSD_REV] = rev;
        raw[ext_csd::ERASE_GROUP_DEF] = 1;
        raw[ext_csd::HC_ERASE_GRP_SIZE] = 1;
        raw[ext_csd::ERASE_TIMEOUT_MULT] = 2;
        let mut card = Card::new(CardType::EmmcHc, 0);
        card.ext_csd = Some(ExtCsd::new(raw));
        card
    }

    #[test]
    fn erase_types_follow_feature_bits() {
        let card = emmc(ext_csd::SEC_GB_CL_EN, 5);
        assert!(EraseKind::Trim.supported_by(&card));
        assert!(!EraseKind::Discard.supported_by(&card));
        assert!(!EraseKind::SecureErase.supported_by(&card));

        let sd = Card::new(CardType::Sdhc, 0);
        assert!(EraseKind::Erase.supported_by(&sd));
        assert!(!EraseKind::Trim.supported_by(&sd));
    }

    #[test]
    fn timeout_scales_with_groups() {
        let card = emmc(0, 6);
        // 1024-block groups, 600 ms each
        let t = erase_timeout(&card, 4096, Duration::from_millis(100));
        assert_eq!(t, Duration::from_millis(2400));
        assert_eq!(erase_timeout(&card, 4, Duration::from_secs(10)), Duration::from_secs(10));
    }
}
