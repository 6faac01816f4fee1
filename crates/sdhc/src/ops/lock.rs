//! Password lock and unlock (CMD42).

use sdhc_hw::card::{lock, opcode};
use tracing::{info, warn};

use crate::command::{CardStatus, Command, ResponseType};
use crate::data::DataDescriptor;
use crate::error::{Error, Result};
use crate::host::{Host, HostState};

/// LOCK_UNLOCK operations. Passwords are at most 16 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOp {
    /// Sets `new`, or replaces `old` with `new` when a password exists
    SetPassword { old: Vec<u8>, new: Vec<u8> },
    ClearPassword(Vec<u8>),
    Lock(Vec<u8>),
    Unlock(Vec<u8>),
    /// Erases the whole card and removes the password
    ForceErase,
}

impl LockOp {
    /// CMD42 data block: flags, password length, password bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (flags, password): (u8, Vec<u8>) = match self {
            LockOp::SetPassword { old, new } => {
                if old.len() > lock::MAX_PASSWORD || new.len() > lock::MAX_PASSWORD || new.is_empty() {
                    return Err(Error::InvalidRequest("password must be 1 to 16 bytes"));
                }
                (lock::SET_PWD, [old.as_slice(), new.as_slice()].concat())
            }
            LockOp::ClearPassword(pwd) => (lock::CLR_PWD, checked(pwd)?.to_vec()),
            LockOp::Lock(pwd) => (lock::LOCK_UNLOCK, checked(pwd)?.to_vec()),
            LockOp::Unlock(pwd) => (0, checked(pwd)?.to_vec()),
            LockOp::ForceErase => (lock::ERASE, Vec::new()),
        };
        let mut block = Vec::with_capacity(2 + password.len());
        block.push(flags);
        if flags != lock::ERASE {
            block.push(password.len() as u8);
            block.extend_from_slice(&password);
        }
        Ok(block)
    }
}

fn checked(pwd: &[u8]) -> Result<&[u8]> {
    if pwd.is_empty() || pwd.len() > lock::MAX_PASSWORD {
        return Err(Error::InvalidRequest("password must be 1 to 16 bytes"));
    }
    Ok(pwd)
}

impl Host {
    /// Runs one CMD42 operation and returns whether the card is locked
    /// afterwards
    pub fn lock_unlock(&self, op: &LockOp) -> Result<bool> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_memory(st)?;
        let block = op.encode()?;

        self.set_block_length_locked(st, block.len() as u32)?;
        let result = self.send_lock_block(st, &block, matches!(op, LockOp::ForceErase));
        let restore = self.set_block_length_locked(st, 512);
        let status = self.send_status(st)?;
        let locked = status.contains(CardStatus::CARD_IS_LOCKED);
        self.card(st)?.locked = locked;
        result?;
        restore?;
        if status.contains(CardStatus::LOCK_UNLOCK_FAILED) {
            warn!("lock/unlock rejected by card");
            return Err(Error::CardStatus(CardStatus::LOCK_UNLOCK_FAILED));
        }
        info!(locked, "lock state changed");
        Ok(locked)
    }

    fn send_lock_block(&self, st: &mut HostState, block: &[u8], erase: bool) -> Result<()> {
        let mut desc = DataDescriptor::write(block, block.len()).pio();
        let cmd = Command::new(opcode::LOCK_UNLOCK, 0, ResponseType::R1).with_retries(0);
        self.do_request(st, &cmd, Some(&mut desc))?;
        let timeout = if erase {
            self.config.busy_timeout * 10
        } else {
            self.config.busy_timeout
        };
        self.wait_ready_locked(st, timeout).map(|_| ())
    }

    /// Current lock state, refreshed from the card
    pub fn is_locked(&self) -> Result<bool> {
        let mut st = self.lock();
        let st = &mut *st;
        let locked = self.send_status(st)?.contains(CardStatus::CARD_IS_LOCKED);
        self.card(st)?.locked = locked;
        Ok(locked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_password_concatenates_old_and_new() {
        let op = LockOp::SetPassword {
            old: b"ab".to_vec(),
            new: b"xyz".to_vec(),
        };
        assert_eq!(op.encode().unwrap(), vec![lock::SET_PWD, 5, b'a', b'b', b'x', b'y', b'z']);
    }

    #[test]
    fn force_erase_is_a_single_byte() {
        assert_eq!(LockOp::ForceErase.encode().unwrap(), vec![lock::ERASE]);
    }

    #[test]
    fn oversized_password_rejected() {
        let op = LockOp::Lock(vec![0; 17]);
        assert!(matches!(op.encode(), Err(Error::InvalidRequest(_))));
        assert!(LockOp::Unlock(Vec::new()).encode().is_err());
    }
}
