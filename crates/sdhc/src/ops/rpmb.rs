//! Replay protected memory block access. Frames travel over the security
//! protocol commands (PROTOCOL_WR/PROTOCOL_RD), each preceded by CMD23.
//! The driver moves frames only; MAC calculation belongs to the caller.

use sdhc_hw::card::{ext_csd, opcode, rpmb};
use sdhc_hw::specs::block::SIZE as BLOCK;
use tracing::{debug, warn};

use crate::command::{Command, ResponseType};
use crate::data::DataDescriptor;
use crate::error::{Error, Result};
use crate::host::{Host, HostState};
use crate::io::{block_count_argument, BlockCountFlags};

/// One 512-byte RPMB data frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpmbFrame {
    pub mac: [u8; rpmb::MAC_SIZE],
    pub data: [u8; rpmb::DATA_SIZE],
    pub nonce: [u8; rpmb::NONCE_SIZE],
    pub write_counter: u32,
    pub address: u16,
    pub block_count: u16,
    pub result: u16,
    pub request: u16,
}

impl Default for RpmbFrame {
    fn default() -> Self {
        Self {
            mac: [0; rpmb::MAC_SIZE],
            data: [0; rpmb::DATA_SIZE],
            nonce: [0; rpmb::NONCE_SIZE],
            write_counter: 0,
            address: 0,
            block_count: 0,
            result: 0,
            request: 0,
        }
    }
}

impl RpmbFrame {
    pub fn request(kind: u16) -> Self {
        Self {
            request: kind,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> [u8; rpmb::FRAME_SIZE] {
        let mut f = [0u8; rpmb::FRAME_SIZE];
        f[rpmb::MAC_OFFSET..rpmb::MAC_OFFSET + rpmb::MAC_SIZE].copy_from_slice(&self.mac);
        f[rpmb::DATA_OFFSET..rpmb::DATA_OFFSET + rpmb::DATA_SIZE].copy_from_slice(&self.data);
        f[rpmb::NONCE_OFFSET..rpmb::NONCE_OFFSET + rpmb::NONCE_SIZE].copy_from_slice(&self.nonce);
        f[rpmb::WRITE_COUNTER_OFFSET..rpmb::WRITE_COUNTER_OFFSET + 4]
            .copy_from_slice(&self.write_counter.to_be_bytes());
        f[rpmb::ADDRESS_OFFSET..rpmb::ADDRESS_OFFSET + 2].copy_from_slice(&self.address.to_be_bytes());
        f[rpmb::BLOCK_COUNT_OFFSET..rpmb::BLOCK_COUNT_OFFSET + 2].copy_from_slice(&self.block_count.to_be_bytes());
        f[rpmb::RESULT_OFFSET..rpmb::RESULT_OFFSET + 2].copy_from_slice(&self.result.to_be_bytes());
        f[rpmb::REQUEST_OFFSET..rpmb::REQUEST_OFFSET + 2].copy_from_slice(&self.request.to_be_bytes());
        f
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() != rpmb::FRAME_SIZE {
            return Err(Error::InvalidRequest("RPMB frames are 512 bytes"));
        }
        let be16 = |at: usize| u16::from_be_bytes([raw[at], raw[at + 1]]);
        let mut frame = Self::default();
        frame.mac.copy_from_slice(&raw[rpmb::MAC_OFFSET..rpmb::MAC_OFFSET + rpmb::MAC_SIZE]);
        frame.data.copy_from_slice(&raw[rpmb::DATA_OFFSET..rpmb::DATA_OFFSET + rpmb::DATA_SIZE]);
        frame.nonce.copy_from_slice(&raw[rpmb::NONCE_OFFSET..rpmb::NONCE_OFFSET + rpmb::NONCE_SIZE]);
        let c = rpmb::WRITE_COUNTER_OFFSET;
        frame.write_counter = u32::from_be_bytes([raw[c], raw[c + 1], raw[c + 2], raw[c + 3]]);
        frame.address = be16(rpmb::ADDRESS_OFFSET);
        frame.block_count = be16(rpmb::BLOCK_COUNT_OFFSET);
        frame.result = be16(rpmb::RESULT_OFFSET);
        frame.request = be16(rpmb::REQUEST_OFFSET);
        Ok(frame)
    }

    /// Result code with the counter-expired flag masked off
    pub fn result_code(&self) -> u16 {
        self.result & rpmb::RESULT_MASK
    }

    pub fn counter_expired(&self) -> bool {
        self.result & rpmb::RESULT_COUNTER_EXPIRED != 0
    }

    fn check(self) -> Result<Self> {
        if self.result_code() != rpmb::RESULT_OK {
            warn!(result = self.result, response = self.request, "RPMB operation failed");
            return Err(Error::Rpmb { result: self.result });
        }
        Ok(self)
    }
}

impl Host {
    /// CMD23 then PROTOCOL_WR with `data` (whole blocks)
    pub fn protocol_write(&self, arg: u32, data: &[u8], reliable: bool) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_mmc(st)?;
        self.protocol_write_locked(st, arg, data, reliable)
    }

    /// CMD23 then PROTOCOL_RD into `buf` (whole blocks)
    pub fn protocol_read(&self, arg: u32, buf: &mut [u8]) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_mmc(st)?;
        self.protocol_read_locked(st, arg, buf)
    }

    fn protocol_write_locked(&self, st: &mut HostState, arg: u32, data: &[u8], reliable: bool) -> Result<()> {
        let blocks = protocol_blocks(data.len())?;
        let flags = if reliable {
            BlockCountFlags::RELIABLE_WRITE
        } else {
            BlockCountFlags::empty()
        };
        self.do_request(
            st,
            &Command::new(opcode::SET_BLOCK_COUNT, block_count_argument(blocks, flags, 0), ResponseType::R1),
            None,
        )?;
        let mut desc = DataDescriptor::write(data, BLOCK);
        self.do_request(
            st,
            &Command::new(opcode::PROTOCOL_WR, arg, ResponseType::R1).with_retries(0),
            Some(&mut desc),
        )?;
        self.wait_ready_locked(st, self.config.busy_timeout)?;
        Ok(())
    }

    fn protocol_read_locked(&self, st: &mut HostState, arg: u32, buf: &mut [u8]) -> Result<()> {
        let blocks = protocol_blocks(buf.len())?;
        self.do_request(
            st,
            &Command::new(
                opcode::SET_BLOCK_COUNT,
                block_count_argument(blocks, BlockCountFlags::empty(), 0),
                ResponseType::R1,
            ),
            None,
        )?;
        let mut desc = DataDescriptor::read(buf, BLOCK);
        self.do_request(
            st,
            &Command::new(opcode::PROTOCOL_RD, arg, ResponseType::R1).with_retries(0),
            Some(&mut desc),
        )?;
        Ok(())
    }

    /// Sends request frames, then reads `responses` frames back
    fn rpmb_exchange(
        &self,
        st: &mut HostState,
        requests: &[RpmbFrame],
        reliable: bool,
        responses: usize,
    ) -> Result<Vec<RpmbFrame>> {
        let card = self.card(st)?;
        if !card.card_type.is_mmc() || card.ext_csd.as_ref().map_or(0, |e| e.byte(ext_csd::RPMB_SIZE_MULT)) == 0 {
            return Err(Error::UnsupportedMode("card has no RPMB partition"));
        }
        let out: Vec<u8> = requests.iter().flat_map(|f| f.encode()).collect();
        self.protocol_write_locked(st, rpmb::PROTOCOL_ARG, &out, reliable)?;
        if responses == 0 {
            return Ok(Vec::new());
        }
        let mut raw = vec![0u8; responses * rpmb::FRAME_SIZE];
        self.protocol_read_locked(st, rpmb::PROTOCOL_ARG, &mut raw)?;
        raw.chunks(rpmb::FRAME_SIZE).map(RpmbFrame::decode).collect()
    }

    /// Result of the last authenticated write or key programming
    fn rpmb_result_locked(&self, st: &mut HostState) -> Result<RpmbFrame> {
        let mut frames = self.rpmb_exchange(st, &[RpmbFrame::request(rpmb::REQ_READ_RESULT)], false, 1)?;
        frames.pop().ok_or(Error::Rpmb { result: rpmb::RESULT_GENERAL_FAILURE })
    }

    pub fn rpmb_result(&self) -> Result<RpmbFrame> {
        let mut st = self.lock();
        self.rpmb_result_locked(&mut st)
    }

    /// Programs the authentication key (once per device)
    pub fn rpmb_program_key(&self, key: &[u8; rpmb::MAC_SIZE]) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        let mut frame = RpmbFrame::request(rpmb::REQ_PROGRAM_KEY);
        frame.mac = *key;
        self.rpmb_exchange(st, &[frame], true, 0)?;
        self.rpmb_result_locked(st)?.check()?;
        debug!("RPMB key programmed");
        Ok(())
    }

    /// Reads the write counter; the response frame carries the card's MAC
    pub fn rpmb_read_counter(&self, nonce: [u8; rpmb::NONCE_SIZE]) -> Result<RpmbFrame> {
        let mut st = self.lock();
        let st = &mut *st;
        let mut frame = RpmbFrame::request(rpmb::REQ_READ_COUNTER);
        frame.nonce = nonce;
        let mut resp = self.rpmb_exchange(st, &[frame], false, 1)?;
        resp.pop().ok_or(Error::Rpmb { result: rpmb::RESULT_GENERAL_FAILURE })?.check()
    }

    /// Authenticated write of pre-built frames (address, counter and MAC
    /// filled in by the caller). Returns the result frame.
    pub fn rpmb_write(&self, frames: &[RpmbFrame]) -> Result<RpmbFrame> {
        if frames.is_empty() || frames.iter().any(|f| f.request != rpmb::REQ_WRITE_DATA) {
            return Err(Error::InvalidRequest("RPMB write needs write-data frames"));
        }
        let mut st = self.lock();
        let st = &mut *st;
        self.rpmb_exchange(st, frames, true, 0)?;
        let result = self.rpmb_result_locked(st)?.check()?;
        debug!(frames = frames.len(), counter = result.write_counter, "RPMB write");
        Ok(result)
    }

    /// Authenticated read of `blocks` half-sector frames starting at `address`
    pub fn rpmb_read(&self, address: u16, blocks: u16, nonce: [u8; rpmb::NONCE_SIZE]) -> Result<Vec<RpmbFrame>> {
        if blocks == 0 {
            return Err(Error::InvalidRequest("RPMB read of zero frames"));
        }
        let mut st = self.lock();
        let st = &mut *st;
        let mut frame = RpmbFrame::request(rpmb::REQ_READ_DATA);
        frame.address = address;
        frame.block_count = blocks;
        frame.nonce = nonce;
        let frames = self.rpmb_exchange(st, &[frame], false, blocks as usize)?;
        for f in &frames {
            if f.result_code() != rpmb::RESULT_OK {
                return Err(Error::Rpmb { result: f.result });
            }
        }
        Ok(frames)
    }
}

fn protocol_blocks(len: usize) -> Result<u16> {
    if len == 0 || len % BLOCK != 0 || len / BLOCK > u16::MAX as usize {
        return Err(Error::InvalidRequest("protocol transfers are whole blocks"));
    }
    Ok((len / BLOCK) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_fields_are_big_endian() {
        let mut frame = RpmbFrame::request(rpmb::REQ_WRITE_DATA);
        frame.write_counter = 0x0102_0304;
        frame.address = 0x0A0B;
        frame.block_count = 2;
        frame.data[0] = 0x5A;
        frame.mac[31] = 0xEE;
        let raw = frame.encode();
        assert_eq!(&raw[500..504], &[1, 2, 3, 4]);
        assert_eq!(&raw[504..506], &[0x0A, 0x0B]);
        assert_eq!(&raw[506..508], &[0, 2]);
        assert_eq!(&raw[510..512], &[0, 3]);
        assert_eq!(raw[228], 0x5A);
        assert_eq!(raw[227], 0xEE);
        assert!(raw[..196].iter().all(|b| *b == 0));
        assert_eq!(RpmbFrame::decode(&raw).unwrap(), frame);
    }

    #[test]
    fn result_code_ignores_expiry_flag() {
        let mut frame = RpmbFrame::request(rpmb::RESP_WRITE_DATA);
        frame.result = rpmb::RESULT_COUNTER_EXPIRED | rpmb::RESULT_OK;
        assert!(frame.counter_expired());
        assert!(frame.clone().check().is_ok());
        frame.result = rpmb::RESULT_AUTH_FAILURE;
        assert_eq!(frame.check(), Err(Error::Rpmb { result: rpmb::RESULT_AUTH_FAILURE }));
    }

    #[test]
    fn short_frames_rejected() {
        assert!(RpmbFrame::decode(&[0u8; 100]).is_err());
        assert!(protocol_blocks(100).is_err());
        assert_eq!(protocol_blocks(1024), Ok(2));
    }
}
