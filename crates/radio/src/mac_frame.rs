//! IEEE 802.15.4-2006 MAC frame codec (no security, no IEs).

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use wpan_core::{PanId, BROADCAST_SHORT};

use crate::framing::PhyFrame;
use crate::RadioError;

const FCF_SECURITY: u16 = 1 << 3;
const FCF_FRAME_PENDING: u16 = 1 << 4;
const FCF_ACK_REQUEST: u16 = 1 << 5;
const FCF_PAN_ID_COMPRESSION: u16 = 1 << 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Beacon,
    Data,
    Ack,
    Command,
}

impl FrameType {
    fn bits(self) -> u16 {
        match self {
            FrameType::Beacon => 0,
            FrameType::Data => 1,
            FrameType::Ack => 2,
            FrameType::Command => 3,
        }
    }

    fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            0 => Some(FrameType::Beacon),
            1 => Some(FrameType::Data),
            2 => Some(FrameType::Ack),
            3 => Some(FrameType::Command),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MacAddress {
    None,
    Short(u16),
    Extended(u64),
}

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress::Short(BROADCAST_SHORT);

    fn mode(self) -> u16 {
        match self {
            MacAddress::None => 0,
            MacAddress::Short(_) => 2,
            MacAddress::Extended(_) => 3,
        }
    }

    pub fn len(self) -> usize {
        match self {
            MacAddress::None => 0,
            MacAddress::Short(_) => 2,
            MacAddress::Extended(_) => 8,
        }
    }

    pub fn is_none(self) -> bool {
        matches!(self, MacAddress::None)
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    fn write(self, buf: &mut Vec<u8>) {
        match self {
            MacAddress::None => {}
            MacAddress::Short(a) => buf.extend_from_slice(&a.to_le_bytes()),
            MacAddress::Extended(a) => buf.extend_from_slice(&a.to_le_bytes()),
        }
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacAddress::None => write!(f, "none"),
            MacAddress::Short(a) => write!(f, "{:#06x}", a),
            MacAddress::Extended(a) => write!(f, "{}", hex::encode(a.to_be_bytes())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacFrame {
    pub frame_type: FrameType,
    pub frame_pending: bool,
    pub ack_request: bool,
    pub pan_id_compression: bool,
    pub version: u8,
    pub sequence: u8,
    pub dst_pan: Option<PanId>,
    pub dst: MacAddress,
    pub src_pan: Option<PanId>,
    pub src: MacAddress,
    pub payload: Bytes,
    /// FCS as received by the PHY; zero for frames built locally.
    pub fcs: u32,
}

impl MacFrame {
    /// Intra-PAN data frame.
    pub fn data(
        sequence: u8,
        pan: PanId,
        src: MacAddress,
        dst: MacAddress,
        payload: Bytes,
        ack_request: bool,
    ) -> Self {
        Self {
            frame_type: FrameType::Data,
            frame_pending: false,
            ack_request,
            pan_id_compression: true,
            version: 0,
            sequence,
            dst_pan: Some(pan),
            dst,
            src_pan: None,
            src,
            payload,
            fcs: 0,
        }
    }

    pub fn ack(sequence: u8) -> Self {
        Self {
            frame_type: FrameType::Ack,
            frame_pending: false,
            ack_request: false,
            pan_id_compression: false,
            version: 0,
            sequence,
            dst_pan: None,
            dst: MacAddress::None,
            src_pan: None,
            src: MacAddress::None,
            payload: Bytes::new(),
            fcs: 0,
        }
    }

    /// Source PAN, taking PAN ID compression into account.
    pub fn effective_src_pan(&self) -> Option<PanId> {
        if self.pan_id_compression {
            self.dst_pan
        } else {
            self.src_pan
        }
    }

    fn has_src_pan_field(&self) -> bool {
        !self.src.is_none() && !self.pan_id_compression
    }

    pub fn header_len(&self) -> usize {
        let mut len = 3;
        if !self.dst.is_none() {
            len += 2 + self.dst.len();
        }
        if !self.src.is_none() {
            if self.has_src_pan_field() {
                len += 2;
            }
            len += self.src.len();
        }
        len
    }

    fn frame_control(&self) -> u16 {
        let mut fcf = self.frame_type.bits();
        if self.frame_pending {
            fcf |= FCF_FRAME_PENDING;
        }
        if self.ack_request {
            fcf |= FCF_ACK_REQUEST;
        }
        if self.pan_id_compression {
            fcf |= FCF_PAN_ID_COMPRESSION;
        }
        fcf |= self.dst.mode() << 10;
        fcf |= ((self.version & 0x3) as u16) << 12;
        fcf |= self.src.mode() << 14;
        fcf
    }

    /// MAC header and payload, ready for the PHY to append the FCS.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header_len() + self.payload.len());
        buf.extend_from_slice(&self.frame_control().to_le_bytes());
        buf.push(self.sequence);
        if !self.dst.is_none() {
            let pan = self.dst_pan.unwrap_or(wpan_core::BROADCAST_PAN);
            buf.extend_from_slice(&pan.to_le_bytes());
            self.dst.write(&mut buf);
        }
        if !self.src.is_none() {
            if self.has_src_pan_field() {
                let pan = self.src_pan.or(self.dst_pan).unwrap_or(wpan_core::BROADCAST_PAN);
                buf.extend_from_slice(&pan.to_le_bytes());
            }
            self.src.write(&mut buf);
        }
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(data: Bytes, fcs: u32) -> Result<Self, RadioError> {
        let mut reader = Reader { data: &data, pos: 0 };
        let fcf = reader.u16()?;

        let frame_type =
            FrameType::from_bits(fcf & 0x7).ok_or(RadioError::InvalidFrame("reserved frame type"))?;
        if fcf & FCF_SECURITY != 0 {
            return Err(RadioError::InvalidFrame("security not supported"));
        }
        let pan_id_compression = fcf & FCF_PAN_ID_COMPRESSION != 0;
        let dst_mode = (fcf >> 10) & 0x3;
        let version = ((fcf >> 12) & 0x3) as u8;
        let src_mode = (fcf >> 14) & 0x3;
        let sequence = reader.u8()?;

        let (dst_pan, dst) = match dst_mode {
            0 => (None, MacAddress::None),
            mode => {
                let pan = reader.u16()?;
                (Some(pan), reader.address(mode)?)
            }
        };
        let (src_pan, src) = match src_mode {
            0 => (None, MacAddress::None),
            mode => {
                let pan = if pan_id_compression {
                    if dst_pan.is_none() {
                        return Err(RadioError::InvalidFrame("PAN ID compression without destination"));
                    }
                    None
                } else {
                    Some(reader.u16()?)
                };
                (pan, reader.address(mode)?)
            }
        };

        let header_len = reader.pos;
        Ok(Self {
            frame_type,
            frame_pending: fcf & FCF_FRAME_PENDING != 0,
            ack_request: fcf & FCF_ACK_REQUEST != 0,
            pan_id_compression,
            version,
            sequence,
            dst_pan,
            dst,
            src_pan,
            src,
            payload: data.slice(header_len..),
            fcs,
        })
    }

    pub fn from_phy(frame: &PhyFrame) -> Result<Self, RadioError> {
        Self::decode(frame.payload.clone(), frame.fcs)
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], RadioError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + N)
            .ok_or(RadioError::InvalidFrame("truncated MAC header"))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, RadioError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, RadioError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn address(&mut self, mode: u16) -> Result<MacAddress, RadioError> {
        match mode {
            2 => Ok(MacAddress::Short(u16::from_le_bytes(self.take()?))),
            3 => Ok(MacAddress::Extended(u64::from_le_bytes(self.take()?))),
            _ => Err(RadioError::InvalidFrame("reserved addressing mode")),
        }
    }
}
