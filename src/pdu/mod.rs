//! # CFDP Protocol Data Unit (PDU) codec
//!
//! Bit-exact encoding and decoding of all CFDP PDUs as specified in chapter 5 of
//! CCSDS 727.0-B-5. A PDU is modelled as a [PduHeader] plus a typed [PduBody], wrapped by the
//! [Pdu] structure which is also the primary entry point of this module:
//!
//! - [Pdu::write_to_bytes] and [Pdu::to_vec] serialize a PDU. The PDU data field length of
//!   the header is always derived from the body, so it can not disagree with it.
//! - [Pdu::from_bytes] deserializes a PDU. The passed buffer must contain exactly one PDU:
//!   a declared data field length which does not match the buffer length is rejected.
//!
//! Decoding never panics. All structural errors are reported as a [PduError].
use crc::{Crc, CRC_16_IBM_3740};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

mod body;
mod header;

pub use body::*;
pub use header::*;

use crate::TransactionId;

/// Only version 2 of the CFDP protocol (binary value 0b001) is supported.
pub const CFDP_VERSION_2: u8 = 0b001;

/// The fixed part of the PDU header before the variable length entity ID and sequence
/// number fields.
pub const FIXED_HEADER_LEN: usize = 4;

/// CRC-16/CCITT-FALSE which is used for the optional PDU CRC, see 4.1.3 of the standard.
pub const CRC_CCITT_FALSE: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Type of the fault location TLV used by EOF and Finished PDUs.
pub const TLV_TYPE_ENTITY_ID: u8 = 0x06;

#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PduType {
    FileDirective = 0,
    FileData = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Direction {
    TowardsReceiver = 0,
    TowardsSender = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransmissionMode {
    Acknowledged = 0,
    Unacknowledged = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CrcFlag {
    NoCrc = 0,
    WithCrc = 1,
}

impl From<bool> for CrcFlag {
    fn from(value: bool) -> Self {
        if value {
            return CrcFlag::WithCrc;
        }
        CrcFlag::NoCrc
    }
}

/// Always 0 and ignored for file directive PDUs (CCSDS 727.0-B-5 P.75)
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SegmentMetadataFlag {
    NotPresent = 0,
    Present = 1,
}

/// Always 0 and ignored for file directive PDUs (CCSDS 727.0-B-5 P.75)
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SegmentationControl {
    NoRecordBoundaryPreservation = 0,
    WithRecordBoundaryPreservation = 1,
}

/// Determines the width of all file size sensitive fields (FSS). Large files use 8 byte
/// fields, normal files 4 byte fields.
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum LargeFileFlag {
    Normal = 0,
    Large = 1,
}

impl LargeFileFlag {
    #[inline]
    pub const fn fss_len(&self) -> usize {
        match self {
            LargeFileFlag::Normal => 4,
            LargeFileFlag::Large => 8,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FileDirectiveType {
    EofPdu = 0x04,
    FinishedPdu = 0x05,
    AckPdu = 0x06,
    MetadataPdu = 0x07,
    NakPdu = 0x08,
    PromptPdu = 0x09,
    KeepAlivePdu = 0x0c,
}

/// Standard condition codes, see table 5-5 of the standard.
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ConditionCode {
    NoError = 0b0000,
    PositiveAckLimitReached = 0b0001,
    KeepAliveLimitReached = 0b0010,
    InvalidTransmissionMode = 0b0011,
    FilestoreRejection = 0b0100,
    FileChecksumFailure = 0b0101,
    FileSizeError = 0b0110,
    NakLimitReached = 0b0111,
    InactivityDetected = 0b1000,
    InvalidFileStructure = 0b1001,
    CheckLimitReached = 0b1010,
    UnsupportedChecksumType = 0b1011,
    SuspendRequestReceived = 0b1110,
    CancelRequestReceived = 0b1111,
}

/// Fault handler codes according to the CFDP standard, see table 8-2.
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FaultHandlerCode {
    NoticeOfCancellation = 0b0001,
    NoticeOfSuspension = 0b0010,
    IgnoreError = 0b0011,
    AbandonTransaction = 0b0100,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DeliveryCode {
    Complete = 0,
    Incomplete = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FileStatus {
    DiscardDeliberately = 0b00,
    DiscardedFsRejection = 0b01,
    Retained = 0b10,
    Unreported = 0b11,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransactionStatus {
    /// Transaction is not currently active and the CFDP implementation does not retain a
    /// transaction history.
    Undefined = 0b00,
    Active = 0b01,
    /// Transaction was active in the past and was terminated.
    Terminated = 0b10,
    /// The CFDP implementation does retain a tranaction history, and the transaction is not and
    /// never was active at this entity.
    Unrecognized = 0b11,
}

/// Checksum types according to the
/// [SANA Checksum Types registry](https://sanaregistry.org/r/checksum_identifiers/)
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ChecksumType {
    /// Modular legacy checksum
    Modular = 0,
    Crc32Proximity1 = 1,
    Crc32C = 2,
    /// Polynomial: 0x4C11DB7. Preferred checksum for now.
    Crc32 = 3,
    NullChecksum = 15,
}

impl Default for ChecksumType {
    fn default() -> Self {
        Self::NullChecksum
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RecordContinuationState {
    NoStartNoEnd = 0b00,
    StartWithoutEnd = 0b01,
    EndWithoutStart = 0b10,
    StartAndEnd = 0b11,
}

/// Response requested by a Prompt PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PromptResponse {
    Nak = 0,
    KeepAlive = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum PduError {
    #[error("source slice too small: found {found}, expected at least {expected}")]
    FromSliceTooSmall { found: usize, expected: usize },
    #[error("target slice too small: found {found}, expected at least {expected}")]
    ToSliceTooSmall { found: usize, expected: usize },
    #[error("declared PDU length {declared} does not match the buffer length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("unsupported CFDP version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid field width {0}, only 1, 2, 4 or 8 bytes are allowed")]
    InvalidFieldWidth(usize),
    #[error("value {value} does not fit into a field of {width} bytes")]
    ValueTooLargeForWidth { value: u64, width: usize },
    #[error("source entity ID width {src} and destination entity ID width {dest} differ")]
    EntityIdWidthMismatch { src: usize, dest: usize },
    #[error("invalid directive type {0:#04x}")]
    InvalidDirectiveType(u8),
    #[error("directive type {0:#04x} can not be acknowledged")]
    InvalidAckedDirective(u8),
    #[error("invalid condition code {0}")]
    InvalidConditionCode(u8),
    #[error("invalid checksum type {0}")]
    InvalidChecksumType(u8),
    #[error("PDU CRC mismatch: expected {expected:#06x}, calculated {calculated:#06x}")]
    CrcMismatch { expected: u16, calculated: u16 },
    #[error("file size {0} requires the large file flag")]
    FileSizeTooLarge(u64),
    #[error("PDU data field length {0} exceeds the 16 bit length field")]
    DataFieldTooLarge(usize),
    #[error("string of length {0} does not fit into a LV field")]
    StringTooLong(usize),
    #[error("file name is not valid UTF-8")]
    InvalidFileName,
    #[error("segment metadata of length {0} exceeds the maximum of 63 bytes")]
    SegmentMetadataTooLarge(usize),
    #[error("malformed {0:?} PDU")]
    MalformedBody(FileDirectiveType),
    #[error("malformed file data PDU")]
    MalformedFileData,
}

/// Unsigned integer with a configurable width of 1, 2, 4 or 8 bytes. This is used for the
/// entity ID and transaction sequence number fields of the PDU header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UnsignedByteField {
    width: u8,
    value: u64,
}

impl UnsignedByteField {
    pub fn new(width: usize, value: u64) -> Result<Self, PduError> {
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(PduError::InvalidFieldWidth(width));
        }
        if width < 8 && value >= (1_u64 << (width * 8)) {
            return Err(PduError::ValueTooLargeForWidth { value, width });
        }
        Ok(Self {
            width: width as u8,
            value,
        })
    }

    pub const fn new_u8(value: u8) -> Self {
        Self {
            width: 1,
            value: value as u64,
        }
    }

    pub const fn new_u16(value: u16) -> Self {
        Self {
            width: 2,
            value: value as u64,
        }
    }

    pub const fn new_u32(value: u32) -> Self {
        Self {
            width: 4,
            value: value as u64,
        }
    }

    pub const fn new_u64(value: u64) -> Self {
        Self { width: 8, value }
    }

    #[inline]
    pub const fn value(&self) -> u64 {
        self.value
    }

    #[inline]
    pub const fn size(&self) -> usize {
        self.width as usize
    }

    /// Same value with a different width. Fails if the value does not fit.
    pub fn with_width(&self, width: usize) -> Result<Self, PduError> {
        Self::new(width, self.value)
    }

    pub fn write_to_be_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        let width = self.size();
        if buf.len() < width {
            return Err(PduError::ToSliceTooSmall {
                found: buf.len(),
                expected: width,
            });
        }
        buf[..width].copy_from_slice(&self.value.to_be_bytes()[8 - width..]);
        Ok(width)
    }

    pub fn from_be_bytes(width: usize, buf: &[u8]) -> Result<Self, PduError> {
        if buf.len() < width {
            return Err(PduError::FromSliceTooSmall {
                found: buf.len(),
                expected: width,
            });
        }
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(PduError::InvalidFieldWidth(width));
        }
        let mut raw = [0; 8];
        raw[8 - width..].copy_from_slice(&buf[..width]);
        Ok(Self {
            width: width as u8,
            value: u64::from_be_bytes(raw),
        })
    }
}

impl From<u8> for UnsignedByteField {
    fn from(value: u8) -> Self {
        Self::new_u8(value)
    }
}

impl From<u16> for UnsignedByteField {
    fn from(value: u16) -> Self {
        Self::new_u16(value)
    }
}

impl From<u32> for UnsignedByteField {
    fn from(value: u32) -> Self {
        Self::new_u32(value)
    }
}

impl From<u64> for UnsignedByteField {
    fn from(value: u64) -> Self {
        Self::new_u64(value)
    }
}

/// Write a file size sensitive field with the width determined by the large file flag.
pub(crate) fn write_fss_field(
    file_flag: LargeFileFlag,
    value: u64,
    buf: &mut [u8],
) -> Result<usize, PduError> {
    let len = file_flag.fss_len();
    if buf.len() < len {
        return Err(PduError::ToSliceTooSmall {
            found: buf.len(),
            expected: len,
        });
    }
    match file_flag {
        LargeFileFlag::Normal => {
            if value > u32::MAX as u64 {
                return Err(PduError::FileSizeTooLarge(value));
            }
            buf[..4].copy_from_slice(&(value as u32).to_be_bytes());
        }
        LargeFileFlag::Large => buf[..8].copy_from_slice(&value.to_be_bytes()),
    }
    Ok(len)
}

/// Read a file size sensitive field. Returns [None] if the buffer is too short.
pub(crate) fn read_fss_field(file_flag: LargeFileFlag, buf: &[u8]) -> Option<(u64, usize)> {
    let len = file_flag.fss_len();
    if buf.len() < len {
        return None;
    }
    let value = match file_flag {
        LargeFileFlag::Normal => u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64,
        LargeFileFlag::Large => {
            let mut raw = [0; 8];
            raw.copy_from_slice(&buf[..8]);
            u64::from_be_bytes(raw)
        }
    };
    Some((value, len))
}

/// A complete CFDP PDU consisting of the header and a typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    header: PduHeader,
    body: PduBody,
}

impl Pdu {
    /// Create a new PDU. The PDU type and the segment metadata flag of the header are derived
    /// from the body.
    pub fn new(pdu_conf: CommonPduConfig, body: PduBody) -> Self {
        let seg_metadata_flag = match &body {
            PduBody::FileData(fd) if fd.segment_metadata.is_some() => SegmentMetadataFlag::Present,
            _ => SegmentMetadataFlag::NotPresent,
        };
        Self {
            header: PduHeader::new(
                pdu_conf,
                body.pdu_type(),
                SegmentationControl::NoRecordBoundaryPreservation,
                seg_metadata_flag,
            ),
            body,
        }
    }

    #[inline]
    pub fn header(&self) -> &PduHeader {
        &self.header
    }

    #[inline]
    pub fn body(&self) -> &PduBody {
        &self.body
    }

    #[inline]
    pub fn into_body(self) -> PduBody {
        self.body
    }

    #[inline]
    pub fn pdu_type(&self) -> PduType {
        self.body.pdu_type()
    }

    #[inline]
    pub fn directive_type(&self) -> Option<FileDirectiveType> {
        self.body.directive_type()
    }

    #[inline]
    pub fn transaction_id(&self) -> TransactionId {
        self.header.common_pdu_conf().transaction_id()
    }

    fn crc_len(&self) -> usize {
        match self.header.common_pdu_conf().crc_flag {
            CrcFlag::WithCrc => 2,
            CrcFlag::NoCrc => 0,
        }
    }

    /// Length of the PDU data field, including the optional CRC.
    pub fn datafield_len(&self) -> usize {
        self.body
            .len_written(self.header.common_pdu_conf().file_flag)
            + self.crc_len()
    }

    pub fn len_written(&self) -> usize {
        self.header.header_len() + self.datafield_len()
    }

    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        let datafield_len = self.datafield_len();
        if datafield_len > u16::MAX as usize {
            return Err(PduError::DataFieldTooLarge(datafield_len));
        }
        let full_len = self.header.header_len() + datafield_len;
        if buf.len() < full_len {
            return Err(PduError::ToSliceTooSmall {
                found: buf.len(),
                expected: full_len,
            });
        }
        let mut current_idx = self.header.write_to_bytes(buf, datafield_len as u16)?;
        current_idx += self.body.write_to_bytes(
            &mut buf[current_idx..],
            self.header.common_pdu_conf().file_flag,
        )?;
        if self.header.common_pdu_conf().crc_flag == CrcFlag::WithCrc {
            let crc = CRC_CCITT_FALSE.checksum(&buf[..current_idx]);
            buf[current_idx..current_idx + 2].copy_from_slice(&crc.to_be_bytes());
            current_idx += 2;
        }
        Ok(current_idx)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, PduError> {
        let mut vec = vec![0; self.len_written()];
        self.write_to_bytes(&mut vec)?;
        Ok(vec)
    }

    /// Decode exactly one PDU from the passed buffer.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (header, header_len, datafield_len) = PduHeader::from_bytes(buf)?;
        let declared = header_len + datafield_len;
        if declared != buf.len() {
            return Err(PduError::LengthMismatch {
                declared,
                actual: buf.len(),
            });
        }
        let mut body_end = buf.len();
        if header.common_pdu_conf().crc_flag == CrcFlag::WithCrc {
            if datafield_len < 2 {
                return Err(PduError::FromSliceTooSmall {
                    found: datafield_len,
                    expected: 2,
                });
            }
            body_end -= 2;
            let expected = u16::from_be_bytes([buf[body_end], buf[body_end + 1]]);
            let calculated = CRC_CCITT_FALSE.checksum(&buf[..body_end]);
            if expected != calculated {
                return Err(PduError::CrcMismatch {
                    expected,
                    calculated,
                });
            }
        }
        let body = PduBody::from_bytes(&header, &buf[header_len..body_end])?;
        Ok(Self { header, body })
    }
}
