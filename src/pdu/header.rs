use super::{
    CrcFlag, Direction, LargeFileFlag, PduError, PduType, SegmentMetadataFlag, SegmentationControl,
    TransmissionMode, UnsignedByteField, CFDP_VERSION_2, FIXED_HEADER_LEN,
};
use crate::TransactionId;

/// Common configuration fields for all PDUs of one transaction.
///
/// The source and destination entity ID share one length indicator in the header, so both
/// IDs must have the same width. [Self::set_source_and_dest_id] checks this.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CommonPduConfig {
    source_id: UnsignedByteField,
    dest_id: UnsignedByteField,
    pub transaction_seq_num: UnsignedByteField,
    pub trans_mode: TransmissionMode,
    pub file_flag: LargeFileFlag,
    pub crc_flag: CrcFlag,
    pub direction: Direction,
}

impl CommonPduConfig {
    pub fn new(
        source_id: UnsignedByteField,
        dest_id: UnsignedByteField,
        transaction_seq_num: UnsignedByteField,
        trans_mode: TransmissionMode,
    ) -> Result<Self, PduError> {
        Self::check_id_widths(&source_id, &dest_id)?;
        Ok(Self {
            source_id,
            dest_id,
            transaction_seq_num,
            trans_mode,
            file_flag: LargeFileFlag::Normal,
            crc_flag: CrcFlag::NoCrc,
            direction: Direction::TowardsReceiver,
        })
    }

    fn check_id_widths(
        source_id: &UnsignedByteField,
        dest_id: &UnsignedByteField,
    ) -> Result<(), PduError> {
        if source_id.size() != dest_id.size() {
            return Err(PduError::EntityIdWidthMismatch {
                src: source_id.size(),
                dest: dest_id.size(),
            });
        }
        Ok(())
    }

    pub fn set_source_and_dest_id(
        &mut self,
        source_id: UnsignedByteField,
        dest_id: UnsignedByteField,
    ) -> Result<(), PduError> {
        Self::check_id_widths(&source_id, &dest_id)?;
        self.source_id = source_id;
        self.dest_id = dest_id;
        Ok(())
    }

    #[inline]
    pub fn source_id(&self) -> UnsignedByteField {
        self.source_id
    }

    #[inline]
    pub fn dest_id(&self) -> UnsignedByteField {
        self.dest_id
    }

    #[inline]
    pub fn transaction_id(&self) -> TransactionId {
        TransactionId::new(self.source_id, self.transaction_seq_num)
    }
}

/// Fixed and variable part of the PDU header, see 5.1 of the standard.
///
/// The PDU data field length is not stored here. It is derived from the body when writing
/// a [super::Pdu] and validated against the buffer length when reading one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PduHeader {
    pdu_conf: CommonPduConfig,
    pdu_type: PduType,
    seg_ctrl: SegmentationControl,
    seg_metadata_flag: SegmentMetadataFlag,
}

impl PduHeader {
    pub fn new(
        pdu_conf: CommonPduConfig,
        pdu_type: PduType,
        seg_ctrl: SegmentationControl,
        seg_metadata_flag: SegmentMetadataFlag,
    ) -> Self {
        Self {
            pdu_conf,
            pdu_type,
            seg_ctrl,
            seg_metadata_flag,
        }
    }

    #[inline]
    pub fn common_pdu_conf(&self) -> &CommonPduConfig {
        &self.pdu_conf
    }

    #[inline]
    pub fn pdu_type(&self) -> PduType {
        self.pdu_type
    }

    #[inline]
    pub fn seg_ctrl(&self) -> SegmentationControl {
        self.seg_ctrl
    }

    #[inline]
    pub fn seg_metadata_flag(&self) -> SegmentMetadataFlag {
        self.seg_metadata_flag
    }

    pub fn header_len(&self) -> usize {
        FIXED_HEADER_LEN
            + self.pdu_conf.source_id.size()
            + self.pdu_conf.transaction_seq_num.size()
            + self.pdu_conf.dest_id.size()
    }

    pub fn write_to_bytes(&self, buf: &mut [u8], datafield_len: u16) -> Result<usize, PduError> {
        if buf.len() < self.header_len() {
            return Err(PduError::ToSliceTooSmall {
                found: buf.len(),
                expected: self.header_len(),
            });
        }
        let conf = &self.pdu_conf;
        buf[0] = (CFDP_VERSION_2 << 5)
            | ((self.pdu_type as u8) << 4)
            | ((conf.direction as u8) << 3)
            | ((conf.trans_mode as u8) << 2)
            | ((conf.crc_flag as u8) << 1)
            | (conf.file_flag as u8);
        buf[1..3].copy_from_slice(&datafield_len.to_be_bytes());
        buf[3] = ((self.seg_ctrl as u8) << 7)
            | (((conf.source_id.size() - 1) as u8) << 4)
            | ((self.seg_metadata_flag as u8) << 3)
            | ((conf.transaction_seq_num.size() - 1) as u8);
        let mut current_idx = FIXED_HEADER_LEN;
        current_idx += conf.source_id.write_to_be_bytes(&mut buf[current_idx..])?;
        current_idx += conf
            .transaction_seq_num
            .write_to_be_bytes(&mut buf[current_idx..])?;
        current_idx += conf.dest_id.write_to_be_bytes(&mut buf[current_idx..])?;
        Ok(current_idx)
    }

    /// Reads the header. Returns the header, the header length and the declared PDU data
    /// field length.
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, usize, usize), PduError> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(PduError::FromSliceTooSmall {
                found: buf.len(),
                expected: FIXED_HEADER_LEN,
            });
        }
        let version = buf[0] >> 5;
        if version != CFDP_VERSION_2 {
            return Err(PduError::UnsupportedVersion(version));
        }
        // Single bit fields, the conversions can not fail.
        let bit = |byte: u8, pos: u8| (byte >> pos) & 0b1;
        let pdu_type = if bit(buf[0], 4) == 0 {
            PduType::FileDirective
        } else {
            PduType::FileData
        };
        let direction = if bit(buf[0], 3) == 0 {
            Direction::TowardsReceiver
        } else {
            Direction::TowardsSender
        };
        let trans_mode = if bit(buf[0], 2) == 0 {
            TransmissionMode::Acknowledged
        } else {
            TransmissionMode::Unacknowledged
        };
        let crc_flag = CrcFlag::from(bit(buf[0], 1) == 1);
        let file_flag = if bit(buf[0], 0) == 0 {
            LargeFileFlag::Normal
        } else {
            LargeFileFlag::Large
        };
        let datafield_len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        let seg_ctrl = if bit(buf[3], 7) == 0 {
            SegmentationControl::NoRecordBoundaryPreservation
        } else {
            SegmentationControl::WithRecordBoundaryPreservation
        };
        let seg_metadata_flag = if bit(buf[3], 3) == 0 {
            SegmentMetadataFlag::NotPresent
        } else {
            SegmentMetadataFlag::Present
        };
        let entity_id_len = (((buf[3] >> 4) & 0b111) + 1) as usize;
        let seq_num_len = ((buf[3] & 0b111) + 1) as usize;
        for width in [entity_id_len, seq_num_len] {
            if !matches!(width, 1 | 2 | 4 | 8) {
                return Err(PduError::InvalidFieldWidth(width));
            }
        }
        let header_len = FIXED_HEADER_LEN + 2 * entity_id_len + seq_num_len;
        if buf.len() < header_len {
            return Err(PduError::FromSliceTooSmall {
                found: buf.len(),
                expected: header_len,
            });
        }
        let mut current_idx = FIXED_HEADER_LEN;
        let source_id = UnsignedByteField::from_be_bytes(entity_id_len, &buf[current_idx..])?;
        current_idx += entity_id_len;
        let transaction_seq_num = UnsignedByteField::from_be_bytes(seq_num_len, &buf[current_idx..])?;
        current_idx += seq_num_len;
        let dest_id = UnsignedByteField::from_be_bytes(entity_id_len, &buf[current_idx..])?;
        current_idx += entity_id_len;
        let pdu_conf = CommonPduConfig {
            source_id,
            dest_id,
            transaction_seq_num,
            trans_mode,
            file_flag,
            crc_flag,
            direction,
        };
        Ok((
            Self {
                pdu_conf,
                pdu_type,
                seg_ctrl,
                seg_metadata_flag,
            },
            current_idx,
            datafield_len,
        ))
    }
}
