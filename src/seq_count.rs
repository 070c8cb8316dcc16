//! Transaction sequence number generation.
use crate::pdu::{PduError, UnsignedByteField};

/// Provides the transaction sequence numbers of an entity. Implementations wrap around at the
/// maximum value of their width.
pub trait SequenceCountProvider {
    /// Width of the generated sequence numbers in bytes.
    fn width(&self) -> usize;

    fn get(&self) -> UnsignedByteField;

    fn increment(&mut self);

    fn get_and_increment(&mut self) -> UnsignedByteField {
        let val = self.get();
        self.increment();
        val
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SeqCountProviderSimple {
    width: usize,
    seq_count: u64,
}

impl SeqCountProviderSimple {
    pub fn new(width: usize) -> Result<Self, PduError> {
        UnsignedByteField::new(width, 0)?;
        Ok(Self {
            width,
            seq_count: 0,
        })
    }

    fn max_value(&self) -> u64 {
        if self.width >= 8 {
            return u64::MAX;
        }
        (1 << (self.width * 8)) - 1
    }
}

impl Default for SeqCountProviderSimple {
    fn default() -> Self {
        Self {
            width: 2,
            seq_count: 0,
        }
    }
}

impl SequenceCountProvider for SeqCountProviderSimple {
    fn width(&self) -> usize {
        self.width
    }

    fn get(&self) -> UnsignedByteField {
        // The counter never exceeds the maximum value of the width.
        UnsignedByteField::new(self.width, self.seq_count)
            .unwrap_or_else(|_| UnsignedByteField::new_u64(self.seq_count))
    }

    fn increment(&mut self) {
        if self.seq_count >= self.max_value() {
            self.seq_count = 0;
            return;
        }
        self.seq_count += 1;
    }
}
