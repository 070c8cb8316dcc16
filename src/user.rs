//! CFDP indications delivered to the user of an entity.
use std::collections::VecDeque;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    pdu::{ChecksumType, ConditionCode, DeliveryCode, FileStatus},
    IndicationConfig, TransactionId,
};

/// Final outcome of a transaction. Exactly one of these is generated for every transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransactionFinishedParams {
    pub id: TransactionId,
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MetadataReceivedParams {
    pub id: TransactionId,
    pub source_id: u64,
    pub file_size: u64,
    pub checksum_type: ChecksumType,
    pub src_file_name: String,
    pub dest_file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Indication {
    TransactionStarted(TransactionId),
    EofSent(TransactionId),
    EofReceived(TransactionId),
    MetadataReceived(MetadataReceivedParams),
    FileSegmentReceived {
        id: TransactionId,
        offset: u64,
        length: u64,
    },
    Suspended {
        id: TransactionId,
        condition_code: ConditionCode,
    },
    Resumed {
        id: TransactionId,
        progress: u64,
    },
    Fault {
        id: TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    },
    Abandoned {
        id: TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    },
    TransactionFinished(TransactionFinishedParams),
}

/// Collects the indications generated by the transactions of one entity.
///
/// Optional indications are filtered by the [IndicationConfig]. Completion indications are
/// always recorded in a separate queue. The general indication queue is bounded by
/// [IndicationConfig::max_pending_indications] and drops its oldest entries once full.
#[derive(Debug, Default)]
pub struct IndicationSink {
    cfg: IndicationConfig,
    indications: VecDeque<Indication>,
    completions: VecDeque<TransactionFinishedParams>,
    discarded: u64,
}

impl IndicationSink {
    pub fn new(cfg: IndicationConfig) -> Self {
        Self {
            cfg,
            indications: VecDeque::new(),
            completions: VecDeque::new(),
            discarded: 0,
        }
    }

    fn enabled(&self, indication: &Indication) -> bool {
        match indication {
            Indication::EofSent(_) => self.cfg.eof_sent,
            Indication::EofReceived(_) => self.cfg.eof_recv,
            Indication::FileSegmentReceived { .. } => self.cfg.file_segment_recv,
            Indication::Suspended { .. } => self.cfg.suspended,
            Indication::Resumed { .. } => self.cfg.resumed,
            Indication::TransactionFinished(_) => self.cfg.transaction_finished,
            Indication::TransactionStarted(_)
            | Indication::MetadataReceived(_)
            | Indication::Fault { .. }
            | Indication::Abandoned { .. } => true,
        }
    }

    pub fn push(&mut self, indication: Indication) {
        if !self.enabled(&indication) {
            return;
        }
        if self.cfg.max_pending_indications == 0 {
            self.discarded += 1;
            return;
        }
        while self.indications.len() >= self.cfg.max_pending_indications {
            if let Some(oldest) = self.indications.pop_front() {
                if self.discarded == 0 {
                    log::warn!(
                        "indication queue full with {} entries, discarding oldest: {oldest:?}",
                        self.cfg.max_pending_indications
                    );
                }
                self.discarded += 1;
            }
        }
        self.indications.push_back(indication);
    }

    /// Record the completion of a transaction.
    pub fn transaction_finished(&mut self, params: TransactionFinishedParams) {
        log::info!(
            "transaction {} finished: {:?}, {:?}, {:?}",
            params.id,
            params.condition_code,
            params.delivery_code,
            params.file_status
        );
        self.completions.push_back(params);
        self.push(Indication::TransactionFinished(params));
    }

    pub fn drain_indications(&mut self) -> impl Iterator<Item = Indication> + '_ {
        if self.discarded > 0 {
            log::warn!("{} indications were discarded before being drained", self.discarded);
            self.discarded = 0;
        }
        self.indications.drain(..)
    }

    pub fn drain_completions(&mut self) -> impl Iterator<Item = TransactionFinishedParams> + '_ {
        self.completions.drain(..)
    }

    pub fn pending_indications(&self) -> usize {
        self.indications.len()
    }

    pub fn pending_completions(&self) -> usize {
        self.completions.len()
    }

    /// Number of indications discarded because the queue was full since it was last drained.
    pub fn discarded_indications(&self) -> u64 {
        self.discarded
    }
}
