//! This crate contains a CCSDS File Delivery Protocol (CFDP) entity as specified in
//! CCSDS 727.0-B-5.
//!
//! The basic idea of CFDP is to convert files of any size into a stream of packets called packet
//! data units (PDU). CFPD has an unacknowledged (class 1) and acknowledged (class 2) mode, with the
//! option to request a transaction closure for the unacknowledged mode. Using the unacknowledged
//! mode with no transaction closure is applicable for simplex communication paths, while the
//! unacknowledged mode with closure is the easiest way to get a confirmation of a successful file
//! transfer, including a checksum verification on the remote side. The acknowledged mode adds
//! lost segment detection with NAK PDUs and positive acknowledgement of the EOF and Finished
//! PDUs, which makes it usable on lossy links.
//!
//! The central component is the [entity::Entity]. It owns the management information base (MIB)
//! which consists of the [LocalEntityConfig] and the remote entity configurations provided by a
//! [RemoteEntityConfigProvider], and a table of all live transactions. Outgoing transfers are
//! driven by a [source::SourceTransaction], incoming transfers by a
//! [dest::DestinationTransaction].
//!
//! # Scheduling
//!
//! The entity is poll driven and never blocks. The host application is expected to do two
//! things:
//!
//! 1. Call [entity::Entity::tick] periodically with the current monotonic time. All timers are
//!    plain deadlines which are only advanced by this call, so tests can drive the entity
//!    with simulated time. [time::StdClock] is a simple time source for real deployments.
//! 2. Pass all received raw PDUs to [entity::Entity::on_pdu_received] or let
//!    [entity::Entity::poll_receiver] drain a [PduReceiveProvider].
//!
//! Both entry points require exclusive access, so a host using multiple threads has to
//! serialize them, for example by moving the entity into a dedicated thread and feeding it
//! through [std::sync::mpsc] channels.
//!
//! # Faults and indications
//!
//! Fault conditions are mapped to a [FaultHandlerCode] by the [FaultHandler]. In addition to the
//! protocol reaction, the user can register a [UserFaultHookProvider] to get notified about
//! faults. All other CFDP indications are collected by the entity and can be retrieved with
//! [entity::Entity::indications] and [entity::Entity::completion_indications].
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod dest;
pub mod entity;
pub mod filestore;
pub mod pdu;
pub mod request;
pub mod segments;
pub mod seq_count;
pub mod source;
pub mod time;
pub mod user;

use core::{cell::RefCell, fmt::Debug, hash::Hash, time::Duration};
use std::sync::mpsc;

use crc::{Crc, CRC_32_ISCSI, CRC_32_ISO_HDLC};
use hashbrown::HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::pdu::{
    ChecksumType, ConditionCode, CrcFlag, FaultHandlerCode, FileDirectiveType, LargeFileFlag, Pdu,
    PduBody, PduError, PduType, TransmissionMode, UnsignedByteField,
};

/// This structure models the remote entity configuration information as specified in chapter 8.3
/// of the CFDP standard.
///
/// A copy of the configuration is taken when a transaction is created, so changes only affect
/// transactions created afterwards.
///
/// ## Notes on Positive Acknowledgment Procedures
///
/// The `positive_ack_timer_interval` and `positive_ack_timer_expiration_limit` will be used for
/// positive acknowledgement procedures as specified in CFDP chapter 4.7. The sending entity will
/// start the timer for any PDUs where an acknowledgment is required (EOF and Finished PDU).
/// Once the expected ACK response has not been received for that interval, the PDU is sent
/// again and a counter will be incremented. Once the counter reaches the
/// `positive_ack_timer_expiration_limit`, a Positive ACK Limit Reached fault will be declared
/// by the source entity, and a Check Limit Reached fault by the destination entity.
///
/// ## Notes on Deferred Lost Segment Procedures
///
/// This procedure will be active if an EOF (No Error) PDU is received in acknowledged mode while
/// file data is still missing. After issuing the NAK sequence which has the whole file scope,
/// the NAK timer will be started. The timer is deactivated once all missing data is received.
/// If the timer expires, a new NAK sequence will be issued and a counter will be incremented,
/// which can lead to a NAK Limit Reached fault being declared.
///
/// ## Fields
///
/// * `entity_id` - The ID of the remote entity.
/// * `max_packet_len` - This determines the maximum size of all PDUs generated for that remote
///    entity in addition to the `max_file_segment_len` attribute which also determines the size
///    of file data PDUs.
/// * `max_file_segment_len` The maximum file segment length which determines the maximum size
///   of file data PDUs in addition to the `max_packet_len` attribute. If this field is set
///   to None, the maximum file segment length will be derived from the maximum packet length.
///   If this has some value which is smaller than the segment value derived from
///   `max_packet_len`, this value will be picked.
/// * `closure_requested_by_default` - If the closure requested field is not supplied as part of
///    the Put Request, it will be determined from this field in the remote configuration.
/// * `crc_on_transmission_by_default` - Whether the PDU CRC is appended to all PDUs sent to this
///    remote entity.
/// * `default_transmission_mode` - If the transmission mode is not supplied as part of the
///   Put Request, it will be determined from this field in the remote configuration.
/// * `default_crc_type` - Checksum type used for all file transmissions to this remote entity.
/// * `disposition_on_cancellation` - Determines whether an incomplete received file is discarded
///   on transaction cancellation. Defaults to false.
/// * `check_limit` and `check_timer_interval` - Determines how often the check timer may expire
///   for unacknowledged transfers. For the receiving entity, this allows out-of-order
///   reception of file data PDUs and EOF PDUs, see 4.6.3.3 of the CFDP standard. For the
///   sending entity, this limits the time to wait for a requested Finished PDU. Defaults to
///   2 expirations of 10 seconds.
/// * `positive_ack_timer_interval` - See the notes on the Positive Acknowledgment Procedures.
///   Defaults to 10 seconds.
/// * `positive_ack_timer_expiration_limit` - See the notes on the Positive Acknowledgment
///    Procedures. Defaults to 2, so the timer may expire twice.
/// * `immediate_nak_mode` - Specifies whether a NAK sequence should be issued immediately when a
///    file data gap is detected in the acknowledged mode. Defaults to false.
/// * `nak_timer_interval` - See the notes on the Deferred Lost Segment Procedure. Defaults to
///   10 seconds.
/// * `nak_timer_expiration_limit` - See the notes on the Deferred Lost Segment Procedure.
///   Defaults to 2, so the timer may expire two times.
/// * `inactivity_timeout` - Maximum time without any received PDU for a transaction that waits
///   for the remote entity. Defaults to 30 seconds.
/// * `keep_alive_interval` - Interval for keep alive PDUs sent by the receiving entity in
///   acknowledged mode. Disabled by default.
/// * `keep_alive_discrepancy_limit` - Maximum difference between the progress of the sending
///   entity and the progress reported by keep alive PDUs before a Keep Alive Limit Reached
///   fault is declared.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RemoteEntityConfig {
    pub entity_id: UnsignedByteField,
    pub max_packet_len: usize,
    pub max_file_segment_len: Option<usize>,
    pub closure_requested_by_default: bool,
    pub crc_on_transmission_by_default: bool,
    pub default_transmission_mode: TransmissionMode,
    pub default_crc_type: ChecksumType,
    pub disposition_on_cancellation: bool,
    pub check_limit: u32,
    pub check_timer_interval: Duration,
    pub positive_ack_timer_interval: Duration,
    pub positive_ack_timer_expiration_limit: u32,
    pub immediate_nak_mode: bool,
    pub nak_timer_interval: Duration,
    pub nak_timer_expiration_limit: u32,
    pub inactivity_timeout: Duration,
    pub keep_alive_interval: Option<Duration>,
    pub keep_alive_discrepancy_limit: u64,
}

impl RemoteEntityConfig {
    pub fn new_with_default_values(
        entity_id: UnsignedByteField,
        max_packet_len: usize,
        closure_requested_by_default: bool,
        crc_on_transmission_by_default: bool,
        default_transmission_mode: TransmissionMode,
        default_crc_type: ChecksumType,
    ) -> Self {
        Self {
            entity_id,
            max_file_segment_len: None,
            max_packet_len,
            closure_requested_by_default,
            crc_on_transmission_by_default,
            default_transmission_mode,
            default_crc_type,
            disposition_on_cancellation: false,
            check_limit: 2,
            check_timer_interval: Duration::from_secs(10),
            positive_ack_timer_interval: Duration::from_secs(10),
            positive_ack_timer_expiration_limit: 2,
            immediate_nak_mode: false,
            nak_timer_interval: Duration::from_secs(10),
            nak_timer_expiration_limit: 2,
            inactivity_timeout: Duration::from_secs(30),
            keep_alive_interval: None,
            keep_alive_discrepancy_limit: 1 << 20,
        }
    }

    #[inline]
    pub fn crc_flag(&self) -> CrcFlag {
        CrcFlag::from(self.crc_on_transmission_by_default)
    }

    /// Maximum length of the file data inside a file data PDU for the given header length.
    ///
    /// Returns 0 if the maximum packet length does not even leave room for a single byte.
    pub fn max_file_segment_len_for_header(
        &self,
        pdu_header_len: usize,
        file_flag: LargeFileFlag,
    ) -> usize {
        let crc_len = match self.crc_flag() {
            CrcFlag::WithCrc => 2,
            CrcFlag::NoCrc => 0,
        };
        let derived = self
            .max_packet_len
            .saturating_sub(pdu_header_len + file_flag.fss_len() + crc_len);
        match self.max_file_segment_len {
            Some(max_seg_len) => max_seg_len.min(derived),
            None => derived,
        }
    }
}

pub trait RemoteEntityConfigProvider {
    /// Retrieve the remote entity configuration for the given remote ID.
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig>;
    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig>;
    /// Add a new remote configuration. Return [true] if the configuration was
    /// inserted successfully, and [false] if a configuration already exists.
    fn add_config(&mut self, cfg: &RemoteEntityConfig) -> bool;
    /// Remote a configuration. Returns [true] if the configuration was removed successfully,
    /// and [false] if no configuration exists for the given remote ID.
    fn remove_config(&mut self, remote_id: u64) -> bool;
}

/// This is a thin wrapper around a [HashMap] to store remote entity configurations.
/// It implements the full [RemoteEntityConfigProvider] trait.
#[derive(Default, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StdRemoteEntityConfigProvider(pub HashMap<u64, RemoteEntityConfig>);

impl RemoteEntityConfigProvider for StdRemoteEntityConfigProvider {
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig> {
        self.0.get(&remote_id)
    }
    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig> {
        self.0.get_mut(&remote_id)
    }
    fn add_config(&mut self, cfg: &RemoteEntityConfig) -> bool {
        if self.0.contains_key(&cfg.entity_id.value()) {
            return false;
        }
        self.0.insert(cfg.entity_id.value(), *cfg);
        true
    }
    fn remove_config(&mut self, remote_id: u64) -> bool {
        self.0.remove(&remote_id).is_some()
    }
}

/// This is a thin wrapper around a [Vec] to store remote entity configurations.
/// It implements the full [RemoteEntityConfigProvider] trait.
#[derive(Default, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VecRemoteEntityConfigProvider(pub Vec<RemoteEntityConfig>);

impl RemoteEntityConfigProvider for VecRemoteEntityConfigProvider {
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig> {
        self.0
            .iter()
            .find(|&cfg| cfg.entity_id.value() == remote_id)
    }

    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig> {
        self.0
            .iter_mut()
            .find(|cfg| cfg.entity_id.value() == remote_id)
    }

    fn add_config(&mut self, cfg: &RemoteEntityConfig) -> bool {
        if self.get(cfg.entity_id.value()).is_some() {
            return false;
        }
        self.0.push(*cfg);
        true
    }

    fn remove_config(&mut self, remote_id: u64) -> bool {
        let len_before = self.0.len();
        self.0.retain(|cfg| cfg.entity_id.value() != remote_id);
        self.0.len() != len_before
    }
}

/// A remote entity configurations also implements the [RemoteEntityConfigProvider], but the
/// [RemoteEntityConfigProvider::add_config] and [RemoteEntityConfigProvider::remove_config]
/// are no-ops and always returns [false].
impl RemoteEntityConfigProvider for RemoteEntityConfig {
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig> {
        if remote_id == self.entity_id.value() {
            return Some(self);
        }
        None
    }

    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig> {
        if remote_id == self.entity_id.value() {
            return Some(self);
        }
        None
    }

    fn add_config(&mut self, _cfg: &RemoteEntityConfig) -> bool {
        false
    }

    fn remove_config(&mut self, _remote_id: u64) -> bool {
        false
    }
}

/// This trait introduces some callbacks which will be called when a particular CFDP fault
/// handler is called.
///
/// It is passed into the CFDP entity as part of the [LocalEntityConfig] and provides a way to
/// specify custom user error handlers. This allows to implement some CFDP features like fault
/// handler logging, which would not be possible generically otherwise.
///
/// For each error reported by the [FaultHandler], the appropriate fault handler callback
/// will be called depending on the [FaultHandlerCode].
pub trait UserFaultHookProvider {
    fn notice_of_suspension_cb(&mut self, fault_info: FaultInfo);

    fn notice_of_cancellation_cb(&mut self, fault_info: FaultInfo);

    fn abandoned_cb(&mut self, fault_info: FaultInfo);

    fn ignore_cb(&mut self, fault_info: FaultInfo);
}

/// Dummy fault hook which implements [UserFaultHookProvider] but only provides empty
/// implementations.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct DummyFaultHook {}

impl UserFaultHookProvider for DummyFaultHook {
    fn notice_of_suspension_cb(&mut self, _fault_info: FaultInfo) {}

    fn notice_of_cancellation_cb(&mut self, _fault_info: FaultInfo) {}

    fn abandoned_cb(&mut self, _fault_info: FaultInfo) {}

    fn ignore_cb(&mut self, _fault_info: FaultInfo) {}
}

/// Information passed to the [UserFaultHookProvider] callbacks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, derive_new::new)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FaultInfo {
    pub transaction_id: TransactionId,
    pub condition_code: ConditionCode,
    pub progress: u64,
}

const FAULT_HANDLER_TABLE_LEN: usize = 10;

/// This structure is used to implement the fault handling as specified in chapter 4.8 of the CFDP
/// standard.
///
/// It does so by mapping each applicable [ConditionCode] to a fault handler which is denoted by
/// the four [FaultHandlerCode]s. The lookup itself is side effect free. The transaction which
/// declared the fault executes the selected action and then reports it with
/// [Self::report_fault], which dispatches to the user-provided [UserFaultHookProvider].
///
/// Some note on the provided default settings:
///
/// - Positive ACK limit reached and inactivity faults abandon the transaction. There is no
///   point in trying to notify a remote entity which is not responding anymore.
/// - Unsupported checksum types will be ignored. Even if the checksum type is not supported
///   the file transfer might still have worked properly.
///
/// For all other faults, the default fault handling operation will be to cancel the transaction.
/// Condition codes which are not faults, for example [ConditionCode::NoError], always map to
/// [FaultHandlerCode::IgnoreError]. The defaults can be overriden by using the
/// [Self::set_fault_handler] method.
pub struct FaultHandler<UserHandler: UserFaultHookProvider> {
    handler_array: [FaultHandlerCode; FAULT_HANDLER_TABLE_LEN],
    // The user hook is called from transactions which only have shared access to the MIB.
    pub user_hook: RefCell<UserHandler>,
}

impl<UserHandler: UserFaultHookProvider> FaultHandler<UserHandler> {
    fn condition_code_to_array_index(conditon_code: ConditionCode) -> Option<usize> {
        Some(match conditon_code {
            ConditionCode::PositiveAckLimitReached => 0,
            ConditionCode::KeepAliveLimitReached => 1,
            ConditionCode::InvalidTransmissionMode => 2,
            ConditionCode::FilestoreRejection => 3,
            ConditionCode::FileChecksumFailure => 4,
            ConditionCode::FileSizeError => 5,
            ConditionCode::NakLimitReached => 6,
            ConditionCode::InactivityDetected => 7,
            ConditionCode::CheckLimitReached => 8,
            ConditionCode::UnsupportedChecksumType => 9,
            _ => return None,
        })
    }

    /// Returns [false] if the condition code is not a fault condition and the table was not
    /// changed.
    pub fn set_fault_handler(
        &mut self,
        condition_code: ConditionCode,
        fault_handler: FaultHandlerCode,
    ) -> bool {
        match Self::condition_code_to_array_index(condition_code) {
            Some(array_idx) => {
                self.handler_array[array_idx] = fault_handler;
                true
            }
            None => false,
        }
    }

    pub fn new(user_fault_handler: UserHandler) -> Self {
        let mut fault_handler = Self {
            handler_array: [FaultHandlerCode::NoticeOfCancellation; FAULT_HANDLER_TABLE_LEN],
            user_hook: RefCell::new(user_fault_handler),
        };
        fault_handler.set_fault_handler(
            ConditionCode::PositiveAckLimitReached,
            FaultHandlerCode::AbandonTransaction,
        );
        fault_handler.set_fault_handler(
            ConditionCode::InactivityDetected,
            FaultHandlerCode::AbandonTransaction,
        );
        fault_handler.set_fault_handler(
            ConditionCode::UnsupportedChecksumType,
            FaultHandlerCode::IgnoreError,
        );
        fault_handler
    }

    pub fn get_fault_handler(&self, condition_code: ConditionCode) -> FaultHandlerCode {
        match Self::condition_code_to_array_index(condition_code) {
            Some(array_idx) => self.handler_array[array_idx],
            None => FaultHandlerCode::IgnoreError,
        }
    }

    /// Notify the user hook about a fault which was handled with the passed handler code.
    pub fn report_fault(&self, code: FaultHandlerCode, fault_info: FaultInfo) {
        let mut handler_mut = self.user_hook.borrow_mut();
        match code {
            FaultHandlerCode::NoticeOfCancellation => {
                handler_mut.notice_of_cancellation_cb(fault_info);
            }
            FaultHandlerCode::NoticeOfSuspension => {
                handler_mut.notice_of_suspension_cb(fault_info);
            }
            FaultHandlerCode::IgnoreError => {
                handler_mut.ignore_cb(fault_info);
            }
            FaultHandlerCode::AbandonTransaction => {
                handler_mut.abandoned_cb(fault_info);
            }
        }
    }
}

/// Enables or disables the optional CFDP indications. Transaction start, metadata received,
/// fault and abandoned indications are always generated.
///
/// At most `max_pending_indications` indications are kept until the user drains them. The
/// oldest pending indication is discarded when the limit is reached. Completion indications are
/// not affected by this limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IndicationConfig {
    pub eof_sent: bool,
    pub eof_recv: bool,
    pub file_segment_recv: bool,
    pub transaction_finished: bool,
    pub suspended: bool,
    pub resumed: bool,
    pub max_pending_indications: usize,
}

pub const DEFAULT_MAX_PENDING_INDICATIONS: usize = 256;

impl Default for IndicationConfig {
    fn default() -> Self {
        Self {
            eof_sent: true,
            eof_recv: true,
            file_segment_recv: true,
            transaction_finished: true,
            suspended: true,
            resumed: true,
            max_pending_indications: DEFAULT_MAX_PENDING_INDICATIONS,
        }
    }
}

/// Each CFDP entity has a [LocalEntityConfig]uration.
pub struct LocalEntityConfig<UserFaultHook: UserFaultHookProvider> {
    pub id: UnsignedByteField,
    pub indication_cfg: IndicationConfig,
    pub fault_handler: FaultHandler<UserFaultHook>,
}

impl<UserFaultHook: UserFaultHookProvider> LocalEntityConfig<UserFaultHook> {
    pub fn new(
        id: UnsignedByteField,
        indication_cfg: IndicationConfig,
        hook: UserFaultHook,
    ) -> Self {
        Self {
            id,
            indication_cfg,
            fault_handler: FaultHandler::new(hook),
        }
    }

    pub fn user_fault_hook_mut(&mut self) -> &mut RefCell<UserFaultHook> {
        &mut self.fault_handler.user_hook
    }

    pub fn user_fault_hook(&self) -> &RefCell<UserFaultHook> {
        &self.fault_handler.user_hook
    }
}

/// Generic error type for sending a PDU via a message queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum GenericSendError {
    #[error("RX disconnected")]
    RxDisconnected,
    #[error("queue is full, fill count {0:?}")]
    QueueFull(Option<u32>),
    #[error("other send error")]
    Other,
}

/// Generic error type for receiving PDUs from a message queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum GenericReceiveError {
    #[error("TX disconnected")]
    TxDisconnected,
    #[error("other receive error")]
    Other,
}

/// Best-effort transport for outgoing PDUs. The CFDP entity does not assume any delivery
/// guarantee.
pub trait PduSendProvider {
    fn send_pdu(
        &self,
        remote_id: UnsignedByteField,
        pdu_type: PduType,
        file_directive_type: Option<FileDirectiveType>,
        raw_pdu: &[u8],
    ) -> Result<(), GenericSendError>;
}

/// Non-blocking transport for incoming PDUs.
pub trait PduReceiveProvider {
    /// Returns [None] if no PDU is available right now.
    fn try_recv_pdu(&self) -> Result<Option<PduOwnedWithInfo>, GenericReceiveError>;
}

/// Channels are point-to-point, the remote ID is not required for addressing.
impl PduSendProvider for mpsc::Sender<PduOwnedWithInfo> {
    fn send_pdu(
        &self,
        _remote_id: UnsignedByteField,
        pdu_type: PduType,
        file_directive_type: Option<FileDirectiveType>,
        raw_pdu: &[u8],
    ) -> Result<(), GenericSendError> {
        self.send(PduOwnedWithInfo::new(
            pdu_type,
            file_directive_type,
            raw_pdu.to_vec(),
        ))
        .map_err(|_| GenericSendError::RxDisconnected)?;
        Ok(())
    }
}

impl PduSendProvider for mpsc::SyncSender<PduOwnedWithInfo> {
    fn send_pdu(
        &self,
        _remote_id: UnsignedByteField,
        pdu_type: PduType,
        file_directive_type: Option<FileDirectiveType>,
        raw_pdu: &[u8],
    ) -> Result<(), GenericSendError> {
        self.try_send(PduOwnedWithInfo::new(
            pdu_type,
            file_directive_type,
            raw_pdu.to_vec(),
        ))
        .map_err(|e| match e {
            mpsc::TrySendError::Full(_) => GenericSendError::QueueFull(None),
            mpsc::TrySendError::Disconnected(_) => GenericSendError::RxDisconnected,
        })?;
        Ok(())
    }
}

impl PduReceiveProvider for mpsc::Receiver<PduOwnedWithInfo> {
    fn try_recv_pdu(&self) -> Result<Option<PduOwnedWithInfo>, GenericReceiveError> {
        match self.try_recv() {
            Ok(pdu) => Ok(Some(pdu)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => Err(GenericReceiveError::TxDisconnected),
        }
    }
}

/// The CFDP transaction ID of a CFDP transaction consists of the source entity ID and the sequence
/// number of that transfer which is also determined by the CFDP source entity.
///
/// Equality, hashing and ordering only consider the values, not the field widths.
#[derive(Debug, Eq, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransactionId {
    source_id: UnsignedByteField,
    seq_num: UnsignedByteField,
}

impl TransactionId {
    pub fn new(source_id: UnsignedByteField, seq_num: UnsignedByteField) -> Self {
        Self { source_id, seq_num }
    }

    pub fn source_id(&self) -> &UnsignedByteField {
        &self.source_id
    }

    pub fn seq_num(&self) -> &UnsignedByteField {
        &self.seq_num
    }
}

impl Hash for TransactionId {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.source_id.value().hash(state);
        self.seq_num.value().hash(state);
    }
}

impl PartialEq for TransactionId {
    fn eq(&self, other: &Self) -> bool {
        self.source_id.value() == other.source_id.value()
            && self.seq_num.value() == other.seq_num.value()
    }
}

impl PartialOrd for TransactionId {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransactionId {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.source_id.value(), self.seq_num.value())
            .cmp(&(other.source_id.value(), other.seq_num.value()))
    }
}

impl core::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({}, {})", self.source_id.value(), self.seq_num.value())
    }
}

/// [crc::Crc] instance using [crc::CRC_32_ISO_HDLC].
///
/// SANA registry entry: <https://sanaregistry.org/r/checksum_identifiers/records/4>,
/// Entry in CRC catalogue: <https://reveng.sourceforge.io/crc-catalogue/all.htm#crc.cat.crc-32>
pub const CRC_32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
/// [crc::Crc] instance using [crc::CRC_32_ISCSI].
///
/// SANA registry entry: <https://sanaregistry.org/r/checksum_identifiers/records/3>,
/// Entry in CRC catalogue: <https://reveng.sourceforge.io/crc-catalogue/all.htm#crc.cat.crc-32-iscsi>
pub const CRC_32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketTarget {
    SourceEntity,
    DestEntity,
}

/// Determine whether a PDU is handled by the source or the destination side of a transaction.
///
/// The routing is based on section 4.5.3 of the CFDP standard.
pub fn determine_packet_target(pdu: &Pdu) -> PacketTarget {
    match pdu.body() {
        // Section c) of 4.5.3: These PDUs should always be targeted towards the file sender
        // a.k.a. the source handler
        PduBody::Nak(_) | PduBody::Finished(_) | PduBody::KeepAlive(_) => {
            PacketTarget::SourceEntity
        }
        // Section b) of 4.5.3: These PDUs should always be targeted towards the file receiver
        // a.k.a. the destination handler
        PduBody::Metadata(_) | PduBody::Eof(_) | PduBody::Prompt(_) | PduBody::FileData(_) => {
            PacketTarget::DestEntity
        }
        // Section a): Recipient depends of the type of PDU that is being acknowledged.
        PduBody::Ack(ack) => {
            if ack.directive_code_of_acked_pdu() == FileDirectiveType::EofPdu {
                PacketTarget::SourceEntity
            } else {
                PacketTarget::DestEntity
            }
        }
    }
}

/// Raw PDU with some additional context information which is useful for routing.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PduOwnedWithInfo {
    pub pdu_type: PduType,
    pub file_directive_type: Option<FileDirectiveType>,
    pub pdu: Vec<u8>,
}

impl PduOwnedWithInfo {
    /// The raw packet must contain exactly one valid PDU.
    pub fn new_from_raw_packet(raw_packet: &[u8]) -> Result<Self, PduError> {
        let pdu = Pdu::from_bytes(raw_packet)?;
        Ok(Self::new(
            pdu.pdu_type(),
            pdu.directive_type(),
            raw_packet.to_vec(),
        ))
    }

    pub fn new(
        pdu_type: PduType,
        file_directive_type: Option<FileDirectiveType>,
        pdu: Vec<u8>,
    ) -> Self {
        Self {
            pdu_type,
            file_directive_type,
            pdu,
        }
    }

    #[inline]
    pub fn raw_pdu(&self) -> &[u8] {
        &self.pdu
    }
}
