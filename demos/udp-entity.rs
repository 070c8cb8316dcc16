//! Two CFDP entities exchanging a file over localhost UDP sockets.
//!
//! Each entity runs in its own thread and owns a UDP socket. The sending side can simulate a
//! lossy link by dropping a configurable share of its outgoing PDUs, which is useful to watch
//! the NAK and positive acknowledgement procedures of the acknowledged mode at work.
use std::{
    fs::OpenOptions,
    io::{self, ErrorKind, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use cfdp::{
    entity::Entity,
    filestore::NativeFilestore,
    pdu::{ChecksumType, FileDirectiveType, PduType, TransmissionMode, UnsignedByteField},
    request::PutRequest,
    seq_count::SeqCountProviderSimple,
    time::{Clock, StdClock},
    user::Indication,
    FaultInfo, GenericReceiveError, GenericSendError, IndicationConfig, LocalEntityConfig,
    PduOwnedWithInfo, PduReceiveProvider, PduSendProvider, RemoteEntityConfig, RemoteEntityConfigProvider,
    StdRemoteEntityConfigProvider, UserFaultHookProvider,
};
use clap::Parser;
use log::{debug, info, warn};

static KILL_APP: AtomicBool = AtomicBool::new(false);

const SENDER_ID: UnsignedByteField = UnsignedByteField::new_u16(1);
const RECEIVER_ID: UnsignedByteField = UnsignedByteField::new_u16(2);

const SENDER_PORT: u16 = 5111;
const RECEIVER_PORT: u16 = 5222;

const MAX_PACKET_LEN: usize = 1024;
const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

#[derive(Debug, Copy, Clone, clap::ValueEnum)]
pub enum TransmissionModeCli {
    Nak,
    Ack,
}

#[derive(clap::Parser)]
#[command(about = "Copy a file between two CFDP entities over UDP")]
pub struct Cli {
    #[arg(short, default_value = "ack")]
    mode: TransmissionModeCli,
    #[arg(short)]
    closure_requested: Option<bool>,
    /// Size of the generated source file in bytes.
    #[arg(short, long, default_value_t = 20000)]
    file_size: usize,
    /// Probability for dropping each PDU sent by the sending entity.
    #[arg(short, long, default_value_t = 0.0)]
    drop_probability: f64,
}

#[derive(Default)]
pub struct ExampleFaultHandler {}

impl UserFaultHookProvider for ExampleFaultHandler {
    fn notice_of_suspension_cb(&mut self, fault_info: FaultInfo) {
        warn!("suspension, {:?}", fault_info);
    }

    fn notice_of_cancellation_cb(&mut self, fault_info: FaultInfo) {
        warn!("cancellation, {:?}", fault_info);
    }

    fn abandoned_cb(&mut self, fault_info: FaultInfo) {
        warn!("abandonment, {:?}", fault_info);
    }

    fn ignore_cb(&mut self, fault_info: FaultInfo) {
        warn!("ignored fault, {:?}", fault_info);
    }
}

/// Sending half of the UDP transport of one entity.
pub struct UdpLink {
    socket: UdpSocket,
    remote_addr: SocketAddr,
    drop_probability: f64,
}

/// Receiving half of the UDP transport of one entity.
pub struct UdpReceiver {
    socket: UdpSocket,
}

impl UdpLink {
    /// Bind the local socket and return both halves of the transport.
    pub fn new(
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        drop_probability: f64,
    ) -> Result<(Self, UdpReceiver), io::Error> {
        let socket = UdpSocket::bind(local_addr)?;
        socket.set_nonblocking(true)?;
        let receiver = UdpReceiver {
            socket: socket.try_clone()?,
        };
        Ok((
            Self {
                socket,
                remote_addr,
                drop_probability,
            },
            receiver,
        ))
    }
}

impl PduSendProvider for UdpLink {
    fn send_pdu(
        &self,
        _remote_id: UnsignedByteField,
        pdu_type: PduType,
        file_directive_type: Option<FileDirectiveType>,
        raw_pdu: &[u8],
    ) -> Result<(), GenericSendError> {
        if rand::random::<f64>() < self.drop_probability {
            debug!("dropping {pdu_type:?} PDU {file_directive_type:?}");
            return Ok(());
        }
        self.socket
            .send_to(raw_pdu, self.remote_addr)
            .map_err(|e| {
                warn!("sending PDU with UDP socket failed: {e}");
                GenericSendError::Other
            })?;
        Ok(())
    }
}

impl PduReceiveProvider for UdpReceiver {
    fn try_recv_pdu(&self) -> Result<Option<PduOwnedWithInfo>, GenericReceiveError> {
        let mut recv_buf = [0; MAX_PACKET_LEN];
        loop {
            let (len, _) = match self.socket.recv_from(&mut recv_buf) {
                Ok(res) => res,
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    return Ok(None);
                }
                Err(e) => {
                    warn!("UDP receive error: {e}");
                    return Err(GenericReceiveError::Other);
                }
            };
            match PduOwnedWithInfo::new_from_raw_packet(&recv_buf[0..len]) {
                Ok(pdu) => return Ok(Some(pdu)),
                Err(e) => warn!("received invalid PDU: {e}"),
            }
        }
    }
}

type UdpEntity = Entity<
    NativeFilestore,
    UdpLink,
    ExampleFaultHandler,
    StdRemoteEntityConfigProvider,
    SeqCountProviderSimple,
>;

fn create_entity(
    local_id: UnsignedByteField,
    remote_id: UnsignedByteField,
    trans_mode: TransmissionMode,
    link: UdpLink,
) -> UdpEntity {
    let mut remote_cfgs = StdRemoteEntityConfigProvider::default();
    let mut remote_cfg = RemoteEntityConfig::new_with_default_values(
        remote_id,
        MAX_PACKET_LEN,
        false,
        true,
        trans_mode,
        ChecksumType::Crc32C,
    );
    remote_cfg.positive_ack_timer_interval = Duration::from_secs(2);
    remote_cfg.nak_timer_interval = Duration::from_secs(2);
    remote_cfg.positive_ack_timer_expiration_limit = 5;
    remote_cfg.nak_timer_expiration_limit = 5;
    remote_cfgs.add_config(&remote_cfg);
    Entity::new(
        LocalEntityConfig::new(
            local_id,
            IndicationConfig::default(),
            ExampleFaultHandler::default(),
        ),
        remote_cfgs,
        NativeFilestore::default(),
        link,
        SeqCountProviderSimple::default(),
    )
}

/// Run an entity until the first transaction it took part in is finished.
fn run_entity(mut entity: UdpEntity, receiver: UdpReceiver) {
    let clock = StdClock::new();
    let name = format!("entity {}", entity.id().value());
    let mut finished = false;
    while !finished && !KILL_APP.load(Ordering::Relaxed) {
        match entity.poll_receiver(&receiver) {
            Ok(0) => thread::sleep(Duration::from_millis(5)),
            Ok(_) => (),
            Err(e) => {
                warn!("{name}: receiving PDUs failed: {e}");
                KILL_APP.store(true, Ordering::Relaxed);
            }
        }
        entity.tick(clock.now());
        for indication in entity.indications() {
            match indication {
                Indication::FileSegmentReceived { .. } => debug!("{name}: {indication:?}"),
                _ => info!("{name}: {indication:?}"),
            }
        }
        for completion in entity.completion_indications() {
            info!("{name}: transaction finished: {completion:?}");
            finished = true;
        }
    }
    let anomalies = entity.anomalies();
    info!(
        "{name}: done, {} malformed and {} ignored PDUs",
        anomalies.malformed_pdus(),
        anomalies.ignored_pdus()
    );
}

fn main() {
    let cli_args = Cli::parse();
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                std::thread::current().name().unwrap_or("main"),
                record.level(),
                message
            ))
        })
        .level(LOG_LEVEL)
        .chain(std::io::stdout())
        .apply()
        .unwrap();

    let srcfile = tempfile::NamedTempFile::new().unwrap().into_temp_path();
    let file_data: Vec<u8> = (0..cli_args.file_size)
        .map(|_| rand::random::<u8>())
        .collect();
    OpenOptions::new()
        .write(true)
        .open(&srcfile)
        .expect("opening file failed")
        .write_all(&file_data)
        .expect("writing file content failed");
    info!("created test source file {:?}", srcfile);
    let destdir = tempfile::tempdir().expect("creating temp directory failed");

    let trans_mode = match cli_args.mode {
        TransmissionModeCli::Ack => TransmissionMode::Acknowledged,
        TransmissionModeCli::Nak => TransmissionMode::Unacknowledged,
    };
    let sender_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), SENDER_PORT);
    let receiver_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), RECEIVER_PORT);
    let (sender_link, sender_rx) =
        UdpLink::new(sender_addr, receiver_addr, cli_args.drop_probability)
            .expect("creating UDP link failed");
    let mut sender = create_entity(SENDER_ID, RECEIVER_ID, trans_mode, sender_link);
    let (receiver_link, receiver_rx) =
        UdpLink::new(receiver_addr, sender_addr, 0.0).expect("creating UDP link failed");
    let receiver = create_entity(RECEIVER_ID, SENDER_ID, trans_mode, receiver_link);

    // The file name of the source file is appended because the destination is a directory.
    let put_request = PutRequest::new_regular_request(
        RECEIVER_ID,
        srcfile.to_str().expect("invalid path string"),
        destdir.path().to_str().expect("invalid path string"),
        Some(trans_mode),
        cli_args.closure_requested,
    )
    .expect("put request creation failed");
    info!("performing put request: {:?}", put_request);
    sender.put(&put_request).expect("put request failed");

    let jh_sender = thread::Builder::new()
        .name("cfdp sender".to_string())
        .spawn(move || run_entity(sender, sender_rx))
        .unwrap();
    let jh_receiver = thread::Builder::new()
        .name("cfdp receiver".to_string())
        .spawn(move || run_entity(receiver, receiver_rx))
        .unwrap();

    jh_sender.join().unwrap();
    jh_receiver.join().unwrap();

    let file_name = Path::new(&srcfile).file_name().unwrap();
    let received = std::fs::read(destdir.path().join(file_name)).unwrap_or_default();
    if received == file_data {
        info!("file with {} bytes received correctly", received.len());
    } else {
        warn!("received file does not match the source file");
    }
}
