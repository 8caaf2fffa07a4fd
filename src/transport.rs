//! Media and voice transports.

use dbus::{arg, nonblock::Proxy};
use futures::future::BoxFuture;
use std::{
    fmt::{self, Debug, Display, Formatter},
    os::fd::{FromRawFd, OwnedFd},
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, Mutex, Weak,
    },
};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    codec::{self, Codec},
    ctl::{
        EventKind, TransportEvent, PCM_STREAM_CAPTURE, PCM_STREAM_PLAYBACK, PCM_TYPE_A2DP,
        PCM_TYPE_SCO,
    },
    device::Device,
    pcm::PcmEndpoint,
    sco,
    session::SessionInner,
    sock, Address, Error, ErrorKind, InternalErrorKind, Result, MEDIA_TRANSPORT_INTERFACE, TIMEOUT,
};

/// Length of a forwarded RFCOMM command buffer.
pub const RFCOMM_COMMAND_LEN: usize = 32;

/// Maximum A2DP per-channel volume.
pub const A2DP_VOLUME_MAX: u8 = 127;

/// Maximum SCO speaker and microphone gain.
pub const SCO_GAIN_MAX: u8 = 15;

/// Bluetooth audio profile of a transport.
#[derive(Clone, Copy, Debug, strum::Display, Eq, PartialEq, Hash)]
pub enum Profile {
    /// A2DP source: we send high-quality audio to the remote device.
    #[strum(serialize = "A2DP Source")]
    A2dpSource,
    /// A2DP sink: we receive high-quality audio from the remote device.
    #[strum(serialize = "A2DP Sink")]
    A2dpSink,
    /// HSP in the headset role.
    #[strum(serialize = "HSP Headset")]
    HspHs,
    /// HSP in the audio gateway role.
    #[strum(serialize = "HSP Audio Gateway")]
    HspAg,
    /// HFP in the hands-free role.
    #[strum(serialize = "HFP Hands-Free")]
    HfpHf,
    /// HFP in the audio gateway role.
    #[strum(serialize = "HFP Audio Gateway")]
    HfpAg,
}

impl Profile {
    /// Whether this is one of the A2DP profiles.
    pub fn is_a2dp(&self) -> bool {
        matches!(self, Self::A2dpSource | Self::A2dpSink)
    }

    /// Whether this profile carries voice over an SCO link.
    pub fn is_sco(&self) -> bool {
        matches!(self, Self::HspHs | Self::HspAg | Self::HfpHf | Self::HfpAg)
    }

    /// Whether this is one of the HSP profiles.
    pub fn is_hsp(&self) -> bool {
        matches!(self, Self::HspHs | Self::HspAg)
    }

    /// Whether we act as the audio gateway for this profile.
    pub fn is_ag(&self) -> bool {
        matches!(self, Self::HspAg | Self::HfpAg)
    }

    /// Service class UUID of this profile.
    pub fn uuid(&self) -> Uuid {
        let service: u128 = match self {
            Self::A2dpSource => 0x110a,
            Self::A2dpSink => 0x110b,
            Self::HspHs => 0x1108,
            Self::HspAg => 0x1112,
            Self::HfpHf => 0x111e,
            Self::HfpAg => 0x111f,
        };
        Uuid::from_u128(service << 96 | 0x0000_1000_8000_00805f9b34fb)
    }

    /// Short name used for PCM FIFO files.
    pub(crate) fn slug(&self) -> &'static str {
        match self {
            Self::A2dpSource => "a2dpsrc",
            Self::A2dpSink => "a2dpsnk",
            Self::HspHs => "hsphs",
            Self::HspAg => "hspag",
            Self::HfpHf => "hfphf",
            Self::HfpAg => "hfpag",
        }
    }
}

/// Type of a transport: profile, negotiated codec and the RFCOMM marker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransportType {
    /// Bluetooth profile.
    pub profile: Profile,
    /// Negotiated codec.
    pub codec: Codec,
    /// The transport carries the profile's RFCOMM command channel instead
    /// of audio.
    pub rfcomm: bool,
}

impl TransportType {
    /// Creates an audio transport type.
    pub fn new(profile: Profile, codec: Codec) -> Self {
        Self { profile, codec, rfcomm: false }
    }
}

impl Display for TransportType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if self.rfcomm {
            write!(f, "RFCOMM ({})", self.profile)
        } else {
            write!(f, "{} ({})", self.profile, self.codec)
        }
    }
}

/// Lifecycle state of a transport.
#[derive(Clone, Copy, Debug, strum::Display, Eq, PartialEq)]
pub enum State {
    /// No IO worker and no acquired socket.
    Idle,
    /// Awaiting acquisition or the daemon's green light.
    Pending,
    /// IO worker running, media flowing.
    Active,
    /// IO worker running but deliberately not producing or consuming.
    Paused,
    /// Terminal; the destructor is running or has run.
    Limbo,
}

/// Signal delivered to a transport IO worker.
///
/// On the wire each signal is a single code byte; [Signal::RfcommSend]
/// carries a fixed-width command buffer behind its code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Signal {
    /// A local client connected to a PCM endpoint.
    PcmOpen,
    /// The local client left; close the PCM endpoint.
    PcmClose,
    /// Stop producing and consuming PCM data.
    PcmPause,
    /// Resume after [Signal::PcmPause].
    PcmResume,
    /// Drain request; acknowledged once all buffered samples are out.
    PcmSync,
    /// Write this command to the RFCOMM channel.
    RfcommSend([u8; RFCOMM_COMMAND_LEN]),
    /// Shut the worker down cooperatively.
    Terminate,
}

impl Signal {
    /// Wire code of this signal.
    pub fn code(&self) -> u8 {
        match self {
            Self::PcmOpen => 0x01,
            Self::PcmClose => 0x02,
            Self::PcmPause => 0x03,
            Self::PcmResume => 0x04,
            Self::PcmSync => 0x05,
            Self::RfcommSend(_) => 0x06,
            Self::Terminate => 0x07,
        }
    }

    /// Appends the wire form of this signal to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.code());
        if let Self::RfcommSend(command) = self {
            buf.extend_from_slice(command);
        }
    }

    /// Decodes one signal from the front of `buf`.
    ///
    /// Returns the signal and the number of bytes consumed, or [None] for
    /// an unknown code or a truncated buffer.
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        match *buf.first()? {
            0x01 => Some((Self::PcmOpen, 1)),
            0x02 => Some((Self::PcmClose, 1)),
            0x03 => Some((Self::PcmPause, 1)),
            0x04 => Some((Self::PcmResume, 1)),
            0x05 => Some((Self::PcmSync, 1)),
            0x06 => {
                let command: [u8; RFCOMM_COMMAND_LEN] =
                    buf.get(1..1 + RFCOMM_COMMAND_LEN)?.try_into().ok()?;
                Some((Self::RfcommSend(command), 1 + RFCOMM_COMMAND_LEN))
            }
            0x07 => Some((Self::Terminate, 1)),
            _ => None,
        }
    }
}

struct TransportInner {
    state: State,
    bt: Option<OwnedFd>,
    mtu_read: u16,
    mtu_write: u16,
    worker: Option<JoinHandle<()>>,
    sig_rx: Option<mpsc::UnboundedReceiver<Signal>>,
}

pub(crate) struct A2dpData {
    pub cconfig: Vec<u8>,
    pub pcm: PcmEndpoint,
    pub volume: Mutex<(u8, u8)>,
    pub drained: Notify,
    pub coutq_init: AtomicI32,
}

pub(crate) struct ScoData {
    pub spk_pcm: PcmEndpoint,
    pub mic_pcm: PcmEndpoint,
    pub spk_drained: Notify,
    pub gain: Mutex<(u8, u8)>,
    pub rfcomm: Mutex<Weak<Transport>>,
}

pub(crate) struct RfcommData {
    pub sco: Mutex<Option<Arc<Transport>>>,
}

enum ProfileData {
    A2dp(A2dpData),
    Sco(ScoData),
    Rfcomm(RfcommData),
}

/// One Bluetooth media or voice channel of a remote device.
///
/// A transport owns its Bluetooth socket, its PCM endpoints and its IO
/// worker. Its lifecycle is driven by the Bluetooth daemon and by local PCM
/// clients through [Transport::set_state]; it ends with
/// [Transport::destroy], which is terminal and idempotent.
pub struct Transport {
    me: Weak<Transport>,
    env: Arc<SessionInner>,
    device: Weak<Device>,
    addr: Address,
    adapter_id: u16,
    ttype: TransportType,
    dbus_owner: String,
    dbus_path: String,
    inner: Mutex<TransportInner>,
    sig_tx: mpsc::UnboundedSender<Signal>,
    data: ProfileData,
}

impl Debug for Transport {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Transport")
            .field("type", &self.ttype.to_string())
            .field("path", &self.dbus_path)
            .field("state", &self.state())
            .finish()
    }
}

impl Transport {
    fn new_common(
        device: &Arc<Device>, ttype: TransportType, dbus_owner: &str, dbus_path: &str,
        data: ProfileData,
    ) -> Arc<Self> {
        let (sig_tx, sig_rx) = mpsc::unbounded_channel();
        let transport = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            env: device.env().clone(),
            device: Arc::downgrade(device),
            addr: device.addr(),
            adapter_id: device.adapter_id(),
            ttype,
            dbus_owner: dbus_owner.to_string(),
            dbus_path: dbus_path.to_string(),
            inner: Mutex::new(TransportInner {
                state: State::Idle,
                bt: None,
                mtu_read: 0,
                mtu_write: 0,
                worker: None,
                sig_rx: Some(sig_rx),
            }),
            sig_tx,
            data,
        });
        device.insert_transport(dbus_path, transport.clone());
        transport
    }

    /// Creates a new A2DP transport with the negotiated codec capabilities.
    pub fn new_a2dp(
        device: &Arc<Device>, ttype: TransportType, dbus_owner: &str, dbus_path: &str,
        cconfig: &[u8],
    ) -> Arc<Self> {
        log::trace!("A2DP capabilities of {}: {}", dbus_path, hex::encode(cconfig));

        let fifo = format!("hci{}-{}-{}", device.adapter_id(), device.addr(), ttype.profile.slug());
        let data = ProfileData::A2dp(A2dpData {
            cconfig: cconfig.to_vec(),
            pcm: PcmEndpoint::new(&device.env().config.runtime_dir, &fifo),
            volume: Mutex::new((A2DP_VOLUME_MAX, A2DP_VOLUME_MAX)),
            drained: Notify::new(),
            coutq_init: AtomicI32::new(0),
        });

        let transport = Self::new_common(device, ttype, dbus_owner, dbus_path, data);
        transport.emit_event(EventKind::TransportAdded);
        transport
    }

    /// Creates a new SCO voice transport.
    ///
    /// HSP supports CVSD only; for HSP profiles the codec is forced
    /// accordingly.
    pub fn new_sco(
        device: &Arc<Device>, mut ttype: TransportType, dbus_owner: &str, dbus_path: &str,
    ) -> Arc<Self> {
        if ttype.profile.is_hsp() {
            ttype.codec = Codec::Cvsd;
        }

        let fifo = format!("hci{}-{}-{}", device.adapter_id(), device.addr(), ttype.profile.slug());
        let runtime_dir = &device.env().config.runtime_dir;
        let data = ProfileData::Sco(ScoData {
            spk_pcm: PcmEndpoint::new(runtime_dir, &format!("{fifo}-spk")),
            mic_pcm: PcmEndpoint::new(runtime_dir, &format!("{fifo}-mic")),
            spk_drained: Notify::new(),
            gain: Mutex::new((SCO_GAIN_MAX, SCO_GAIN_MAX)),
            rfcomm: Mutex::new(Weak::new()),
        });

        let transport = Self::new_common(device, ttype, dbus_owner, dbus_path, data);
        transport.emit_event(EventKind::TransportAdded);
        transport
    }

    /// Creates a new RFCOMM command channel transport.
    ///
    /// The voice link of the profile is represented by a dependent SCO
    /// transport created at the `/sco` sub-path; it lives and dies with
    /// this transport. The RFCOMM transport itself emits no events, the
    /// child SCO does.
    pub fn new_rfcomm(
        device: &Arc<Device>, ttype: TransportType, dbus_owner: &str, dbus_path: &str,
    ) -> Arc<Self> {
        let rfcomm_type = TransportType { rfcomm: true, ..ttype };
        let transport = Self::new_common(
            device,
            rfcomm_type,
            dbus_owner,
            dbus_path,
            ProfileData::Rfcomm(RfcommData { sco: Mutex::new(None) }),
        );

        let sco_path = format!("{dbus_path}/sco");
        let sco =
            Self::new_sco(device, TransportType::new(ttype.profile, ttype.codec), dbus_owner, &sco_path);

        if let ProfileData::Rfcomm(rfcomm) = &transport.data {
            *rfcomm.sco.lock().unwrap() = Some(sco.clone());
        }
        if let ProfileData::Sco(sco_data) = &sco.data {
            *sco_data.rfcomm.lock().unwrap() = Arc::downgrade(&transport);
        }

        transport
    }

    /// The device this transport belongs to, while it is still alive.
    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    /// Address of the remote device.
    pub fn addr(&self) -> Address {
        self.addr
    }

    /// Type of this transport.
    pub fn ttype(&self) -> TransportType {
        self.ttype
    }

    /// Path the Bluetooth daemon assigned to this transport.
    pub fn dbus_path(&self) -> &str {
        &self.dbus_path
    }

    /// Bus name of the daemon service owning this transport.
    pub fn dbus_owner(&self) -> &str {
        &self.dbus_owner
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    /// Whether the media socket is acquired.
    pub fn is_acquired(&self) -> bool {
        self.inner.lock().unwrap().bt.is_some()
    }

    /// Whether an IO worker is alive.
    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().worker.is_some()
    }

    /// Read and write MTU of the acquired socket; zero when not acquired.
    pub fn mtu(&self) -> (u16, u16) {
        let inner = self.inner.lock().unwrap();
        (inner.mtu_read, inner.mtu_write)
    }

    /// PCM channel count derived from the negotiated codec configuration.
    ///
    /// Zero when the channel mode is unspecified.
    pub fn channels(&self) -> u32 {
        match &self.data {
            ProfileData::A2dp(a2dp) => codec::a2dp_channels(self.ttype.codec, &a2dp.cconfig),
            ProfileData::Sco(_) => codec::sco_channels(),
            ProfileData::Rfcomm(_) => 0,
        }
    }

    /// PCM sample rate derived from the negotiated codec configuration.
    ///
    /// Zero when the sampling frequency is unspecified.
    pub fn sample_rate(&self) -> u32 {
        match &self.data {
            ProfileData::A2dp(a2dp) => codec::a2dp_sample_rate(self.ttype.codec, &a2dp.cconfig),
            ProfileData::Sco(_) => codec::sco_sample_rate(self.ttype.codec),
            ProfileData::Rfcomm(_) => 0,
        }
    }

    /// PCM endpoint of an A2DP transport.
    pub fn a2dp_pcm(&self) -> Option<&PcmEndpoint> {
        match &self.data {
            ProfileData::A2dp(a2dp) => Some(&a2dp.pcm),
            _ => None,
        }
    }

    /// Speaker PCM endpoint of an SCO transport.
    pub fn sco_spk_pcm(&self) -> Option<&PcmEndpoint> {
        match &self.data {
            ProfileData::Sco(sco) => Some(&sco.spk_pcm),
            _ => None,
        }
    }

    /// Microphone PCM endpoint of an SCO transport.
    pub fn sco_mic_pcm(&self) -> Option<&PcmEndpoint> {
        match &self.data {
            ProfileData::Sco(sco) => Some(&sco.mic_pcm),
            _ => None,
        }
    }

    /// Child SCO transport of an RFCOMM transport.
    pub fn rfcomm_sco(&self) -> Option<Arc<Transport>> {
        match &self.data {
            ProfileData::Rfcomm(rfcomm) => rfcomm.sco.lock().unwrap().clone(),
            _ => None,
        }
    }

    /// Per-channel volume of an A2DP transport (0-127).
    pub fn a2dp_volume(&self) -> Option<(u8, u8)> {
        match &self.data {
            ProfileData::A2dp(a2dp) => Some(*a2dp.volume.lock().unwrap()),
            _ => None,
        }
    }

    /// Sets the per-channel volume of an A2DP transport, clamped to 0-127.
    pub fn set_a2dp_volume(&self, ch1: u8, ch2: u8) {
        if let ProfileData::A2dp(a2dp) = &self.data {
            *a2dp.volume.lock().unwrap() = (ch1.min(A2DP_VOLUME_MAX), ch2.min(A2DP_VOLUME_MAX));
        }
    }

    /// Speaker and microphone gain of an SCO transport (0-15).
    pub fn sco_gain(&self) -> Option<(u8, u8)> {
        match &self.data {
            ProfileData::Sco(sco) => Some(*sco.gain.lock().unwrap()),
            _ => None,
        }
    }

    /// Sets the speaker gain of an SCO transport, clamped to 0-15.
    pub fn set_sco_spk_gain(&self, gain: u8) {
        if let ProfileData::Sco(sco) = &self.data {
            sco.gain.lock().unwrap().0 = gain.min(SCO_GAIN_MAX);
        }
    }

    /// Sets the microphone gain of an SCO transport, clamped to 0-15.
    pub fn set_sco_mic_gain(&self, gain: u8) {
        if let ProfileData::Sco(sco) = &self.data {
            sco.gain.lock().unwrap().1 = gain.min(SCO_GAIN_MAX);
        }
    }

    /// Pushes a signal to the IO worker.
    ///
    /// Signals pushed while no worker is alive are held for the next one,
    /// except that a fresh worker voids anything addressed to its
    /// predecessor.
    pub fn send_signal(&self, signal: Signal) -> Result<()> {
        self.sig_tx
            .send(signal)
            .map_err(|_| Error::new(ErrorKind::Internal(InternalErrorKind::InvalidValue)))
    }

    /// Forwards a command to the RFCOMM channel through the IO worker.
    ///
    /// The command buffer is fixed width; unused trailing bytes must be
    /// zero.
    pub fn send_rfcomm(&self, command: [u8; RFCOMM_COMMAND_LEN]) -> Result<()> {
        self.send_signal(Signal::RfcommSend(command))
    }

    /// Attaches an already established Bluetooth socket.
    ///
    /// Used for RFCOMM descriptors handed over by the daemon and by tests
    /// running against an emulated link.
    pub fn attach_bt_socket(&self, bt: OwnedFd, mtu_read: u16, mtu_write: u16) -> Result<()> {
        sock::set_nonblocking(&bt)?;
        let mut inner = self.inner.lock().unwrap();
        inner.bt = Some(bt);
        inner.mtu_read = mtu_read;
        inner.mtu_write = mtu_write;
        Ok(())
    }

    /// Drives the transport lifecycle state machine.
    ///
    /// Transitioning to the current state is a no-op. On a failed
    /// acquisition or worker spawn the transport reverts to [State::Idle]
    /// and the error is returned.
    pub async fn set_state(&self, state: State) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            log::debug!("State transition: {} -> {} ({})", inner.state, state, self.dbus_path);

            if inner.state == state {
                return Ok(());
            }

            // The A2DP sink worker cannot initialize before the media socket
            // is acquired, so an idle sink accepts only the PENDING transition.
            if self.ttype.profile == Profile::A2dpSink
                && inner.state == State::Idle
                && state != State::Pending
            {
                return Ok(());
            }

            inner.state = state;
        }

        let result = match state {
            State::Idle => {
                self.stop_worker().await;
                Ok(())
            }
            State::Pending => {
                // Only the A2DP sink acquires on its own initiative; for the
                // other profiles the controller acquires on client demand.
                if self.ttype.profile == Profile::A2dpSink {
                    self.acquire().await
                } else {
                    Ok(())
                }
            }
            State::Active | State::Paused => self.spawn_worker(),
            State::Limbo => Ok(()),
        };

        if let Err(err) = result {
            // something went wrong, so go back to idle
            self.inner.lock().unwrap().state = State::Idle;
            self.stop_worker().await;
            return Err(err);
        }
        Ok(())
    }

    /// Acquires the Bluetooth resource backing this transport.
    ///
    /// For A2DP the media socket is requested from the daemon; for SCO a
    /// voice link is opened towards the peer. An already acquired socket is
    /// reused.
    pub async fn acquire(&self) -> Result<()> {
        match &self.data {
            ProfileData::A2dp(_) => self.acquire_a2dp().await,
            ProfileData::Sco(_) => self.acquire_sco().await,
            // RFCOMM descriptors are handed over by the daemon.
            ProfileData::Rfcomm(_) => Err(Error::new(ErrorKind::NotSupported)),
        }
    }

    /// Releases the Bluetooth resource backing this transport.
    ///
    /// A no-op when nothing is acquired. Releasing an RFCOMM transport
    /// retires the whole transport, see [Transport::destroy].
    pub async fn release(&self) -> Result<()> {
        match &self.data {
            ProfileData::A2dp(_) => self.release_a2dp().await,
            ProfileData::Sco(_) => self.release_sco().await,
            ProfileData::Rfcomm(_) => self.release_rfcomm().await,
        }
    }

    async fn acquire_a2dp(&self) -> Result<()> {
        let state = {
            let inner = self.inner.lock().unwrap();
            if inner.bt.is_some() {
                // keep-alive mode
                log::debug!("Reusing transport: {}", self.dbus_path);
                return Ok(());
            }
            inner.state
        };

        let connection =
            self.env.connection().cloned().ok_or_else(|| Error::new(ErrorKind::NotAvailable))?;
        let method = if state == State::Pending { "TryAcquire" } else { "Acquire" };
        let proxy = Proxy::new(self.dbus_owner.as_str(), self.dbus_path.as_str(), TIMEOUT, connection);
        let (fd, mtu_read, mtu_write): (arg::OwnedFd, u16, u16) = proxy
            .method_call(MEDIA_TRANSPORT_INTERFACE, method, ())
            .await
            .map_err(|err| {
                log::error!("Couldn't acquire transport: {}", err.message().unwrap_or_default());
                Error::from(err)
            })?;

        let bt = unsafe { OwnedFd::from_raw_fd(fd.into_fd()) };
        sock::set_nonblocking(&bt)?;

        // Decreasing the socket output buffer minimizes the audio delay and
        // increases responsiveness. A tripled write MTU still prevents
        // tearing under temporal heavy load.
        let sndbuf: libc::c_int = libc::c_int::from(mtu_write) * 3;
        if let Err(err) = sock::setsockopt(&bt, libc::SOL_SOCKET, libc::SO_SNDBUF, &sndbuf) {
            log::warn!("Couldn't set socket output buffer size: {}", err);
        }

        if let ProfileData::A2dp(a2dp) = &self.data {
            match sock::ioctl_read::<libc::c_int>(&bt, libc::TIOCOUTQ) {
                Ok(queued) => a2dp.coutq_init.store(queued, Ordering::Relaxed),
                Err(err) => log::warn!("Couldn't get socket queued bytes: {}", err),
            }
        }

        let mut inner = self.inner.lock().unwrap();
        inner.bt = Some(bt);
        inner.mtu_read = mtu_read;
        inner.mtu_write = mtu_write;
        log::debug!("New transport: {} (MTU: R:{} W:{})", self.dbus_path, mtu_read, mtu_write);
        Ok(())
    }

    async fn release_a2dp(&self) -> Result<()> {
        let state = {
            let inner = self.inner.lock().unwrap();
            // Releasing a transport that was never acquired, or that was
            // already released, would only produce an error reply.
            if inner.bt.is_none() {
                return Ok(());
            }
            inner.state
        };

        log::debug!("Releasing transport: {}", self.ttype);

        // When idle, the transport was either not acquired or the daemon has
        // already let go of it; an explicit release request may even be
        // answered with a "not authorized" error.
        if state != State::Idle && !self.dbus_owner.is_empty() {
            if let Some(connection) = self.env.connection().cloned() {
                let proxy =
                    Proxy::new(self.dbus_owner.as_str(), self.dbus_path.as_str(), TIMEOUT, connection);
                match proxy.method_call::<(), _, _, _>(MEDIA_TRANSPORT_INTERFACE, "Release", ()).await
                {
                    Ok(()) => {}
                    Err(err)
                        if matches!(
                            err.name(),
                            Some("org.freedesktop.DBus.Error.NoReply")
                                | Some("org.freedesktop.DBus.Error.ServiceUnknown")
                        ) =>
                    {
                        // The daemon is gone or going; nobody is left to answer.
                    }
                    Err(err) => {
                        log::error!(
                            "Couldn't release transport: {}",
                            err.message().unwrap_or_default()
                        );
                        return Err(err.into());
                    }
                }
            }
        }

        let bt = self.inner.lock().unwrap().bt.take();
        if bt.is_some() {
            log::debug!("Closing BT socket: {}", self.dbus_path);
        }
        Ok(())
    }

    async fn acquire_sco(&self) -> Result<()> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.bt.is_some() {
                return Ok(());
            }
        }

        let transparent = self.ttype.codec != Codec::Cvsd;
        let (bt, kernel_mtu) =
            sco::open_link(self.adapter_id, self.addr, transparent).await.map_err(|err| {
                log::error!("Couldn't open SCO link: {}", err);
                Error::from(err)
            })?;

        let mut inner = self.inner.lock().unwrap();
        log::debug!("New SCO link: {} (kernel MTU: {})", self.dbus_path, kernel_mtu);
        inner.mtu_read = sco::SCO_MTU_OVERRIDE;
        inner.mtu_write = sco::SCO_MTU_OVERRIDE;
        inner.bt = Some(bt);
        Ok(())
    }

    async fn release_sco(&self) -> Result<()> {
        let bt = self.inner.lock().unwrap().bt.take();
        if let Some(bt) = bt {
            log::debug!("Closing SCO: {}", self.dbus_path);
            let _ = sock::shutdown(&bt, libc::SHUT_RDWR);
        }
        Ok(())
    }

    async fn release_rfcomm(&self) -> Result<()> {
        let bt = match self.inner.lock().unwrap().bt.take() {
            Some(bt) => bt,
            None => return Ok(()),
        };
        log::debug!("Closing RFCOMM: {}", self.dbus_path);
        let _ = sock::shutdown(&bt, libc::SHUT_RDWR);
        drop(bt);

        // The daemon does not signal profile disconnection when the
        // Bluetooth link is lost, yet the path key must be free before the
        // device reconnects. Releasing the command channel therefore
        // retires the whole transport.
        self.destroy().await;
        Ok(())
    }

    /// Destroys the transport.
    ///
    /// Joins the IO worker, releases the Bluetooth resource, tears down the
    /// PCM endpoints, detaches the transport from its device and emits a
    /// removal event. Destroying an RFCOMM transport destroys its child SCO
    /// transport as well. Calling this a second time is a no-op.
    pub fn destroy(&self) -> BoxFuture<'static, ()> {
        let transport = self.arc();
        Box::pin(async move { transport.destroy_impl().await })
    }

    async fn destroy_impl(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == State::Limbo {
                return;
            }
            inner.state = State::Limbo;
        }
        log::debug!("Freeing transport: {}", self.ttype);

        // A worker left running here would keep using descriptors that are
        // about to be closed and reused.
        self.stop_worker().await;

        // if possible, try to release resources gracefully
        if let Err(err) = self.release().await {
            log::warn!("Couldn't release transport: {}", err);
        }
        drop(self.inner.lock().unwrap().bt.take());

        let device = self.device.upgrade();
        let mask = match &self.data {
            ProfileData::Rfcomm(rfcomm) => {
                // Everything the command parser learned about the peer dies
                // with its command channel.
                if let Some(device) = &device {
                    device.clear_peer_metadata();
                }
                let sco = rfcomm.sco.lock().unwrap().take();
                if let Some(sco) = sco {
                    sco.destroy().await;
                }
                None
            }
            ProfileData::Sco(sco) => {
                sco.spk_pcm.release();
                sco.mic_pcm.release();
                let parent = std::mem::take(&mut *sco.rfcomm.lock().unwrap());
                if let Some(parent) = parent.upgrade() {
                    if let ProfileData::Rfcomm(rfcomm) = &parent.data {
                        rfcomm.sco.lock().unwrap().take();
                    }
                }
                Some(PCM_TYPE_SCO | PCM_STREAM_PLAYBACK | PCM_STREAM_CAPTURE)
            }
            ProfileData::A2dp(a2dp) => {
                a2dp.pcm.release();
                let stream = if self.ttype.profile == Profile::A2dpSource {
                    PCM_STREAM_PLAYBACK
                } else {
                    PCM_STREAM_CAPTURE
                };
                Some(PCM_TYPE_A2DP | stream)
            }
        };

        // detach the transport from the device
        if let Some(device) = &device {
            device.remove_transport(&self.dbus_path);
        }

        if let Some(mask) = mask {
            self.env.ctl.emit(TransportEvent {
                kind: EventKind::TransportRemoved,
                addr: self.addr,
                mask,
            });
        }
    }

    /// Waits until the IO worker has played out everything a local client
    /// wrote to the playback PCM endpoint.
    ///
    /// Meaningful only for playback directions of an active transport; in
    /// all other cases this returns immediately. The wait includes the
    /// configured drain grace period, see
    /// [SessionConfig::drain_grace](crate::SessionConfig::drain_grace).
    pub async fn drain_pcm(&self) -> Result<()> {
        let drained = match (&self.data, self.ttype.profile) {
            (ProfileData::A2dp(a2dp), Profile::A2dpSource) => &a2dp.drained,
            (ProfileData::Sco(sco), Profile::HspAg | Profile::HfpAg) => &sco.spk_drained,
            _ => return Ok(()),
        };
        if self.state() != State::Active {
            return Ok(());
        }

        let acknowledged = drained.notified();
        tokio::pin!(acknowledged);
        acknowledged.as_mut().enable();

        self.send_signal(Signal::PcmSync)?;
        acknowledged.await;

        // There is no way to learn when the remote side played the last
        // buffered sample; give the in-flight audio some time before
        // declaring the stream drained.
        tokio::time::sleep(self.env.config.drain_grace).await;

        log::debug!("PCM drained: {}", self.dbus_path);
        Ok(())
    }

    fn spawn_worker(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.worker.is_some() {
            return Ok(());
        }

        let routine = match crate::io::dispatch(&self.ttype) {
            Some(routine) => routine,
            None => {
                log::warn!("Codec not supported: {}", self.ttype.codec);
                return Err(Error::new(ErrorKind::CodecUnsupported));
            }
        };

        let mut sig_rx = inner
            .sig_rx
            .take()
            .ok_or_else(|| Error::new(ErrorKind::Internal(InternalErrorKind::InvalidValue)))?;
        // Void signals addressed to a previous worker.
        while sig_rx.try_recv().is_ok() {}

        inner.worker = Some(tokio::spawn(crate::io::worker_main(self.arc(), routine, sig_rx)));
        log::debug!("Created new IO worker: {}", self.ttype);
        Ok(())
    }

    /// Cancels the IO worker cooperatively and joins it.
    ///
    /// A worker tearing itself down finds the handle slot already empty and
    /// never joins itself.
    async fn stop_worker(&self) {
        let worker = self.inner.lock().unwrap().worker.take();
        if let Some(worker) = worker {
            let _ = self.sig_tx.send(Signal::Terminate);
            if let Err(err) = worker.await {
                log::warn!("Couldn't join IO worker: {}", err);
            }
        }
    }

    /// Returns the signal receiver and resets the worker slot. Called by
    /// the worker itself right before it runs the release dispatch.
    pub(crate) fn worker_detach(&self, sig_rx: mpsc::UnboundedReceiver<Signal>) {
        let mut inner = self.inner.lock().unwrap();
        inner.worker = None;
        inner.sig_rx = Some(sig_rx);
        // A worker-initiated exit leaves an active transport; the state
        // machine observes the death as a fallback to idle.
        if matches!(inner.state, State::Active | State::Paused) {
            inner.state = State::Idle;
        }
    }

    pub(crate) fn env(&self) -> &Arc<SessionInner> {
        &self.env
    }

    /// Strong reference to self; valid for the whole lifetime of the
    /// transport since the device map releases its reference only through
    /// the destructor.
    fn arc(&self) -> Arc<Self> {
        self.me.upgrade().expect("transport dropped")
    }

    pub(crate) fn dup_bt_socket(&self) -> Result<OwnedFd> {
        let inner = self.inner.lock().unwrap();
        match &inner.bt {
            Some(bt) => Ok(sock::dup(bt)?),
            None => Err(Error::new(ErrorKind::NotAcquired)),
        }
    }

    pub(crate) fn a2dp_data(&self) -> Option<&A2dpData> {
        match &self.data {
            ProfileData::A2dp(a2dp) => Some(a2dp),
            _ => None,
        }
    }

    pub(crate) fn sco_data(&self) -> Option<&ScoData> {
        match &self.data {
            ProfileData::Sco(sco) => Some(sco),
            _ => None,
        }
    }

    /// Acknowledges a drain request.
    pub(crate) fn notify_drained(&self) {
        match &self.data {
            ProfileData::A2dp(a2dp) => a2dp.drained.notify_waiters(),
            ProfileData::Sco(sco) => sco.spk_drained.notify_waiters(),
            ProfileData::Rfcomm(_) => {}
        }
    }

    fn emit_event(&self, kind: EventKind) {
        let mask = match &self.data {
            ProfileData::Rfcomm(_) => return,
            ProfileData::Sco(_) => PCM_TYPE_SCO | PCM_STREAM_PLAYBACK | PCM_STREAM_CAPTURE,
            ProfileData::A2dp(_) => {
                PCM_TYPE_A2DP
                    | if self.ttype.profile == Profile::A2dpSource {
                        PCM_STREAM_PLAYBACK
                    } else {
                        PCM_STREAM_CAPTURE
                    }
            }
        };
        self.env.ctl.emit(TransportEvent { kind, addr: self.addr, mask });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_wire_roundtrip() {
        let mut command = [0u8; RFCOMM_COMMAND_LEN];
        command[..8].copy_from_slice(b"AT+VGS=7");
        let signals =
            [Signal::PcmOpen, Signal::PcmSync, Signal::RfcommSend(command), Signal::Terminate];

        let mut wire = Vec::new();
        for signal in &signals {
            signal.encode(&mut wire);
        }

        let mut decoded = Vec::new();
        let mut rest = &wire[..];
        while let Some((signal, consumed)) = Signal::parse(rest) {
            decoded.push(signal);
            rest = &rest[consumed..];
        }
        assert_eq!(decoded, signals);
        assert!(rest.is_empty());
    }

    #[test]
    fn signal_parse_rejects_garbage() {
        assert_eq!(Signal::parse(&[]), None);
        assert_eq!(Signal::parse(&[0xfe]), None);
        // truncated RFCOMM command
        assert_eq!(Signal::parse(&[0x06, 0x41]), None);
    }

    #[test]
    fn transport_type_display() {
        let ttype = TransportType::new(Profile::A2dpSource, Codec::Sbc);
        assert_eq!(ttype.to_string(), "A2DP Source (SBC)");
        let rfcomm = TransportType { rfcomm: true, ..TransportType::new(Profile::HfpAg, Codec::Cvsd) };
        assert_eq!(rfcomm.to_string(), "RFCOMM (HFP Audio Gateway)");
    }

    #[test]
    fn profile_uuids() {
        assert_eq!(Profile::A2dpSource.uuid().to_string(), "0000110a-0000-1000-8000-00805f9b34fb");
        assert_eq!(Profile::HfpHf.uuid().to_string(), "0000111e-0000-1000-8000-00805f9b34fb");
    }
}
