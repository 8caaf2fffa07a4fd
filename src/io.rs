//! Transport IO workers.
//!
//! Every active transport is served by exactly one worker task. A worker is
//! the sole user of its Bluetooth socket duplicate, its signal receiver and
//! its open PCM pipe handles; every await point doubles as a cancellation
//! point and [Signal::Terminate] shuts the loop down cooperatively. On exit
//! the worker detaches itself from the transport and runs the release
//! dispatch.
//!
//! Codec DSP is not performed here; the routines move MTU-shaped frames
//! between the PCM pipes and the socket, one named routine per supported
//! (profile, codec) combination.

use std::{os::fd::OwnedFd, sync::Arc};
use tokio::{
    io::{unix::AsyncFd, AsyncReadExt, AsyncWriteExt},
    net::unix::pipe,
    sync::mpsc,
};

use crate::{
    at::{self, AtCommand},
    codec::Codec,
    device::Device,
    sock,
    transport::{Profile, Signal, Transport, TransportType},
    Error, ErrorKind, Result,
};

/// IO routine selected for a transport.
pub(crate) enum Routine {
    Rfcomm,
    Sco,
    A2dpSource(Codec),
    A2dpSink(Codec),
}

impl Routine {
    /// Worker name, for observability.
    pub fn name(&self) -> &'static str {
        match self {
            Routine::Rfcomm => "rfcomm",
            Routine::Sco => "sco-io",
            Routine::A2dpSource(Codec::Sbc) => "a2dp-source-sbc",
            Routine::A2dpSource(Codec::Aac) => "a2dp-source-aac",
            Routine::A2dpSource(Codec::AptX) => "a2dp-source-aptx",
            Routine::A2dpSource(Codec::Ldac) => "a2dp-source-ldac",
            Routine::A2dpSource(_) => "a2dp-source",
            Routine::A2dpSink(Codec::Sbc) => "a2dp-sink-sbc",
            Routine::A2dpSink(Codec::Aac) => "a2dp-sink-aac",
            Routine::A2dpSink(_) => "a2dp-sink",
        }
    }
}

/// Chooses the IO routine for a transport type.
///
/// Returns [None] for combinations without a routine; the MPEG-1/2 slot is
/// present in the codec table but no stream routine is wired up for it.
pub(crate) fn dispatch(ttype: &TransportType) -> Option<Routine> {
    if ttype.rfcomm {
        return Some(Routine::Rfcomm);
    }
    match ttype.profile {
        Profile::HspHs | Profile::HspAg | Profile::HfpHf | Profile::HfpAg => Some(Routine::Sco),
        Profile::A2dpSource => match ttype.codec {
            Codec::Sbc | Codec::Aac | Codec::AptX | Codec::Ldac => {
                Some(Routine::A2dpSource(ttype.codec))
            }
            _ => None,
        },
        Profile::A2dpSink => match ttype.codec {
            Codec::Sbc | Codec::Aac => Some(Routine::A2dpSink(ttype.codec)),
            _ => None,
        },
    }
}

/// Worker task body: runs the routine, then detaches and releases.
pub(crate) async fn worker_main(
    transport: Arc<Transport>, routine: Routine, mut sig_rx: mpsc::UnboundedReceiver<Signal>,
) {
    let name = routine.name();
    log::debug!("IO worker {} starting: {}", name, transport.dbus_path());

    let result = match routine {
        Routine::Rfcomm => rfcomm_worker(&transport, &mut sig_rx).await,
        Routine::Sco => sco_worker(&transport, &mut sig_rx).await,
        Routine::A2dpSource(_) => a2dp_source_worker(&transport, &mut sig_rx).await,
        Routine::A2dpSink(_) => a2dp_sink_worker(&transport, &mut sig_rx).await,
    };
    if let Err(err) = result {
        log::warn!("IO worker {} failed: {}", name, err);
    }

    // Detach before the release dispatch: releasing an RFCOMM transport
    // retires the whole transport, which must not try to join this worker.
    transport.worker_detach(sig_rx);
    if let Err(err) = transport.release().await {
        log::warn!("Couldn't release transport: {}", err);
    }
    log::debug!("Exiting IO worker {}: {}", name, transport.dbus_path());
}

/// Async wrapper around a duplicated Bluetooth socket descriptor.
pub(crate) struct BtSocket {
    fd: AsyncFd<OwnedFd>,
}

impl BtSocket {
    pub fn new(fd: OwnedFd) -> std::io::Result<Self> {
        Ok(Self { fd: AsyncFd::new(fd)? })
    }

    pub async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| sock::read(inner.get_ref(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| sock::write(inner.get_ref(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> std::io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf).await? {
                0 => return Err(std::io::ErrorKind::WriteZero.into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }
}

fn write_chunk_size(transport: &Transport) -> usize {
    match transport.mtu().1 {
        0 => 1024,
        mtu => mtu as usize,
    }
}

fn read_buf_size(transport: &Transport) -> usize {
    match transport.mtu().0 {
        0 => 1024,
        mtu => mtu as usize,
    }
}

/// A2DP source: encoder side. PCM frames read from the local client are
/// framed to the write MTU and pushed into the media socket.
async fn a2dp_source_worker(
    transport: &Arc<Transport>, sig_rx: &mut mpsc::UnboundedReceiver<Signal>,
) -> Result<()> {
    let a2dp = transport.a2dp_data().ok_or_else(|| Error::new(ErrorKind::NotSupported))?;
    let bt = BtSocket::new(transport.dup_bt_socket()?)?;
    let chunk = write_chunk_size(transport);
    log::trace!(
        "Initial socket queue occupancy: {}",
        a2dp.coutq_init.load(std::sync::atomic::Ordering::Relaxed)
    );

    let mut pcm_rx: Option<pipe::Receiver> = None;
    let mut paused = false;
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            sig = sig_rx.recv() => match sig {
                None | Some(Signal::Terminate) => break,
                Some(Signal::PcmOpen) => {
                    if pcm_rx.is_none() {
                        match a2dp.pcm.open_rx() {
                            Ok(rx) => pcm_rx = Some(rx),
                            Err(err) => log::warn!("Couldn't open PCM FIFO: {}", err),
                        }
                    }
                }
                Some(Signal::PcmClose) => {
                    pcm_rx = None;
                    a2dp.pcm.disconnect_client();
                }
                Some(Signal::PcmPause) => paused = true,
                Some(Signal::PcmResume) => paused = false,
                Some(Signal::PcmSync) => {
                    // Frames are forwarded as soon as they are read, so
                    // nothing is pending on the encoder side by the time
                    // this signal is handled.
                    transport.notify_drained();
                }
                Some(Signal::RfcommSend(_)) => {}
            },
            result = async { pcm_rx.as_mut().unwrap().read(&mut buf).await },
                if pcm_rx.is_some() && !paused =>
            {
                match result {
                    Ok(0) => {
                        log::debug!("PCM client disconnected: {}", transport.dbus_path());
                        pcm_rx = None;
                        a2dp.pcm.disconnect_client();
                    }
                    Ok(n) => {
                        for frame in buf[..n].chunks(chunk) {
                            bt.write_all(frame).await?;
                        }
                    }
                    Err(err) => {
                        log::warn!("PCM read error: {}", err);
                        pcm_rx = None;
                        a2dp.pcm.disconnect_client();
                    }
                }
            },
        }
    }
    Ok(())
}

/// A2DP sink: decoder side. Media frames read from the socket are handed to
/// the local client. The socket is always drained, even with no client.
async fn a2dp_sink_worker(
    transport: &Arc<Transport>, sig_rx: &mut mpsc::UnboundedReceiver<Signal>,
) -> Result<()> {
    let a2dp = transport.a2dp_data().ok_or_else(|| Error::new(ErrorKind::NotSupported))?;
    let bt = BtSocket::new(transport.dup_bt_socket()?)?;

    let mut pcm_tx: Option<pipe::Sender> = None;
    let mut paused = false;
    let mut buf = vec![0u8; read_buf_size(transport)];

    loop {
        tokio::select! {
            sig = sig_rx.recv() => match sig {
                None | Some(Signal::Terminate) => break,
                Some(Signal::PcmOpen) => {
                    if pcm_tx.is_none() {
                        match a2dp.pcm.open_tx() {
                            Ok(tx) => pcm_tx = Some(tx),
                            Err(err) if err.raw_os_error() == Some(libc::ENXIO) => {
                                // no reading client yet; retried on the next
                                // open request
                                log::trace!("PCM FIFO has no reader yet: {}", transport.dbus_path());
                            }
                            Err(err) => log::warn!("Couldn't open PCM FIFO: {}", err),
                        }
                    }
                }
                Some(Signal::PcmClose) => {
                    pcm_tx = None;
                    a2dp.pcm.disconnect_client();
                }
                Some(Signal::PcmPause) => paused = true,
                Some(Signal::PcmResume) => paused = false,
                Some(Signal::PcmSync) => transport.notify_drained(),
                Some(Signal::RfcommSend(_)) => {}
            },
            result = bt.read(&mut buf) => match result {
                Ok(0) => return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()),
                Ok(n) => {
                    if paused {
                        continue;
                    }
                    if let Some(tx) = &mut pcm_tx {
                        if let Err(err) = tx.write_all(&buf[..n]).await {
                            log::debug!("PCM client disconnected: {}", err);
                            pcm_tx = None;
                            a2dp.pcm.disconnect_client();
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            },
        }
    }
    Ok(())
}

/// SCO duplex IO: speaker PCM data goes out over the voice link, incoming
/// voice frames are handed to the microphone PCM client. The link itself is
/// established lazily on the first client.
async fn sco_worker(
    transport: &Arc<Transport>, sig_rx: &mut mpsc::UnboundedReceiver<Signal>,
) -> Result<()> {
    let sco = transport.sco_data().ok_or_else(|| Error::new(ErrorKind::NotSupported))?;
    let mut bt = match transport.dup_bt_socket() {
        Ok(fd) => Some(BtSocket::new(fd)?),
        Err(_) => None,
    };

    let mut spk_rx: Option<pipe::Receiver> = None;
    let mut mic_tx: Option<pipe::Sender> = None;
    let mut paused = false;
    let mut spk_buf = vec![0u8; 8192];
    let mut mic_buf = vec![0u8; 1024];

    loop {
        tokio::select! {
            sig = sig_rx.recv() => match sig {
                None | Some(Signal::Terminate) => break,
                Some(Signal::PcmOpen) => {
                    if bt.is_none() {
                        match transport.acquire().await {
                            Ok(()) => bt = Some(BtSocket::new(transport.dup_bt_socket()?)?),
                            Err(err) => log::warn!("Couldn't acquire SCO link: {}", err),
                        }
                    }
                    if spk_rx.is_none() && sco.spk_pcm.client().is_some() {
                        spk_rx = sco.spk_pcm.open_rx().map_err(|err| {
                            log::warn!("Couldn't open speaker FIFO: {}", err);
                        }).ok();
                    }
                    if mic_tx.is_none() && sco.mic_pcm.client().is_some() {
                        // fails until the capture client opened its end
                        mic_tx = sco.mic_pcm.open_tx().ok();
                    }
                }
                Some(Signal::PcmClose) => {
                    spk_rx = None;
                    mic_tx = None;
                    sco.spk_pcm.disconnect_client();
                    sco.mic_pcm.disconnect_client();
                }
                Some(Signal::PcmPause) => paused = true,
                Some(Signal::PcmResume) => paused = false,
                Some(Signal::PcmSync) => transport.notify_drained(),
                Some(Signal::RfcommSend(_)) => {}
            },
            result = async { spk_rx.as_mut().unwrap().read(&mut spk_buf).await },
                if spk_rx.is_some() && bt.is_some() && !paused =>
            {
                match result {
                    Ok(0) => {
                        log::debug!("Speaker PCM client disconnected: {}", transport.dbus_path());
                        spk_rx = None;
                        sco.spk_pcm.disconnect_client();
                    }
                    Ok(n) => {
                        let link = bt.as_ref().unwrap();
                        let chunk = write_chunk_size(transport);
                        for frame in spk_buf[..n].chunks(chunk) {
                            link.write_all(frame).await?;
                        }
                    }
                    Err(err) => {
                        log::warn!("Speaker PCM read error: {}", err);
                        spk_rx = None;
                        sco.spk_pcm.disconnect_client();
                    }
                }
            },
            result = async { bt.as_ref().unwrap().read(&mut mic_buf).await }, if bt.is_some() => {
                match result {
                    Ok(0) => return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()),
                    Ok(n) => {
                        if paused {
                            continue;
                        }
                        if let Some(tx) = &mut mic_tx {
                            if let Err(err) = tx.write_all(&mic_buf[..n]).await {
                                log::debug!("Microphone PCM client disconnected: {}", err);
                                mic_tx = None;
                                sco.mic_pcm.disconnect_client();
                            }
                        }
                    }
                    Err(err) => return Err(err.into()),
                }
            },
        }
    }
    Ok(())
}

/// RFCOMM AT command channel of the HSP/HFP audio gateway role.
async fn rfcomm_worker(
    transport: &Arc<Transport>, sig_rx: &mut mpsc::UnboundedReceiver<Signal>,
) -> Result<()> {
    // the command channel descriptor is handed over by the daemon
    let bt = BtSocket::new(transport.dup_bt_socket()?)?;
    let device = transport.device();
    let sco = transport.rfcomm_sco();

    let mut line = Vec::new();
    let mut buf = [0u8; 256];

    loop {
        tokio::select! {
            sig = sig_rx.recv() => match sig {
                None | Some(Signal::Terminate) => break,
                Some(Signal::RfcommSend(command)) => {
                    let len = command.iter().position(|&b| b == 0).unwrap_or(command.len());
                    bt.write_all(&command[..len]).await?;
                }
                Some(_) => {}
            },
            result = bt.read(&mut buf) => match result {
                // a lost link surfaces as EOF; the cleanup release retires
                // the transport
                Ok(0) => return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()),
                Ok(n) => {
                    line.extend_from_slice(&buf[..n]);
                    while let Some(pos) = line.iter().position(|&b| b == b'\r') {
                        let raw: Vec<u8> = line.drain(..=pos).collect();
                        let text = String::from_utf8_lossy(&raw[..pos]).into_owned();
                        handle_at_command(transport, &device, &sco, &bt, text.trim()).await?;
                    }
                }
                Err(err) => return Err(err.into()),
            },
        }
    }
    Ok(())
}

async fn handle_at_command(
    transport: &Arc<Transport>, device: &Option<Arc<Device>>, sco: &Option<Arc<Transport>>,
    bt: &BtSocket, line: &str,
) -> Result<()> {
    if line.is_empty() {
        return Ok(());
    }
    log::debug!("RFCOMM command from {}: {}", transport.addr(), line);

    let command = match at::parse(line) {
        Some(command) => command,
        None => {
            log::warn!("Unsupported AT command: {}", line);
            bt.write_all(at::frame_response("ERROR").as_bytes()).await?;
            return Ok(());
        }
    };

    match &command {
        AtCommand::SpeakerGain(gain) => {
            if let Some(sco) = sco {
                sco.set_sco_spk_gain(*gain);
            }
        }
        AtCommand::MicGain(gain) => {
            if let Some(sco) = sco {
                sco.set_sco_mic_gain(*gain);
            }
        }
        AtCommand::KeyPress(_) | AtCommand::EventReporting => {}
        AtCommand::SupportedFeatures(features) => {
            log::debug!("HF features of {}: {:#x}", transport.addr(), features);
            bt.write_all(at::frame_response(&format!("+BRSF: {}", at::AG_FEATURES)).as_bytes())
                .await?;
        }
        AtCommand::IndicatorsTest => {
            bt.write_all(at::frame_response(at::CIND_RESPONSE).as_bytes()).await?;
        }
        AtCommand::IndicatorsStatus => {
            bt.write_all(at::frame_response(at::CIND_STATUS_RESPONSE).as_bytes()).await?;
        }
        AtCommand::Accessory { battery } => {
            if let (Some(device), Some(level)) = (device, battery) {
                device.set_battery(*level);
            }
        }
        AtCommand::Xapl(info) => {
            if let Some(device) = device {
                device.set_xapl(*info);
            }
            bt.write_all(at::frame_response("+XAPL=BluePCM,0").as_bytes()).await?;
        }
    }

    bt.write_all(at::frame_response("OK").as_bytes()).await?;
    Ok(())
}
