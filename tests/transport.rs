//! Transport lifecycle tests against an emulated Bluetooth link.
//!
//! These tests run an offline session: instead of acquiring media sockets
//! from the Bluetooth daemon, one end of a Unix socket pair is attached to
//! the transport, the way the daemon would hand over a descriptor.

use bluepcm::{
    Codec, EventKind, Profile, Session, SessionConfig, State, Transport, TransportEvent,
    TransportType, PCM_STREAM_CAPTURE, PCM_STREAM_PLAYBACK, PCM_TYPE_A2DP, PCM_TYPE_SCO,
};
use futures::{Stream, StreamExt};
use std::{
    os::fd::OwnedFd,
    os::unix::net::UnixStream,
    time::{Duration, Instant},
};
use tokio::time::timeout;

// SBC: 44.1 kHz, joint stereo, block length 16, 8 subbands, loudness
// allocation, bitpool 2..53.
const SBC_CAPS_JOINT_44100: [u8; 4] = [0x21, 0x15, 2, 53];

// AAC: MPEG-2 LC, 48 kHz, two channels.
const AAC_CAPS_STEREO_48000: [u8; 6] = [0x80, 0x00, 0x84, 0x00, 0x00, 0x00];

fn session() -> Session {
    let _ = env_logger::builder().is_test(true).try_init();
    let runtime_dir = std::env::temp_dir()
        .join(format!("bluepcm-it-{}-{:08x}", std::process::id(), rand::random::<u32>()));
    Session::offline(SessionConfig { runtime_dir, ..SessionConfig::default() })
}

/// An emulated Bluetooth link: the near end is attached to a transport, the
/// far end plays the remote device.
fn link() -> (OwnedFd, UnixStream) {
    let (near, far) = UnixStream::pair().unwrap();
    (OwnedFd::from(near), far)
}

async fn next_event(events: &mut (impl Stream<Item = TransportEvent> + Unpin)) -> TransportEvent {
    timeout(Duration::from_secs(1), events.next()).await.expect("no event").expect("event stream ended")
}

async fn assert_no_event(events: &mut (impl Stream<Item = TransportEvent> + Unpin)) {
    assert!(
        timeout(Duration::from_millis(100), events.next()).await.is_err(),
        "unexpected extra event"
    );
}

#[tokio::test]
async fn a2dp_source_sbc_lifecycle() {
    let session = session();
    let mut events = session.transport_events();
    let device = session.adapter(0).device("12:34:56:78:9A:BC".parse().unwrap());

    let transport = Transport::new_a2dp(
        &device,
        TransportType::new(Profile::A2dpSource, Codec::Sbc),
        ":test",
        "/source",
        &SBC_CAPS_JOINT_44100,
    );
    assert_eq!(transport.channels(), 2);
    assert_eq!(transport.sample_rate(), 44100);
    assert_eq!(device.transports().len(), 1);
    assert!(device.transport("/source").is_some());

    let added = next_event(&mut events).await;
    assert_eq!(added.kind, EventKind::TransportAdded);
    assert_eq!(added.addr, device.addr());
    assert_eq!(added.mask, PCM_TYPE_A2DP | PCM_STREAM_PLAYBACK);

    transport.destroy().await;
    assert!(device.transports().is_empty());
    assert!(device.transport("/source").is_none());

    let removed = next_event(&mut events).await;
    assert_eq!(removed.kind, EventKind::TransportRemoved);
    assert_eq!(removed.mask, PCM_TYPE_A2DP | PCM_STREAM_PLAYBACK);
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn a2dp_sink_guard_acquire_and_worker_join() {
    let session = session();
    let device = session.adapter(0).device("12:34:56:78:9A:BC".parse().unwrap());

    let transport = Transport::new_a2dp(
        &device,
        TransportType::new(Profile::A2dpSink, Codec::Aac),
        ":test",
        "/sink",
        &AAC_CAPS_STEREO_48000,
    );
    assert_eq!(transport.channels(), 2);
    assert_eq!(transport.sample_rate(), 48000);

    // An idle sink must pass through PENDING first; ACTIVE is a no-op.
    transport.set_state(State::Active).await.unwrap();
    assert_eq!(transport.state(), State::Idle);
    assert!(!transport.is_running());

    // Transitioning to the current state is a no-op.
    transport.set_state(State::Idle).await.unwrap();
    assert_eq!(transport.state(), State::Idle);

    let (near, _far) = link();
    transport.attach_bt_socket(near, 672, 672).unwrap();

    // PENDING triggers acquisition, which reuses the attached socket.
    transport.set_state(State::Pending).await.unwrap();
    assert_eq!(transport.state(), State::Pending);
    assert!(transport.is_acquired());

    transport.set_state(State::Active).await.unwrap();
    assert_eq!(transport.state(), State::Active);
    assert!(transport.is_running());

    // Going back to IDLE joins the worker within bounded time.
    timeout(Duration::from_secs(1), transport.set_state(State::Idle)).await.unwrap().unwrap();
    assert_eq!(transport.state(), State::Idle);
    assert!(!transport.is_running());

    transport.destroy().await;
}

#[tokio::test]
async fn sco_wideband_and_hsp_codec_forcing() {
    let session = session();
    let device = session.adapter(0).device("12:34:56:78:9A:BC".parse().unwrap());

    let hfp = Transport::new_sco(
        &device,
        TransportType::new(Profile::HfpAg, Codec::Msbc),
        ":test",
        "/hfp",
    );
    assert_eq!(hfp.channels(), 1);
    assert_eq!(hfp.sample_rate(), 16000);

    // HSP knows nothing but CVSD, whatever was asked for.
    let hsp = Transport::new_sco(
        &device,
        TransportType::new(Profile::HspAg, Codec::Msbc),
        ":test",
        "/hsp",
    );
    assert_eq!(hsp.ttype().codec, Codec::Cvsd);
    assert_eq!(hsp.channels(), 1);
    assert_eq!(hsp.sample_rate(), 8000);

    hfp.destroy().await;
    hsp.destroy().await;
    assert!(device.transports().is_empty());
}

#[tokio::test]
async fn rfcomm_creates_and_destroys_sco_child() {
    let session = session();
    let mut events = session.transport_events();
    let device = session.adapter(0).device("12:34:56:78:9A:BC".parse().unwrap());

    let rfcomm = Transport::new_rfcomm(
        &device,
        TransportType::new(Profile::HfpAg, Codec::Undefined),
        ":test",
        "/foo",
    );
    assert!(rfcomm.ttype().rfcomm);

    let sco = rfcomm.rfcomm_sco().expect("no SCO child");
    assert_eq!(sco.dbus_path(), "/foo/sco");
    assert_eq!(device.transports().len(), 2);
    assert!(device.transport("/foo").is_some());
    assert!(device.transport("/foo/sco").is_some());

    // The RFCOMM transport is silent; only its SCO child announces itself.
    let added = next_event(&mut events).await;
    assert_eq!(added.kind, EventKind::TransportAdded);
    assert_eq!(added.mask, PCM_TYPE_SCO | PCM_STREAM_PLAYBACK | PCM_STREAM_CAPTURE);
    assert_no_event(&mut events).await;

    rfcomm.destroy().await;
    assert!(device.transports().is_empty());
    assert_eq!(sco.state(), State::Limbo);

    let removed = next_event(&mut events).await;
    assert_eq!(removed.kind, EventKind::TransportRemoved);
    assert_eq!(removed.mask, PCM_TYPE_SCO | PCM_STREAM_PLAYBACK | PCM_STREAM_CAPTURE);
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn double_destroy_is_a_noop() {
    let session = session();
    let mut events = session.transport_events();
    let device = session.adapter(0).device("12:34:56:78:9A:BC".parse().unwrap());

    let transport = Transport::new_a2dp(
        &device,
        TransportType::new(Profile::A2dpSource, Codec::Sbc),
        ":test",
        "/source",
        &SBC_CAPS_JOINT_44100,
    );
    let _ = next_event(&mut events).await;

    transport.destroy().await;
    assert_eq!(transport.state(), State::Limbo);
    transport.destroy().await;

    assert!(device.transports().is_empty());
    let removed = next_event(&mut events).await;
    assert_eq!(removed.kind, EventKind::TransportRemoved);
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn drain_waits_for_worker_ack_and_grace_period() {
    let session = session();
    let device = session.adapter(0).device("12:34:56:78:9A:BC".parse().unwrap());

    let transport = Transport::new_a2dp(
        &device,
        TransportType::new(Profile::A2dpSource, Codec::Sbc),
        ":test",
        "/source",
        &SBC_CAPS_JOINT_44100,
    );

    let (near, _far) = link();
    transport.attach_bt_socket(near, 672, 672).unwrap();
    transport.set_state(State::Active).await.unwrap();
    assert!(transport.is_running());

    let start = Instant::now();
    timeout(Duration::from_secs(2), transport.drain_pcm()).await.unwrap().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(200), "drain returned before the grace period");

    transport.destroy().await;
}

#[tokio::test]
async fn drain_is_a_noop_when_not_active() {
    let session = session();
    let device = session.adapter(0).device("12:34:56:78:9A:BC".parse().unwrap());

    let transport = Transport::new_a2dp(
        &device,
        TransportType::new(Profile::A2dpSource, Codec::Sbc),
        ":test",
        "/source",
        &SBC_CAPS_JOINT_44100,
    );

    // No worker is running; a drain must not block.
    timeout(Duration::from_millis(100), transport.drain_pcm()).await.unwrap().unwrap();
    transport.destroy().await;
}

#[tokio::test]
async fn worker_survives_pcm_signals_and_volume_is_clamped() {
    let session = session();
    let device = session.adapter(0).device("12:34:56:78:9A:BC".parse().unwrap());

    let transport = Transport::new_a2dp(
        &device,
        TransportType::new(Profile::A2dpSource, Codec::Sbc),
        ":test",
        "/source",
        &SBC_CAPS_JOINT_44100,
    );
    assert_eq!(transport.a2dp_volume(), Some((127, 127)));
    transport.set_a2dp_volume(200, 64);
    assert_eq!(transport.a2dp_volume(), Some((127, 64)));

    let (near, _far) = link();
    transport.attach_bt_socket(near, 672, 672).unwrap();
    transport.set_state(State::Active).await.unwrap();

    transport.send_signal(bluepcm::Signal::PcmPause).unwrap();
    transport.send_signal(bluepcm::Signal::PcmResume).unwrap();
    timeout(Duration::from_secs(2), transport.drain_pcm()).await.unwrap().unwrap();
    assert!(transport.is_running());

    transport.destroy().await;
    assert!(!transport.is_running());
}
