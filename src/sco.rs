//! SCO voice links.

use libc::{AF_BLUETOOTH, EAGAIN, EINPROGRESS, SOCK_SEQPACKET, SOL_SOCKET, SO_ERROR};
use std::{
    io::{Error, ErrorKind, Result},
    os::fd::OwnedFd,
};
use tokio::io::unix::AsyncFd;

use crate::{
    sock::{self, SysSockAddr},
    sys, Address,
};

/// Read and write MTU applied to every SCO link.
///
/// The MTU values reported by the HCI interface are incorrect, or our
/// interpretation of them is; 48-byte frames are what actually works. The
/// kernel-reported value is still logged for diagnosis.
pub(crate) const SCO_MTU_OVERRIDE: u16 = 48;

/// An SCO socket address.
struct SocketAddr {
    addr: Address,
}

impl SysSockAddr for SocketAddr {
    type SysSockAddr = sys::sockaddr_sco;

    fn into_sys_sock_addr(self) -> Self::SysSockAddr {
        sys::sockaddr_sco { sco_family: AF_BLUETOOTH as _, sco_bdaddr: self.addr.into() }
    }

    fn try_from_sys_sock_addr(saddr: Self::SysSockAddr) -> Result<Self> {
        if saddr.sco_family != AF_BLUETOOTH as _ {
            return Err(Error::new(ErrorKind::InvalidInput, "sockaddr_sco::sco_family is not AF_BLUETOOTH"));
        }
        Ok(Self { addr: Address::from(saddr.sco_bdaddr) })
    }
}

/// Queries the kernel for information about the given controller.
pub(crate) fn dev_info(dev_id: u16) -> Result<sys::hci_dev_info> {
    let hci = sock::socket(AF_BLUETOOTH, libc::SOCK_RAW, sys::BTPROTO_HCI)?;
    let mut di = sys::hci_dev_info::request(dev_id);
    sock::ioctl_inout(&hci, sys::HCIGETDEVINFO, &mut di)?;
    Ok(di)
}

/// Opens an SCO link from the given controller to the peer.
///
/// A codec other than CVSD requires the transparent (wideband) voice
/// setting. Returns the connected socket and the kernel-reported SCO MTU.
pub(crate) async fn open_link(dev_id: u16, peer: Address, transparent: bool) -> Result<(OwnedFd, u16)> {
    let di = dev_info(dev_id)?;

    let fd = sock::socket(AF_BLUETOOTH, SOCK_SEQPACKET, sys::BTPROTO_SCO)?;
    sock::bind(&fd, SocketAddr { addr: Address::from(di.bdaddr) })?;

    if transparent {
        let voice = sys::bt_voice { setting: sys::BT_VOICE_TRANSPARENT };
        sock::setsockopt(&fd, sys::SOL_BLUETOOTH, sys::BT_VOICE, &voice)?;
    }

    let fd = AsyncFd::new(fd)?;
    match sock::connect(fd.get_ref(), SocketAddr { addr: peer }) {
        Ok(()) => {}
        Err(err) if err.raw_os_error() == Some(EINPROGRESS) || err.raw_os_error() == Some(EAGAIN) => {
            loop {
                let mut guard = fd.writable().await?;
                match guard.try_io(|inner| {
                    let err: libc::c_int = sock::getsockopt(inner.get_ref(), SOL_SOCKET, SO_ERROR)?;
                    match err {
                        0 => Ok(()),
                        EINPROGRESS | EAGAIN => Err(ErrorKind::WouldBlock.into()),
                        _ => Err(Error::from_raw_os_error(err)),
                    }
                }) {
                    Ok(result) => break result,
                    Err(_would_block) => continue,
                }
            }?;
        }
        Err(err) => return Err(err),
    }

    Ok((fd.into_inner(), di.sco_mtu))
}
