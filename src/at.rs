//! AT commands exchanged over the RFCOMM channel of HSP/HFP profiles.
//!
//! Only the subset handled by the audio gateway role is modeled here.
//! Unknown commands parse to [None] and are answered with `ERROR`.

use crate::device::XaplInfo;

/// A parsed AT command from the remote headset or hands-free unit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum AtCommand {
    /// `AT+VGS=` speaker gain update (0-15).
    SpeakerGain(u8),
    /// `AT+VGM=` microphone gain update (0-15).
    MicGain(u8),
    /// `AT+CKPD=` headset button press (HSP).
    KeyPress(u16),
    /// `AT+BRSF=` hands-free supported features (HFP handshake).
    SupportedFeatures(u32),
    /// `AT+CIND=?` indicator test.
    IndicatorsTest,
    /// `AT+CIND?` indicator status read.
    IndicatorsStatus,
    /// `AT+CMER=` indicator event reporting setup.
    EventReporting,
    /// `AT+IPHONEACCEV=` accessory state report; battery level in percent.
    Accessory { battery: Option<u8> },
    /// `AT+XAPL=` vendor feature negotiation.
    Xapl(XaplInfo),
}

/// Indicator list reported on `AT+CIND=?`.
pub(crate) const CIND_RESPONSE: &str =
    "+CIND: (\"call\",(0,1)),(\"callsetup\",(0-3)),(\"service\",(0-1))";

/// Indicator statuses reported on `AT+CIND?`. No call is ever in progress.
pub(crate) const CIND_STATUS_RESPONSE: &str = "+CIND: 0,0,0";

/// Audio gateway feature bitmask reported on `AT+BRSF=`.
pub(crate) const AG_FEATURES: u32 = 0;

/// Parses one AT command line. The line is expected without the trailing
/// carriage return.
pub(crate) fn parse(line: &str) -> Option<AtCommand> {
    let body = line.trim().strip_prefix("AT")?;

    if let Some(value) = body.strip_prefix("+VGS=") {
        return value.parse().ok().map(AtCommand::SpeakerGain);
    }
    if let Some(value) = body.strip_prefix("+VGM=") {
        return value.parse().ok().map(AtCommand::MicGain);
    }
    if let Some(value) = body.strip_prefix("+CKPD=") {
        return value.parse().ok().map(AtCommand::KeyPress);
    }
    if let Some(value) = body.strip_prefix("+BRSF=") {
        return value.parse().ok().map(AtCommand::SupportedFeatures);
    }
    if body == "+CIND=?" {
        return Some(AtCommand::IndicatorsTest);
    }
    if body == "+CIND?" {
        return Some(AtCommand::IndicatorsStatus);
    }
    if body.starts_with("+CMER=") {
        return Some(AtCommand::EventReporting);
    }
    if let Some(value) = body.strip_prefix("+IPHONEACCEV=") {
        return parse_accessory(value);
    }
    if let Some(value) = body.strip_prefix("+XAPL=") {
        return parse_xapl(value);
    }

    None
}

/// `AT+IPHONEACCEV=<n>[,<key>,<value>]*`; key 1 reports the battery level
/// in tenths (0-9).
fn parse_accessory(value: &str) -> Option<AtCommand> {
    let mut fields = value.split(',');
    let count: usize = fields.next()?.trim().parse().ok()?;

    let mut battery = None;
    for _ in 0..count {
        let key: u8 = fields.next()?.trim().parse().ok()?;
        let val: u8 = fields.next()?.trim().parse().ok()?;
        if key == 1 && val <= 9 {
            battery = Some((val + 1) * 10);
        }
    }
    Some(AtCommand::Accessory { battery })
}

/// `AT+XAPL=<vendor>-<product>-<version>,<features>` with hexadecimal ids.
fn parse_xapl(value: &str) -> Option<AtCommand> {
    let (ids, features) = value.split_once(',')?;
    let mut ids = ids.split('-');
    let vendor_id = u16::from_str_radix(ids.next()?, 16).ok()?;
    let product_id = u16::from_str_radix(ids.next()?, 16).ok()?;
    let version = u16::from_str_radix(ids.next()?, 16).ok()?;
    if ids.next().is_some() {
        return None;
    }
    let features = features.trim().parse().ok()?;
    Some(AtCommand::Xapl(XaplInfo { vendor_id, product_id, version, features }))
}

/// Frames an unsolicited result code or response body for the RFCOMM wire.
pub(crate) fn frame_response(body: &str) -> String {
    format!("\r\n{body}\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_commands() {
        assert_eq!(parse("AT+VGS=7"), Some(AtCommand::SpeakerGain(7)));
        assert_eq!(parse("AT+VGM=15"), Some(AtCommand::MicGain(15)));
        assert_eq!(parse("AT+VGS="), None);
        assert_eq!(parse("AT+VGS=x"), None);
    }

    #[test]
    fn hsp_button() {
        assert_eq!(parse("AT+CKPD=200"), Some(AtCommand::KeyPress(200)));
    }

    #[test]
    fn hfp_handshake() {
        assert_eq!(parse("AT+BRSF=183"), Some(AtCommand::SupportedFeatures(183)));
        assert_eq!(parse("AT+CIND=?"), Some(AtCommand::IndicatorsTest));
        assert_eq!(parse("AT+CIND?"), Some(AtCommand::IndicatorsStatus));
        assert_eq!(parse("AT+CMER=3,0,0,1"), Some(AtCommand::EventReporting));
    }

    #[test]
    fn accessory_battery_report() {
        assert_eq!(parse("AT+IPHONEACCEV=2,1,3,2,0"), Some(AtCommand::Accessory { battery: Some(40) }));
        assert_eq!(parse("AT+IPHONEACCEV=1,2,1"), Some(AtCommand::Accessory { battery: None }));
        assert_eq!(parse("AT+IPHONEACCEV=2,1,3"), None);
    }

    #[test]
    fn xapl_negotiation() {
        assert_eq!(
            parse("AT+XAPL=ABCD-1234-0100,10"),
            Some(AtCommand::Xapl(XaplInfo {
                vendor_id: 0xabcd,
                product_id: 0x1234,
                version: 0x0100,
                features: 10,
            }))
        );
        assert_eq!(parse("AT+XAPL=ABCD-1234,10"), None);
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert_eq!(parse("AT+CHLD=?"), None);
        assert_eq!(parse("RING"), None);
    }
}
