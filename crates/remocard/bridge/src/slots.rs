//! Slot detection: which eUICC application answers in each reader, and its EID

use std::collections::HashMap;

use parking_lot::RwLock;
use remocard_apdu_core::{Result, SmartcardService, Transceiver, decode_hex, encode_hex};
use tracing::{debug, info, trace, warn};

/// ISD-R of a GSMA eUICC, also the application used by `/sendRawApdu`
pub const ISD_R_AID: &str = "A0000005591010FFFFFFFF8900000100";

/// Well-known eUICC management applications, in probing order
pub const EUICC_AIDS: [&str; 6] = [
    "A06573746B6D65FFFF4953442D522031",
    "A06573746B6D65FFFF4953442D522030",
    "A0000005591010FFFFFFFF8900000100",
    "A0000005591010FFFFFFFF8900050500",
    "A0000005591010000000008900000300",
    "A0000005591010FFFFFFFF8900000177",
];

/// GET EID (ES10c.GetEUICCInfo, tag `5A`)
const GET_EID: [u8; 11] = [
    0x80, 0xE2, 0x91, 0x00, 0x06, 0xBF, 0x3E, 0x03, 0x5C, 0x01, 0x5A,
];

const EID_LEN: usize = 16;

/// What detection found in one reader
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotInfo {
    /// Chip identifier as upper-case hex
    pub eid: Option<String>,
    /// First probed AID that could be selected
    pub aid: Option<String>,
}

/// ISD-R first, then [`EUICC_AIDS`], without duplicates
pub fn candidate_aids() -> Vec<&'static str> {
    let mut aids = vec![ISD_R_AID];
    for aid in EUICC_AIDS {
        if !aids.contains(&aid) {
            aids.push(aid);
        }
    }
    aids
}

/// Extract the EID from a GET EID response
pub fn parse_eid(response: &[u8]) -> Option<String> {
    if response.len() < 21 || response.starts_with(&[0x68, 0x81]) {
        return None;
    }
    let start = response.windows(2).position(|w| w == [0x5A, 0x10])? + 2;
    response
        .get(start..start + EID_LEN)
        .map(|eid| encode_hex(eid).to_ascii_uppercase())
}

/// Probe the card in `reader`
///
/// Stops at the first candidate AID that opens. A failing GET EID leaves
/// `eid` empty but keeps the AID.
pub fn detect(
    service: &dyn SmartcardService,
    transceiver: &Transceiver,
    reader: &str,
) -> Result<SlotInfo> {
    let session = service.open_session(reader)?;
    let mut info = SlotInfo::default();

    for aid in candidate_aids() {
        let bytes = decode_hex(aid)?;
        let mut channel = match session.open_logical_channel(&bytes) {
            Ok(Some(channel)) => channel,
            Ok(None) => continue,
            Err(e) => {
                trace!(%reader, %aid, error = %e, "Probe failed");
                continue;
            }
        };

        info.aid = Some(aid.to_owned());
        match transceiver.exchange(channel.as_mut(), &GET_EID) {
            Ok(response) => {
                debug!(%reader, %aid, response = %encode_hex(&response), "GET EID");
                info.eid = parse_eid(&response);
            }
            Err(e) => warn!(%reader, %aid, error = %e, "GET EID failed"),
        }
        if let Err(e) = channel.close() {
            debug!(%reader, error = %e, "Failed to close probe channel");
        }
        break;
    }

    if let Err(e) = session.close() {
        debug!(%reader, error = %e, "Failed to close probe session");
    }
    Ok(info)
}

/// Cached detection results per reader
#[derive(Debug, Default)]
pub struct SlotDirectory {
    slots: RwLock<HashMap<String, SlotInfo>>,
}

impl SlotDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached result for `reader`
    pub fn get(&self, reader: &str) -> Option<SlotInfo> {
        self.slots.read().get(reader).cloned()
    }

    /// Re-probe every reader with a card present
    ///
    /// Readers without a card, or that have disappeared, are forgotten.
    pub fn refresh(&self, service: &dyn SmartcardService, transceiver: &Transceiver) {
        let readers = match service.readers() {
            Ok(readers) => readers,
            Err(e) => {
                warn!(error = %e, "Failed to list readers for slot detection");
                return;
            }
        };

        let mut found = HashMap::new();
        for reader in readers.into_iter().filter(|r| r.present) {
            match detect(service, transceiver, &reader.name) {
                Ok(slot) => {
                    info!(reader = %reader.name, eid = ?slot.eid, aid = ?slot.aid, "Slot detected");
                    found.insert(reader.name, slot);
                }
                Err(e) => warn!(reader = %reader.name, error = %e, "Slot detection failed"),
            }
        }
        *self.slots.write() = found;
    }
}
