//! Events-log grammar: a line-oriented log of PCR-extend operations
//! (`PCR<N>:<type>:<data>`) that is replayed into a simulated TPM PCR bank,
//! plus the special `os-image-identity` JSON fragment that binds an image's
//! security version number and disk identity into the log.

use cvmboot_core::{CvmbootError, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const MAX_PCRS: usize = 24;
pub const MAX_PCR_LOG_EVENTS: usize = 16;

const OS_IMAGE_IDENTITY_KEY: &str = "os-image-identity";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    String,
    Binary,
}

/// A simulated TPM PCR bank: `MAX_PCRS` 32-byte registers, all zero at reset.
#[derive(Debug, Clone)]
pub struct PcrBank {
    pcrs: [[u8; 32]; MAX_PCRS],
}

impl Default for PcrBank {
    fn default() -> Self {
        Self {
            pcrs: [[0u8; 32]; MAX_PCRS],
        }
    }
}

impl PcrBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extends `pcr` with `sha256(data)`, following the standard TPM
    /// extend operation `pcr' = sha256(pcr || sha256(data))`.
    pub fn extend(&mut self, pcr: usize, data: &[u8]) -> Result<[u8; 32]> {
        validate_pcr(pcr)?;
        let digest: [u8; 32] = Sha256::digest(data).into();
        let mut hasher = Sha256::new();
        hasher.update(self.pcrs[pcr]);
        hasher.update(digest);
        self.pcrs[pcr] = hasher.finalize().into();
        Ok(digest)
    }

    pub fn get(&self, pcr: usize) -> Result<[u8; 32]> {
        validate_pcr(pcr)?;
        Ok(self.pcrs[pcr])
    }
}

fn validate_pcr(pcr: usize) -> Result<()> {
    if pcr >= MAX_PCRS {
        return Err(CvmbootError::OutOfRange(format!(
            "PCR index {pcr} is out of range (max {MAX_PCRS})"
        )));
    }
    Ok(())
}

/// One parsed `PCR<N>:<type>:<data>` line.
#[derive(Debug, Clone)]
pub struct PcrEvent {
    pub pcr: usize,
    pub event_type: EventType,
    pub data: Vec<u8>,
    pub digest: [u8; 32],
}

/// The required `"os-image-identity":{...}` fragment, exactly one of which
/// must appear in a well-formed events file. `svn` and `event_version` are
/// carried as the raw JSON strings the canonical form uses (`eventVersion`
/// is a dotted version like `"1.0"`, not an integer), not parsed as numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsImageIdentity {
    pub signer: String,
    pub svn: String,
    pub disk_id: String,
    pub event_version: String,
}

#[derive(Debug, Clone)]
pub struct EventLog {
    pub pcrs: PcrBank,
    pub events: Vec<PcrEvent>,
    pub os_image_identity: OsImageIdentity,
}

/// Parses the events-log text, replaying every event into a fresh
/// [`PcrBank`], and returns the resulting log. Requires exactly one
/// `os-image-identity` entry.
///
/// The identity entry's embedded `signer` field is never trusted from the
/// log: it is discarded and replaced with `image_signer_hex` (the real
/// signature envelope's signer hash), and the whole fragment is rebuilt into
/// the canonical `"os-image-identity":{"signer":...,"svn":...,"diskId":...,
/// "eventVersion":...}` byte form *before* that reformatted string, not the
/// original line text, is what gets measured into the PCR.
pub fn parse_and_extend(contents: &str, image_signer_hex: &str) -> Result<EventLog> {
    let mut pcrs = PcrBank::new();
    let mut events = Vec::new();
    let mut identity = None;
    let mut identity_count = 0usize;
    let mut line_count = 0usize;

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        line_count += 1;
        if line_count > MAX_PCR_LOG_EVENTS {
            return Err(CvmbootError::OutOfRange(format!(
                "events file has more than {MAX_PCR_LOG_EVENTS} entries"
            )));
        }

        let mut parts = line.splitn(3, ':');
        let pcr_field = parts
            .next()
            .ok_or_else(|| malformed(line))?;
        let type_field = parts.next().ok_or_else(|| malformed(line))?;
        let data_field = parts.next().ok_or_else(|| malformed(line))?;

        let pcr = parse_pcr_field(pcr_field)?;
        let event_type = match type_field {
            "string" => EventType::String,
            "binary" => EventType::Binary,
            other => {
                return Err(CvmbootError::CorruptFormat(format!(
                    "unknown event type '{other}' in events line: {line}"
                )))
            }
        };

        let is_identity =
            event_type == EventType::String && data_field.starts_with(&format!("\"{OS_IMAGE_IDENTITY_KEY}\":"));

        let data = if is_identity {
            identity_count += 1;
            let (parsed, canonical) = parse_os_image_identity(data_field, image_signer_hex)?;
            identity = Some(parsed);
            canonical.into_bytes()
        } else {
            match event_type {
                EventType::String => data_field.as_bytes().to_vec(),
                EventType::Binary => hex::decode(data_field)
                    .map_err(|e| CvmbootError::CorruptFormat(format!("bad hex in events line '{line}': {e}")))?,
            }
        };

        let digest = pcrs.extend(pcr, &data)?;
        events.push(PcrEvent {
            pcr,
            event_type,
            data,
            digest,
        });
    }

    if identity_count != 1 {
        return Err(CvmbootError::CorruptFormat(format!(
            "events file must contain exactly one {OS_IMAGE_IDENTITY_KEY} entry, found {identity_count}"
        )));
    }

    Ok(EventLog {
        pcrs,
        events,
        os_image_identity: identity.expect("identity_count == 1 implies Some"),
    })
}

fn malformed(line: &str) -> CvmbootError {
    CvmbootError::CorruptFormat(format!("malformed events line (expected PCR<N>:<type>:<data>): {line}"))
}

fn parse_pcr_field(field: &str) -> Result<usize> {
    let suffix = field
        .strip_prefix("PCR")
        .ok_or_else(|| CvmbootError::CorruptFormat(format!("events line does not start with 'PCR': {field}")))?;
    let pcr: usize = suffix
        .parse()
        .map_err(|_| CvmbootError::CorruptFormat(format!("bad PCR number in '{field}'")))?;
    validate_pcr(pcr)?;
    Ok(pcr)
}

/// Parses `"os-image-identity":{...}` by wrapping it into a full JSON
/// object, reads `svn`/`diskId`/`eventVersion` as strings, and rebuilds the
/// fragment with `signer` replaced by `image_signer_hex` in the fixed
/// canonical key order. Returns the parsed identity alongside the
/// reformatted string that must be measured in place of the original line.
fn parse_os_image_identity(fragment: &str, image_signer_hex: &str) -> Result<(OsImageIdentity, String)> {
    let wrapped = format!("{{{fragment}}}");
    let value: Value = serde_json::from_str(&wrapped)
        .map_err(|e| CvmbootError::CorruptFormat(format!("bad {OS_IMAGE_IDENTITY_KEY} JSON: {e}")))?;

    let object = value
        .get(OS_IMAGE_IDENTITY_KEY)
        .and_then(Value::as_object)
        .ok_or_else(|| CvmbootError::CorruptFormat(format!("{OS_IMAGE_IDENTITY_KEY} is not a JSON object")))?;

    let svn = object
        .get("svn")
        .and_then(Value::as_str)
        .ok_or_else(|| CvmbootError::CorruptFormat("os-image-identity missing string 'svn'".into()))?
        .to_string();
    let disk_id = object
        .get("diskId")
        .and_then(Value::as_str)
        .ok_or_else(|| CvmbootError::CorruptFormat("os-image-identity missing string 'diskId'".into()))?
        .to_string();
    let event_version = object
        .get("eventVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| CvmbootError::CorruptFormat("os-image-identity missing string 'eventVersion'".into()))?
        .to_string();

    let identity = OsImageIdentity {
        signer: image_signer_hex.to_string(),
        svn: svn.clone(),
        disk_id: disk_id.clone(),
        event_version: event_version.clone(),
    };

    let canonical = canonical_os_image_identity(image_signer_hex, &svn, &disk_id, &event_version);

    Ok((identity, canonical))
}

/// Builds the canonical, whitespace-free `os-image-identity` fragment in
/// the fixed key order `signer, svn, diskId, eventVersion`. Used both to
/// reformat a freshly parsed entry (with the real signer substituted in)
/// and, by the round-trip property, to reproduce an already-canonical
/// entry byte-for-byte.
fn canonical_os_image_identity(signer: &str, svn: &str, disk_id: &str, event_version: &str) -> String {
    format!(
        "\"{OS_IMAGE_IDENTITY_KEY}\":{{\"signer\":{signer},\"svn\":{svn},\"diskId\":{disk_id},\"eventVersion\":{event_version}}}",
        signer = serde_json::to_string(signer).expect("string serialization cannot fail"),
        svn = serde_json::to_string(svn).expect("string serialization cannot fail"),
        disk_id = serde_json::to_string(disk_id).expect("string serialization cannot fail"),
        event_version = serde_json::to_string(event_version).expect("string serialization cannot fail"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNER_HEX: &str = "95b3fc4b2fba43ff82570c725f94edaa1234567890abcdef1234567890abcd";

    fn sample_log() -> String {
        concat!(
            "# boot measurements\n",
            "PCR0:string:bootloader-v1\n",
            "PCR4:binary:deadbeef\n",
            "PCR7:string:\"os-image-identity\":{\"svn\":\"3\",\"diskId\":\"disk-001\",\"eventVersion\":\"1.0\",\"signer\":\"ignored\"}\n",
        )
        .to_string()
    }

    #[test]
    fn parses_events_and_extends_pcrs() {
        let log = parse_and_extend(&sample_log(), SIGNER_HEX).unwrap();
        assert_eq!(log.events.len(), 3);
        assert_eq!(log.os_image_identity.svn, "3");
        assert_eq!(log.os_image_identity.disk_id, "disk-001");
        assert_eq!(log.os_image_identity.event_version, "1.0");
        assert_eq!(log.os_image_identity.signer, SIGNER_HEX);
        assert_ne!(log.pcrs.get(0).unwrap(), [0u8; 32]);
        assert_eq!(log.pcrs.get(1).unwrap(), [0u8; 32]);
    }

    #[test]
    fn identity_entry_is_measured_as_the_canonical_reformat_not_the_raw_line() {
        let log = parse_and_extend(&sample_log(), SIGNER_HEX).unwrap();
        let identity_event = &log.events[2];
        let expected = canonical_os_image_identity(SIGNER_HEX, "3", "disk-001", "1.0");
        assert_eq!(identity_event.data, expected.into_bytes());
        assert!(!identity_event.data.windows(7).any(|w| w == b"ignored"));
    }

    #[test]
    fn scenario_two_rewrites_signer_and_extends_two_pcrs() {
        let text = concat!(
            "PCR11:string:\"os-image-identity\":{\"signer\":\"ignored\",\"svn\":\"1\",\"diskId\":\"abc\",\"eventVersion\":\"1.0\"}\n",
            "PCR23:binary:2dd1886c59504e609c1d089463f869c0\n",
        );
        let signer_hex = "95b3fc4b2fba43ff82570c725f94edaa1234567890abcdef1234567890abcd";
        let log = parse_and_extend(text, signer_hex).unwrap();

        assert_eq!(log.events.len(), 2);
        assert_eq!(
            log.events[0].data,
            canonical_os_image_identity(signer_hex, "1", "abc", "1.0").into_bytes()
        );

        let mut expected_pcr23 = Sha256::new();
        expected_pcr23.update([0u8; 32]);
        expected_pcr23.update(Sha256::digest(hex::decode("2dd1886c59504e609c1d089463f869c0").unwrap()));
        let expected_pcr23: [u8; 32] = expected_pcr23.finalize().into();
        assert_eq!(log.pcrs.get(23).unwrap(), expected_pcr23);
    }

    #[test]
    fn canonical_reformat_round_trips() {
        let first = canonical_os_image_identity(SIGNER_HEX, "3", "disk-001", "1.0");
        let wrapped = format!("{{{first}}}");
        let value: Value = serde_json::from_str(&wrapped).unwrap();
        let object = value.get(OS_IMAGE_IDENTITY_KEY).and_then(Value::as_object).unwrap();
        let second = canonical_os_image_identity(
            object.get("signer").and_then(Value::as_str).unwrap(),
            object.get("svn").and_then(Value::as_str).unwrap(),
            object.get("diskId").and_then(Value::as_str).unwrap(),
            object.get("eventVersion").and_then(Value::as_str).unwrap(),
        );
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_missing_identity() {
        let text = "PCR0:string:bootloader-v1\n";
        assert!(parse_and_extend(text, SIGNER_HEX).is_err());
    }

    #[test]
    fn rejects_duplicate_identity() {
        let mut text = sample_log();
        text.push_str("PCR8:string:\"os-image-identity\":{\"svn\":\"4\",\"diskId\":\"disk-002\",\"eventVersion\":\"1.0\"}\n");
        assert!(parse_and_extend(&text, SIGNER_HEX).is_err());
    }

    #[test]
    fn rejects_out_of_range_pcr() {
        let text = "PCR99:string:x\n\"os-image-identity\":{\"svn\":\"1\",\"diskId\":\"d\",\"eventVersion\":\"1.0\"}\n";
        assert!(parse_and_extend(text, SIGNER_HEX).is_err());
    }

    #[test]
    fn rejects_too_many_events() {
        let mut text = String::new();
        for i in 0..=MAX_PCR_LOG_EVENTS {
            text.push_str(&format!("PCR0:string:event-{i}\n"));
        }
        text.push_str("PCR1:string:\"os-image-identity\":{\"svn\":\"1\",\"diskId\":\"d\",\"eventVersion\":\"1.0\"}\n");
        assert!(parse_and_extend(&text, SIGNER_HEX).is_err());
    }

    #[test]
    fn extend_is_deterministic_and_order_sensitive() {
        let mut a = PcrBank::new();
        let mut b = PcrBank::new();
        a.extend(0, b"first").unwrap();
        a.extend(0, b"second").unwrap();
        b.extend(0, b"second").unwrap();
        b.extend(0, b"first").unwrap();
        assert_ne!(a.get(0).unwrap(), b.get(0).unwrap());
    }
}
