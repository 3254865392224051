//! Well-known GPT partition type GUIDs (spec §6) and the on-disk mixed
//! endian encoding GPT uses for every GUID field (first three fields
//! little-endian, last field big-endian, matching `uuid::Uuid::from_fields`).

use uuid::Uuid;

/// Reads a GPT-style mixed-endian GUID from its 16-byte on-disk form.
pub fn guid_from_bytes(bytes: [u8; 16]) -> Uuid {
    let d1 = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let d2 = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
    let d3 = u16::from_le_bytes(bytes[6..8].try_into().unwrap());
    let d4: [u8; 8] = bytes[8..16].try_into().unwrap();
    Uuid::from_fields(d1, d2, d3, &d4)
}

/// Writes a GUID back into its 16-byte GPT mixed-endian on-disk form.
pub fn guid_to_bytes(guid: &Uuid) -> [u8; 16] {
    let (d1, d2, d3, d4) = guid.as_fields();
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&d1.to_le_bytes());
    out[4..6].copy_from_slice(&d2.to_le_bytes());
    out[6..8].copy_from_slice(&d3.to_le_bytes());
    out[8..16].copy_from_slice(d4);
    out
}

macro_rules! well_known_guid {
    ($name:ident, $s:literal) => {
        pub fn $name() -> Uuid {
            Uuid::parse_str($s).expect("well-known GUID literal is valid")
        }
    };
}

well_known_guid!(linux_filesystem_type_guid, "0fc63daf-8483-4772-8e79-3d69d8477de4");
well_known_guid!(verity_hash_type_guid, "3416e185-0efa-4ba5-bf43-be206e7f9af0");
well_known_guid!(thin_data_type_guid, "136ce4af-afed-4f96-84ff-0651088074ee");
well_known_guid!(thin_meta_type_guid, "ed71d74e-250a-4f9f-a29b-32246f9bb43a");
well_known_guid!(rootfs_upper_type_guid, "c148c601-508c-4f28-aa23-3c1a6955f649");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let u = Uuid::new_v4();
        let bytes = guid_to_bytes(&u);
        assert_eq!(guid_from_bytes(bytes), u);
    }

    #[test]
    fn well_known_guids_parse() {
        assert_eq!(
            verity_hash_type_guid().to_string(),
            "3416e185-0efa-4ba5-bf43-be206e7f9af0"
        );
    }
}
