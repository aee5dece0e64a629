//! Binary <-> colon-hex formatters for MAC addresses and DUIDs. Grounded on
//! the donor's local `mod hex` helper in `microdns-dhcp/src/v6/server.rs` and
//! `original_source`'s `encoding_utils.c`. This is the "binary->text MAC/IPv6
//! formatters" external boundary named in §1 — kept trivially small on
//! purpose.

/// Formats bytes as lowercase colon-separated hex, e.g. `aa:bb:cc:dd:ee:ff`.
pub fn to_colon_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parses a colon-separated hex string back into bytes. Tolerant of
/// uppercase input; rejects anything else.
pub fn from_colon_hex(s: &str) -> Option<Vec<u8>> {
    s.split(':')
        .map(|part| u8::from_str_radix(part, 16).ok())
        .collect()
}

/// Parses a 6-byte MAC address specifically.
pub fn mac_from_colon_hex(s: &str) -> Option<[u8; 6]> {
    let bytes = from_colon_hex(s)?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_mac() {
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        let s = to_colon_hex(&mac);
        assert_eq!(s, "aa:bb:cc:dd:ee:ff");
        assert_eq!(mac_from_colon_hex(&s).unwrap(), mac);
    }

    #[test]
    fn rejects_garbage() {
        assert!(from_colon_hex("zz:11").is_none());
    }
}
