//! Signal GUID wire forms.
//!
//! Publishers serialize GUIDs either as raw RFC 4122 bytes or in the
//! Microsoft mixed-endian layout where the first three groups are
//! byte-swapped. The subscriber configuration selects which form the
//! peer speaks; both directions are handled here.

use uuid::Uuid;

/// Decode a GUID from its 16-byte wire form.
///
/// With `swap_endianness` set, the first three groups are interpreted as
/// little-endian (Microsoft layout); otherwise the bytes are taken as
/// RFC 4122 big-endian.
pub fn from_wire(bytes: [u8; 16], swap_endianness: bool) -> Uuid {
    if swap_endianness {
        Uuid::from_bytes(mixed_endian_swap(bytes))
    } else {
        Uuid::from_bytes(bytes)
    }
}

/// Encode a GUID into its 16-byte wire form.
pub fn to_wire(guid: Uuid, swap_endianness: bool) -> [u8; 16] {
    let bytes = *guid.as_bytes();
    if swap_endianness {
        mixed_endian_swap(bytes)
    } else {
        bytes
    }
}

/// Swap between RFC 4122 and Microsoft mixed-endian layouts.
///
/// The transform is an involution: the u32 group and the two u16 groups
/// reverse, the final eight bytes stay put.
fn mixed_endian_swap(b: [u8; 16]) -> [u8; 16] {
    [
        b[3], b[2], b[1], b[0], // Data1
        b[5], b[4], // Data2
        b[7], b[6], // Data3
        b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE,
        0xFF,
    ];

    #[test]
    fn test_rfc4122_is_identity() {
        let guid = from_wire(SAMPLE, false);
        assert_eq!(guid.as_bytes(), &SAMPLE);
        assert_eq!(to_wire(guid, false), SAMPLE);
    }

    #[test]
    fn test_mixed_endian_groups() {
        let guid = from_wire(SAMPLE, true);
        assert_eq!(
            guid.as_bytes(),
            &[
                0x33, 0x22, 0x11, 0x00, 0x55, 0x44, 0x77, 0x66, 0x88, 0x99, 0xAA, 0xBB, 0xCC,
                0xDD, 0xEE, 0xFF,
            ]
        );
    }

    #[test]
    fn test_round_trip_both_forms() {
        let guid = Uuid::from_bytes(SAMPLE);
        for swap in [false, true] {
            assert_eq!(from_wire(to_wire(guid, swap), swap), guid);
        }
    }

    #[test]
    fn test_swap_is_involution() {
        assert_eq!(mixed_endian_swap(mixed_endian_swap(SAMPLE)), SAMPLE);
    }
}
