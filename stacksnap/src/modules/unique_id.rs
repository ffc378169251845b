//! Build identifiers: extraction from image headers and text formatting
//!
//! A module's `unique_id` is its build identifier in uppercase hex followed
//! by an age counter:
//!
//! | Format  | Source                          | Layout                             |
//! |---------|---------------------------------|------------------------------------|
//! | ELF     | `NT_GNU_BUILD_ID` note          | first 16 bytes as a GUID, then `0` |
//! | Mach-O  | `LC_UUID` load command          | 16 bytes in order, then `0`        |
//! | PE      | CodeView `RSDS` debug record    | GUID, then the PDB age             |
//!
//! GUIDs print their first three fields as little-endian integers
//! (`%08X%04X%04X`) and the remaining eight bytes in order. Anything
//! malformed yields an empty identifier.

use object::elf::{ELF_NOTE_GNU, NT_GNU_BUILD_ID};
use object::read::elf::{FileHeader, NoteIterator};
use object::Endianness;
use std::fmt::Write as _;

/// ELF header layout of the running process
#[cfg(target_pointer_width = "64")]
pub type NativeElf = object::elf::FileHeader64<Endianness>;
#[cfg(target_pointer_width = "32")]
pub type NativeElf = object::elf::FileHeader32<Endianness>;

const CODEVIEW_RSDS_SIGNATURE: &[u8; 4] = b"RSDS";

/// GUID text of 16 bytes stored in Windows/ELF little-endian field order
fn format_guid(bytes: &[u8; 16]) -> String {
    let data1 = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let data2 = u16::from_le_bytes([bytes[4], bytes[5]]);
    let data3 = u16::from_le_bytes([bytes[6], bytes[7]]);

    let mut text = format!("{data1:08X}{data2:04X}{data3:04X}");
    for byte in &bytes[8..] {
        let _ = write!(text, "{byte:02X}");
    }
    text
}

/// Unique id of an ELF image from its GNU build id
///
/// Build ids shorter than 16 bytes are zero-padded; longer ones truncated.
#[must_use]
pub fn elf_unique_id(build_id: &[u8]) -> String {
    if build_id.is_empty() {
        return String::new();
    }
    let mut guid = [0u8; 16];
    let len = build_id.len().min(16);
    guid[..len].copy_from_slice(&build_id[..len]);
    format_guid(&guid) + "0"
}

/// Unique id of a Mach-O image from its `LC_UUID`
#[must_use]
pub fn macho_unique_id(uuid: &[u8; 16]) -> String {
    let mut text = String::with_capacity(33);
    for byte in uuid {
        let _ = write!(text, "{byte:02X}");
    }
    text.push('0');
    text
}

/// Unique id of a PE image from its CodeView GUID and age
#[must_use]
pub fn pe_unique_id(guid: &[u8; 16], age: u32) -> String {
    format!("{}{age:X}", format_guid(guid))
}

/// Find the GNU build id in a `PT_NOTE` segment of this process
///
/// `align` is the segment's `p_align`; notes are padded to it.
#[must_use]
pub fn find_gnu_build_id(notes: &[u8], align: <NativeElf as FileHeader>::Word) -> Option<&[u8]> {
    let endian = Endianness::default();
    let mut notes = NoteIterator::<NativeElf>::new(endian, align, notes).ok()?;
    while let Ok(Some(note)) = notes.next() {
        if note.name() == ELF_NOTE_GNU && note.n_type(endian) == NT_GNU_BUILD_ID {
            return Some(note.desc());
        }
    }
    None
}

/// Parse a CodeView `RSDS` record into (GUID, age)
#[must_use]
pub fn parse_codeview_rsds(record: &[u8]) -> Option<([u8; 16], u32)> {
    if record.get(..4)? != CODEVIEW_RSDS_SIGNATURE {
        return None;
    }
    let guid: [u8; 16] = record.get(4..20)?.try_into().ok()?;
    let age = u32::from_le_bytes(record.get(20..24)?.try_into().ok()?);
    Some((guid, age))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BYTES: [u8; 16] = [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
        0x10,
    ];

    fn note(name: &[u8], note_type: u32, desc: &[u8]) -> Vec<u8> {
        padded_note(name, note_type, desc, 4)
    }

    fn padded_note(name: &[u8], note_type: u32, desc: &[u8], align: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&u32::try_from(name.len()).unwrap().to_ne_bytes());
        out.extend_from_slice(&u32::try_from(desc.len()).unwrap().to_ne_bytes());
        out.extend_from_slice(&note_type.to_ne_bytes());
        out.extend_from_slice(name);
        out.resize(out.len().next_multiple_of(align), 0);
        out.extend_from_slice(desc);
        out.resize(out.len().next_multiple_of(align), 0);
        out
    }

    #[test]
    fn test_elf_unique_id_swaps_guid_fields() {
        let mut build_id = BYTES.to_vec();
        build_id.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);

        assert_eq!(elf_unique_id(&build_id), "0403020106050807090A0B0C0D0E0F100");
    }

    #[test]
    fn test_elf_unique_id_pads_short_ids() {
        assert_eq!(elf_unique_id(&[0xab, 0xcd]), "0000CDAB0000000000000000000000000");
        assert_eq!(elf_unique_id(&[]), "");
    }

    #[test]
    fn test_macho_unique_id() {
        assert_eq!(macho_unique_id(&BYTES), "0102030405060708090A0B0C0D0E0F100");
    }

    #[test]
    fn test_pe_unique_id_appends_age() {
        assert_eq!(pe_unique_id(&BYTES, 0x1a), "0403020106050807090A0B0C0D0E0F101A");
    }

    #[test]
    fn test_find_gnu_build_id_skips_other_notes() {
        let mut notes = note(b"GNU\0", 1, &[0, 0, 0, 0, 3, 0, 0, 0]);
        notes.extend(note(b"stapsdt\0", 3, &[1, 2, 3]));
        notes.extend(note(b"GNU\0", 3, &BYTES));

        assert_eq!(find_gnu_build_id(&notes, 4), Some(&BYTES[..]));
    }

    #[test]
    fn test_find_gnu_build_id_eight_byte_aligned() {
        let mut notes = padded_note(b"GNU\0", 5, &[0; 12], 8);
        notes.extend(padded_note(b"GNU\0", 3, &BYTES[..12], 8));

        assert_eq!(find_gnu_build_id(&notes, 8), Some(&BYTES[..12]));
        assert_eq!(find_gnu_build_id(&notes, 16), None);
    }

    #[test]
    fn test_find_gnu_build_id_truncated() {
        let notes = note(b"GNU\0", 3, &BYTES);
        assert_eq!(find_gnu_build_id(&notes[..notes.len() - 4], 4), None);
        assert_eq!(find_gnu_build_id(&[], 4), None);
    }

    #[test]
    fn test_parse_codeview_rsds() {
        let mut record = b"RSDS".to_vec();
        record.extend_from_slice(&BYTES);
        record.extend_from_slice(&7u32.to_le_bytes());
        record.extend_from_slice(b"C:\\app.pdb\0");

        assert_eq!(parse_codeview_rsds(&record), Some((BYTES, 7)));
        assert_eq!(parse_codeview_rsds(b"NB10"), None);
        assert_eq!(parse_codeview_rsds(&record[..20]), None);
    }
}
