//! Minimal "newc" CPIO archive writer/reader, the in-memory container
//! `protect` packs the ESP home directory into before signing (§4.9). The
//! on-disk header layout mirrors `utils/cpio.c`'s `CPIOHeader` (the
//! bootloader-side reader this writer is the producer for): a 6-byte ASCII
//! magic, eleven 8-hex-digit fields, and a NUL-terminated name, each of
//! header+name and the data payload padded up to a 4-byte boundary.

use cvmboot_core::{CvmbootError, Result};

const MAGIC: &[u8; 6] = b"070701";
const HEADER_SIZE: usize = 6 + 13 * 8;
const TRAILER_NAME: &str = "TRAILER!!!";
const REGULAR_FILE_MODE: u32 = 0o100644;

fn round_up(x: usize, m: usize) -> usize {
    (x + m - 1) / m * m
}

fn write_field(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(format!("{value:08X}").as_bytes());
}

fn write_entry(buf: &mut Vec<u8>, ino: u32, mode: u32, name: &str, data: &[u8]) {
    let start = buf.len();
    let namesize = name.len() as u32 + 1;

    buf.extend_from_slice(MAGIC);
    write_field(buf, ino);
    write_field(buf, mode);
    write_field(buf, 0); // uid
    write_field(buf, 0); // gid
    write_field(buf, 1); // nlink
    write_field(buf, 0); // mtime
    write_field(buf, data.len() as u32); // filesize
    write_field(buf, 0); // devmajor
    write_field(buf, 0); // devminor
    write_field(buf, 0); // rdevmajor
    write_field(buf, 0); // rdevminor
    write_field(buf, namesize);
    write_field(buf, 0); // check

    buf.extend_from_slice(name.as_bytes());
    buf.push(0);

    let header_and_name_len = buf.len() - start;
    buf.resize(start + round_up(header_and_name_len, 4), 0);

    let data_start = buf.len();
    buf.extend_from_slice(data);
    buf.resize(data_start + round_up(data.len(), 4), 0);
}

/// Packs `files` (path, contents) into a newc CPIO archive, terminated by
/// the conventional `TRAILER!!!` entry.
pub fn write_archive(files: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (i, (name, data)) in files.iter().enumerate() {
        write_entry(&mut buf, i as u32 + 1, REGULAR_FILE_MODE, name, data);
    }
    write_entry(&mut buf, 0, 0, TRAILER_NAME, &[]);
    buf
}

struct ParsedEntry<'a> {
    name: &'a str,
    data: &'a [u8],
    entry_len: usize,
}

fn parse_entry(buf: &[u8]) -> Result<ParsedEntry<'_>> {
    if buf.len() < HEADER_SIZE {
        return Err(CvmbootError::CorruptFormat("truncated CPIO header".into()));
    }
    if &buf[0..6] != MAGIC {
        return Err(CvmbootError::CorruptFormat("bad CPIO magic".into()));
    }

    let field = |i: usize| -> Result<u32> {
        let off = 6 + i * 8;
        let s = std::str::from_utf8(&buf[off..off + 8])
            .map_err(|_| CvmbootError::CorruptFormat("non-ASCII CPIO header field".into()))?;
        u32::from_str_radix(s, 16).map_err(|_| CvmbootError::CorruptFormat("bad CPIO hex field".into()))
    };

    let filesize = field(6)? as usize;
    let namesize = field(11)? as usize;

    if HEADER_SIZE + namesize > buf.len() {
        return Err(CvmbootError::CorruptFormat("CPIO name overruns buffer".into()));
    }
    let name_bytes = &buf[HEADER_SIZE..HEADER_SIZE + namesize];
    let name = std::str::from_utf8(name_bytes)
        .map_err(|_| CvmbootError::CorruptFormat("non-UTF8 CPIO name".into()))?
        .trim_end_matches('\0');

    let header_and_name_len = HEADER_SIZE + namesize;
    let data_start = round_up(header_and_name_len, 4);
    if data_start + filesize > buf.len() {
        return Err(CvmbootError::CorruptFormat("CPIO data overruns buffer".into()));
    }
    let data = &buf[data_start..data_start + filesize];
    let entry_len = round_up(data_start + filesize, 4);

    Ok(ParsedEntry { name, data, entry_len })
}

/// Reads every regular-file entry out of a newc CPIO archive, stopping at
/// the `TRAILER!!!` marker.
pub fn read_archive(buf: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < buf.len() {
        let entry = parse_entry(&buf[offset..])?;
        if entry.name == TRAILER_NAME {
            break;
        }
        out.push((entry.name.to_string(), entry.data.to_vec()));
        offset += entry.entry_len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_multiple_files() {
        let files = vec![
            ("EFI/cvmboot/cvmboot.conf".to_string(), b"roothash=abc\n".to_vec()),
            ("EFI/cvmboot/events".to_string(), b"PCR0:string:x\n".to_vec()),
        ];
        let archive = write_archive(&files);
        let parsed = read_archive(&archive).unwrap();
        assert_eq!(parsed, files);
    }

    #[test]
    fn empty_archive_round_trips() {
        let archive = write_archive(&[]);
        assert_eq!(read_archive(&archive).unwrap(), Vec::<(String, Vec<u8>)>::new());
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; HEADER_SIZE + 4];
        assert!(read_archive(&buf).is_err());
    }
}
