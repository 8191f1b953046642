//! DICOM pixel data encapsulation.
//!
//! This module writes the item-encoded byte form of encapsulated pixel data:
//! the basic offset table item, one or more fragment items per frame,
//! and the sequence delimitation item.
//! The output is the value of a _Pixel Data_ element of undefined length,
//! to be placed right after its element header.

/// Encapsulate the given frames.
///
/// Each frame is split into fragments of at most `fragment_size` bytes,
/// or kept in a single fragment if `fragment_size` is 0.
/// Fragments of odd length are padded with a trailing zero.
/// If `offset_table` is true,
/// the basic offset table is filled with the position of each frame's first fragment,
/// otherwise it is left empty.
///
/// # Example
///
/// ```
/// use dicom_pixelcore::encapsulation::encapsulate;
///
/// let bytes = encapsulate(&[vec![1, 2, 3, 4]], 0, false);
/// // empty offset table, one fragment, sequence delimiter
/// assert_eq!(bytes.len(), 8 + 8 + 4 + 8);
/// ```
pub fn encapsulate(frames: &[Vec<u8>], fragment_size: u32, offset_table: bool) -> Vec<u8> {
    let mut fragments = Vec::new();
    let mut offsets = Vec::with_capacity(frames.len());
    let mut position = 0_u32;

    for frame in frames {
        offsets.push(position);
        let chunk_len = if fragment_size == 0 {
            frame.len().max(1)
        } else {
            fragment_size as usize
        };
        for chunk in frame.chunks(chunk_len) {
            let padded_len = chunk.len() + chunk.len() % 2;
            write_item_header(&mut fragments, padded_len as u32);
            fragments.extend_from_slice(chunk);
            if chunk.len() % 2 == 1 {
                fragments.push(0);
            }
            position += 8 + padded_len as u32;
        }
    }

    let mut out = Vec::with_capacity(fragments.len() + 16 + offsets.len() * 4);
    if offset_table {
        write_item_header(&mut out, offsets.len() as u32 * 4);
        for offset in offsets {
            out.extend_from_slice(&offset.to_le_bytes());
        }
    } else {
        write_item_header(&mut out, 0);
    }
    out.extend_from_slice(&fragments);
    // sequence delimitation item
    out.extend_from_slice(&[0xFE, 0xFF, 0xDD, 0xE0, 0, 0, 0, 0]);
    out
}

fn write_item_header(out: &mut Vec<u8>, len: u32) {
    out.extend_from_slice(&[0xFE, 0xFF, 0x00, 0xE0]);
    out.extend_from_slice(&len.to_le_bytes());
}
