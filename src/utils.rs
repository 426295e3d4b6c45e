use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read, stdin};
use std::path::Path;

#[path = "utils_test.rs"]
mod utils_test;

/// Encode an ASCII nucleotide as a 2-bit code; anything that is not
/// A/C/G/T (either case) maps to 4 (ambiguous).
#[inline]
pub fn base_to_code(b: u8) -> u8 {
    match b.to_ascii_uppercase() {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' => 3,
        _ => 4,
    }
}

/// Decode a base code back to its ASCII letter.
#[inline]
pub fn code_to_base(c: u8) -> u8 {
    match c {
        0 => b'A',
        1 => b'C',
        2 => b'G',
        3 => b'T',
        _ => b'N',
    }
}

/// Complement of a base code; ambiguous stays ambiguous.
#[inline]
pub fn complement_code(c: u8) -> u8 {
    if c < 4 { 3 - c } else { 4 }
}

/// Reverse-complement a code sequence in place.
pub fn reverse_complement_in_place(seq: &mut [u8]) {
    seq.reverse();
    for b in seq.iter_mut() {
        *b = complement_code(*b);
    }
}

/// Open a path for buffered reading, transparently decompressing gzip by
/// extension. "-" reads from stdin.
pub fn xopen(path: &Path) -> io::Result<Box<dyn Read>> {
    if path.to_str() == Some("-") {
        return Ok(Box::new(stdin()));
    }
    let file = File::open(path)?;
    if path.extension().is_some_and(|e| e == "gz") {
        Ok(Box::new(MultiGzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}
