use sha1::{Digest, Sha1};

/// A single fuzzing input: an owned byte sequence.
pub type Unit = Vec<u8>;

pub const SHA1_NUM_BYTES: usize = 20;

/// Content identity of a unit.
pub type Sha1Digest = [u8; SHA1_NUM_BYTES];

pub fn sha1_digest(data: &[u8]) -> Sha1Digest {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn sha1_hex(digest: &Sha1Digest) -> String {
    let mut out = String::with_capacity(SHA1_NUM_BYTES * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Hex SHA-1 of a unit, used for corpus filenames and artifact suffixes.
pub fn unit_hash(data: &[u8]) -> String {
    sha1_hex(&sha1_digest(data))
}

pub fn is_ascii_unit(data: &[u8]) -> bool {
    data.iter().all(|&b| b.is_ascii())
}

/// Clamp a unit to printable ASCII in place.
pub fn to_ascii(data: &mut [u8]) {
    for byte in data.iter_mut() {
        *byte &= 0x7f;
        if !byte.is_ascii_graphic() && !byte.is_ascii_whitespace() {
            *byte = b' ';
        }
    }
}

pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for byte in data {
        out.push_str(&format!("0x{byte:02x},"));
    }
    out
}

pub fn ascii_dump(data: &[u8]) -> String {
    data.iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_known_vector() {
        // FIPS 180-1 appendix A.
        assert_eq!(unit_hash(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn sha1_hex_roundtrips_digest_bytes() {
        let digest = sha1_digest(b"parallax");
        let hex = sha1_hex(&digest);
        assert_eq!(hex.len(), SHA1_NUM_BYTES * 2);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn to_ascii_produces_ascii() {
        let mut data = vec![0x00, 0x41, 0xff, 0x0a, 0x80];
        to_ascii(&mut data);
        assert!(is_ascii_unit(&data));
        assert_eq!(data[1], b'A');
        assert_eq!(data[3], b'\n');
    }

    #[test]
    fn dumps_are_printable() {
        assert_eq!(hex_dump(&[0x41, 0x00]), "0x41,0x00,");
        assert_eq!(ascii_dump(&[0x41, 0x00, 0x20]), "A. ");
    }
}
