//! Reader serial number, derived at boot from the MCU unique-id registers.

use crate::crpm::SERIAL_LEN;

/// Builds the 25-character serial: three unique-id words hex-encoded
/// nibble by nibble (least significant first), padded with a filler.
#[must_use]
pub fn serial_number(uid_words: [u32; 3]) -> [u8; SERIAL_LEN] {
    let mut serial = [b'0'; SERIAL_LEN];
    for (index, word) in uid_words.iter().enumerate() {
        num_to_hex(*word, &mut serial[index * 8..(index + 1) * 8]);
    }
    serial[24] = b'R'; // Filler constant
    serial
}

fn num_to_hex(mut num: u32, dest: &mut [u8]) {
    for byte in dest {
        *byte = b"0123456789ABCDEF"[(num & 0xF) as usize];
        num >>= 4;
    }
}
