//! First-byte protocol sniffing: a binary-protocol request always begins with the
//! magic byte `0x80`; everything else is treated as the text protocol.

use memc_protocol::binary::MAGIC_REQUEST;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Text,
    Binary,
}

pub fn detect(first_byte: u8) -> Dialect {
    if first_byte == MAGIC_REQUEST {
        Dialect::Binary
    } else {
        Dialect::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_byte_selects_binary() {
        assert_eq!(detect(0x80), Dialect::Binary);
    }

    #[test]
    fn ascii_selects_text() {
        assert_eq!(detect(b'g'), Dialect::Text);
    }
}
