/// Code page 437 to Unicode decoding.
///
/// Boards emit raw CP437 bytes. ASCII (0x20..=0x7E) and the control bytes
/// the terminal interprets (CR, LF, BS, TAB, ESC, BEL) pass through; every
/// high byte goes through the table below.

// 0x80..=0xFF, in code page order.
const HIGH: [char; 128] = [
    'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å',
    'É', 'æ', 'Æ', 'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', '¢', '£', '¥', '₧', 'ƒ',
    'á', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ª', 'º', '¿', '⌐', '¬', '½', '¼', '¡', '«', '»',
    '░', '▒', '▓', '│', '┤', '╡', '╢', '╖', '╕', '╣', '║', '╗', '╝', '╜', '╛', '┐',
    '└', '┴', '┬', '├', '─', '┼', '╞', '╟', '╚', '╔', '╩', '╦', '╠', '═', '╬', '╧',
    '╨', '╤', '╥', '╙', '╘', '╒', '╓', '╫', '╪', '┘', '┌', '█', '▄', '▌', '▐', '▀',
    'α', 'ß', 'Γ', 'π', 'Σ', 'σ', 'µ', 'τ', 'Φ', 'Θ', 'Ω', 'δ', '∞', 'φ', 'ε', '∩',
    '≡', '±', '≥', '≤', '⌠', '⌡', '÷', '≈', '°', '∙', '·', '√', 'ⁿ', '²', '■', ' ',
];

/// Decode one CP437 byte. Control bytes below 0x20 are returned as-is so the
/// virtual terminal can interpret them.
pub fn decode_byte(b: u8) -> char {
    match b {
        0x00..=0x7F => b as char,
        _ => HIGH[(b - 0x80) as usize],
    }
}

/// Decode a chunk of CP437 bytes into a String.
pub fn decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| decode_byte(b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passthrough() {
        assert_eq!(decode(b"Hello, world!"), "Hello, world!");
    }

    #[test]
    fn test_control_bytes_preserved() {
        assert_eq!(decode(b"\r\n\x1b[2J"), "\r\n\x1b[2J");
    }

    #[test]
    fn test_box_drawing() {
        assert_eq!(decode(&[0xC9, 0xCD, 0xBB]), "╔═╗");
        assert_eq!(decode(&[0xB0, 0xB1, 0xB2, 0xDB]), "░▒▓█");
    }

    #[test]
    fn test_accented_letters() {
        assert_eq!(decode(&[0x82, 0xA1]), "éí");
    }
}
