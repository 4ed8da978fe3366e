//! `HexDump` diagnostic toggle. Off by default, purely a debugging aid.

pub fn format(data: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in data.chunks(16).enumerate() {
        out.push_str(&format!("{:06X}  ", row * 16));
        for byte in chunk {
            out.push_str(&format!("{byte:02X} "));
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        for &byte in chunk {
            let c = byte as char;
            out.push(if c.is_ascii_graphic() || c == ' ' { c } else { '.' });
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_short_buffer_on_one_line() {
        let rendered = format(b"hi");
        assert!(rendered.starts_with("000000  "));
        assert!(rendered.contains("hi"));
    }
}
