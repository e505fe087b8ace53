use std::io::{Read, Result, Write};

/// DNS messages over TCP are prefixed with a two byte big endian length
pub fn read_packet_length<R: Read>(stream: &mut R) -> Result<u16> {
    let mut len_buffer = [0; 2];
    stream.read_exact(&mut len_buffer)?;

    Ok(((len_buffer[0] as u16) << 8) | (len_buffer[1] as u16))
}

pub fn write_packet_length<W: Write>(stream: &mut W, len: usize) -> Result<()> {
    let mut len_buffer = [0; 2];
    len_buffer[0] = (len >> 8) as u8;
    len_buffer[1] = (len & 0xFF) as u8;

    stream.write_all(&len_buffer)?;

    Ok(())
}

#[cfg(test)]
mod tests {

    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_length_prefix_roundtrip() {
        let mut framed = Vec::new();
        write_packet_length(&mut framed, 0x1234).unwrap();

        let mut cursor = Cursor::new(framed);
        assert_eq!(0x1234, read_packet_length(&mut cursor).unwrap());
    }
}
