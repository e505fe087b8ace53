//! buffers for reading and writing DNS packets, transport agnostic

use std::collections::BTreeMap;
use std::io::Read;

use derive_more::{Display, Error, From};

#[derive(Debug, Display, From, Error)]
pub enum BufferError {
    Io(std::io::Error),
    #[display(fmt = "End of buffer")]
    EndOfBuffer,
    #[display(fmt = "Too many jumps in compressed name")]
    JumpLimitExceeded,
}

type Result<T> = std::result::Result<T, BufferError>;

/// Common interface for the byte, vector and stream backed packet buffers
///
/// Reading and writing of integers and qnames is implemented on top of the
/// small set of required primitives, so the wire logic in `protocol` never
/// has to care which buffer it is operating on.
pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;
    fn get(&mut self, pos: usize) -> Result<u8>;
    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]>;
    fn write(&mut self, val: u8) -> Result<()>;
    fn set(&mut self, pos: usize, val: u8) -> Result<()>;
    fn pos(&self) -> usize;
    fn seek(&mut self, pos: usize) -> Result<()>;
    fn step(&mut self, steps: usize) -> Result<()>;

    /// Look up a previously written label sequence for compression. Buffers
    /// that don't support compression just return None here.
    fn find_label(&self, label: &str) -> Option<usize>;
    fn save_label(&mut self, label: &str, pos: usize);

    fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(val)
    }

    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write_u16((val >> 16) as u16)?;
        self.write_u16((val & 0xFFFF) as u16)?;

        Ok(())
    }

    /// Write a qname, compressing any tail that has been written before
    fn write_qname(&mut self, qname: &str) -> Result<()> {
        let split_str = qname.split('.').collect::<Vec<&str>>();

        let mut jump_performed = false;
        for (i, label) in split_str.iter().enumerate() {
            if label.is_empty() {
                continue;
            }

            let search_lbl = split_str[i..]
                .iter()
                .filter(|x| !x.is_empty())
                .cloned()
                .collect::<Vec<&str>>()
                .join(".");

            if let Some(prev_pos) = self.find_label(&search_lbl) {
                let jump_inst = (prev_pos as u16) | 0xC000;
                self.write_u16(jump_inst)?;
                jump_performed = true;
                break;
            }

            let pos = self.pos();
            self.save_label(&search_lbl, pos);

            self.write_u8(label.len() as u8)?;
            for b in label.as_bytes() {
                self.write_u8(*b)?;
            }
        }

        if !jump_performed {
            self.write_u8(0)?;
        }

        Ok(())
    }

    fn set_u16(&mut self, pos: usize, val: u16) -> Result<()> {
        self.set(pos, (val >> 8) as u8)?;
        self.set(pos + 1, (val & 0xFF) as u8)?;

        Ok(())
    }

    fn read_u16(&mut self) -> Result<u16> {
        let res = ((self.read()? as u16) << 8) | (self.read()? as u16);

        Ok(res)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let res = ((self.read()? as u32) << 24)
            | ((self.read()? as u32) << 16)
            | ((self.read()? as u32) << 8)
            | (self.read()? as u32);

        Ok(res)
    }

    /// Read a qname, following compression pointers
    ///
    /// The position is left just past the name in the original read sequence,
    /// regardless of any jumps taken. A cap on the number of jumps guards
    /// against pointer loops in malformed packets.
    fn read_qname(&mut self, outstr: &mut String) -> Result<()> {
        let mut pos = self.pos();
        let mut jumped = false;
        let mut jumps = 0;

        let mut delim = "";
        loop {
            if jumps > 5 {
                return Err(BufferError::JumpLimitExceeded);
            }

            let len = self.get(pos)?;

            // A length byte with the two high bits set is a jump
            if (len & 0xC0) == 0xC0 {
                if !jumped {
                    self.seek(pos + 2)?;
                }

                let b2 = self.get(pos + 1)? as u16;
                let offset = (((len as u16) ^ 0xC0) << 8) | b2;
                pos = offset as usize;
                jumped = true;
                jumps += 1;
                continue;
            }

            pos += 1;

            if len == 0 {
                break;
            }

            outstr.push_str(delim);

            let str_buffer = self.get_range(pos, len as usize)?;
            outstr.push_str(&String::from_utf8_lossy(str_buffer).to_lowercase());

            delim = ".";
            pos += len as usize;
        }

        if !jumped {
            self.seek(pos)?;
        }

        Ok(())
    }
}

/// Growable buffer with label compression, used for building replies
pub struct VectorPacketBuffer {
    pub buffer: Vec<u8>,
    pub pos: usize,
    label_lookup: BTreeMap<String, usize>,
    compress: bool,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: Vec::new(),
            pos: 0,
            label_lookup: BTreeMap::new(),
            compress: true,
        }
    }

    /// Buffer that never emits compression pointers
    pub fn without_compression() -> VectorPacketBuffer {
        VectorPacketBuffer {
            compress: false,
            ..VectorPacketBuffer::new()
        }
    }

    /// Wrap raw received bytes for parsing
    pub fn from_bytes(data: &[u8]) -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: data.to_vec(),
            ..VectorPacketBuffer::new()
        }
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn read(&mut self) -> Result<u8> {
        if self.pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }

        let res = self.buffer[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        if pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }

        Ok(self.buffer[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }

        Ok(&self.buffer[start..start + len])
    }

    fn write(&mut self, val: u8) -> Result<()> {
        self.buffer.push(val);
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        if pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }

        self.buffer[pos] = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;

        Ok(())
    }

    fn find_label(&self, label: &str) -> Option<usize> {
        if !self.compress {
            return None;
        }

        self.label_lookup.get(label).cloned()
    }

    fn save_label(&mut self, label: &str, pos: usize) {
        if !self.compress {
            return;
        }

        self.label_lookup.insert(label.to_string(), pos);
    }
}

/// Fixed 512 byte buffer, sized for a plain UDP datagram
pub struct BytePacketBuffer {
    pub buf: [u8; 512],
    pub pos: usize,
}

impl Default for BytePacketBuffer {
    fn default() -> Self {
        BytePacketBuffer::new()
    }
}

impl BytePacketBuffer {
    pub fn new() -> BytePacketBuffer {
        BytePacketBuffer {
            buf: [0; 512],
            pos: 0,
        }
    }
}

impl PacketBuffer for BytePacketBuffer {
    fn read(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }

        let res = self.buf[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        if pos >= self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }

        Ok(self.buf[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }

        Ok(&self.buf[start..start + len])
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos >= self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }

        self.buf[self.pos] = val;
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        if pos >= self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }

        self.buf[pos] = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;

        Ok(())
    }

    fn find_label(&self, _: &str) -> Option<usize> {
        None
    }

    fn save_label(&mut self, _: &str, _: usize) {}
}

/// Buffer that pulls bytes from a stream on demand, for parsing queries
/// arriving over TCP without knowing their size up front
pub struct StreamPacketBuffer<'a, T>
where
    T: Read,
{
    pub stream: &'a mut T,
    pub buffer: Vec<u8>,
    pub pos: usize,
}

impl<'a, T> StreamPacketBuffer<'a, T>
where
    T: Read + 'a,
{
    pub fn new(stream: &'a mut T) -> StreamPacketBuffer<'a, T> {
        StreamPacketBuffer {
            stream,
            buffer: Vec::new(),
            pos: 0,
        }
    }

    fn fill_until(&mut self, pos: usize) -> Result<()> {
        while pos >= self.buffer.len() {
            let mut local_buffer = [0; 1];
            self.stream.read_exact(&mut local_buffer)?;
            self.buffer.push(local_buffer[0]);
        }

        Ok(())
    }
}

impl<'a, T> PacketBuffer for StreamPacketBuffer<'a, T>
where
    T: Read + 'a,
{
    fn read(&mut self) -> Result<u8> {
        self.fill_until(self.pos)?;

        let res = self.buffer[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        self.fill_until(pos)?;

        Ok(self.buffer[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        self.fill_until(start + len - 1)?;

        Ok(&self.buffer[start..start + len])
    }

    fn write(&mut self, _: u8) -> Result<()> {
        unimplemented!("StreamPacketBuffer is read only");
    }

    fn set(&mut self, _: usize, _: u8) -> Result<()> {
        unimplemented!("StreamPacketBuffer is read only");
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;

        Ok(())
    }

    fn find_label(&self, _: &str) -> Option<usize> {
        None
    }

    fn save_label(&mut self, _: &str, _: usize) {}
}
