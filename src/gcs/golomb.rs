//! Big-endian bit streams and Golomb-Rice coding of `u64` deltas.
use crate::error::GcsError;

/// Accumulates bits MSB-first into bytes.
pub(crate) struct BitWriter {
    buf: Vec<u8>,
    current: u8,
    used: u8,
}

impl BitWriter {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::new(),
            current: 0,
            used: 0,
        }
    }

    /// Write the low `nbits` of `value`, most significant first.
    pub(crate) fn write(&mut self, value: u64, nbits: u8) {
        debug_assert!(nbits <= 64);
        let mut remaining = nbits;
        while remaining > 0 {
            let free = 8 - self.used;
            let take = free.min(remaining);
            let shift = remaining - take;
            let mask = if take == 8 { 0xff } else { (1u8 << take) - 1 };
            let chunk = ((value >> shift) as u8) & mask;
            self.current |= chunk << (free - take);
            self.used += take;
            remaining -= take;
            if self.used == 8 {
                self.buf.push(self.current);
                self.current = 0;
                self.used = 0;
            }
        }
    }

    /// Pad the final partial byte with zeros and return the buffer.
    pub(crate) fn finish(mut self) -> Vec<u8> {
        if self.used > 0 {
            self.buf.push(self.current);
        }
        self.buf
    }
}

/// Reads bits MSB-first out of a byte slice.
pub(crate) struct BitReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() * 8 - self.offset
    }

    /// Read `nbits` (≤ 64) as an unsigned integer; `None` past the end.
    pub(crate) fn read(&mut self, nbits: u8) -> Option<u64> {
        if usize::from(nbits) > self.remaining() {
            return None;
        }
        let mut value = 0u64;
        let mut remaining = nbits;
        while remaining > 0 {
            let byte = self.data[self.offset / 8];
            let used = (self.offset % 8) as u8;
            let avail = 8 - used;
            let take = avail.min(remaining);
            let chunk = (byte >> (avail - take)) & if take == 8 { 0xff } else { (1u8 << take) - 1 };
            value = (value << take) | u64::from(chunk);
            self.offset += usize::from(take);
            remaining -= take;
        }
        Some(value)
    }

    fn read_bit(&mut self) -> Option<bool> {
        self.read(1).map(|b| b == 1)
    }
}

/// Unary quotient (`1`s terminated by `0`), then `bits` raw remainder bits.
pub(crate) fn encode(writer: &mut BitWriter, value: u64, bits: u8) {
    let mut quotient = value >> bits;
    while quotient > 0 {
        let run = quotient.min(64) as u8;
        writer.write(u64::MAX, run);
        quotient -= u64::from(run);
    }
    writer.write(0, 1);
    writer.write(value, bits);
}

/// Inverse of [`encode`]; `None` when the stream runs out.
pub(crate) fn decode(reader: &mut BitReader<'_>, bits: u8) -> Option<u64> {
    let mut quotient = 0u64;
    while reader.read_bit()? {
        quotient += 1;
    }
    let remainder = reader.read(bits)?;
    Some((quotient << bits) | remainder)
}

/// Golomb-Rice encode a sorted set as successive deltas.
pub(crate) fn encode_set(sorted: &[u64], bits: u8) -> Result<Vec<u8>, GcsError> {
    let mut writer = BitWriter::new();
    let mut last = 0u64;
    for &value in sorted {
        let delta = value.checked_sub(last).ok_or(GcsError::Unsorted)?;
        encode(&mut writer, delta, bits);
        last = value;
    }
    Ok(writer.finish())
}

/// Decode `count` deltas back into the sorted set.
pub(crate) fn decode_set(data: &[u8], count: u32, bits: u8) -> Result<Vec<u64>, GcsError> {
    let mut reader = BitReader::new(data);
    // each value takes at least `bits + 1` bits; `count` comes off the wire
    let fits = data.len() * 8 / (usize::from(bits) + 1);
    let mut out = Vec::with_capacity((count as usize).min(fits));
    let mut last = 0u64;
    for decoded in 0..count {
        let delta = decode(&mut reader, bits).ok_or(GcsError::Truncated {
            decoded,
            expected: count,
        })?;
        last = last.checked_add(delta).ok_or(GcsError::Overflow)?;
        out.push(last);
    }
    Ok(out)
}
