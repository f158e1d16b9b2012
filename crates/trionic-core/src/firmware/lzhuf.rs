//! LZHUF (LZSS + adaptive Huffman) codec used for symbol name tables
//!
//! Stream layout: expanded size as little-endian u32, then the bit stream.

use crate::error::FirmwareError;

const N: usize = 4096;
const F: usize = 60;
const THRESHOLD: usize = 2;
const N_CHAR: usize = 256 - THRESHOLD + F;
const T: usize = N_CHAR * 2 - 1;
const R: usize = T - 1;
const MAX_FREQ: u32 = 0x8000;

/// Upper 6 bits of a match position: (code, prefix length) per leading byte
fn position_tables() -> ([u8; 256], [u8; 256]) {
    // (entries per code, number of codes, bit length)
    const GROUPS: [(usize, usize, u8); 6] =
        [(32, 1, 3), (16, 3, 4), (8, 8, 5), (4, 12, 6), (2, 24, 7), (1, 16, 8)];
    let mut d_code = [0u8; 256];
    let mut d_len = [0u8; 256];
    let mut idx = 0;
    let mut code = 0u8;
    for (per_code, codes, len) in GROUPS {
        for _ in 0..codes {
            for _ in 0..per_code {
                d_code[idx] = code;
                d_len[idx] = len;
                idx += 1;
            }
            code += 1;
        }
    }
    (d_code, d_len)
}

struct Huffman {
    freq: Vec<u32>,
    prnt: Vec<usize>,
    son: Vec<usize>,
}

impl Huffman {
    fn new() -> Self {
        let mut h = Self {
            freq: vec![0; T + 1],
            prnt: vec![0; T + N_CHAR],
            son: vec![0; T],
        };
        for i in 0..N_CHAR {
            h.freq[i] = 1;
            h.son[i] = i + T;
            h.prnt[i + T] = i;
        }
        let mut i = 0;
        let mut j = N_CHAR;
        while j <= R {
            h.freq[j] = h.freq[i] + h.freq[i + 1];
            h.son[j] = i;
            h.prnt[i] = j;
            h.prnt[i + 1] = j;
            i += 2;
            j += 1;
        }
        h.freq[T] = 0xFFFF;
        h.prnt[R] = 0;
        h
    }

    fn reconstruct(&mut self) {
        let mut j = 0;
        for i in 0..T {
            if self.son[i] >= T {
                self.freq[j] = (self.freq[i] + 1) / 2;
                self.son[j] = self.son[i];
                j += 1;
            }
        }

        let mut i = 0;
        let mut j = N_CHAR;
        while j < T {
            let f = self.freq[i] + self.freq[i + 1];
            self.freq[j] = f;
            let mut k = j - 1;
            while f < self.freq[k] {
                k -= 1;
            }
            k += 1;
            self.freq.copy_within(k..j, k + 1);
            self.freq[k] = f;
            self.son.copy_within(k..j, k + 1);
            self.son[k] = i;
            i += 2;
            j += 1;
        }

        for i in 0..T {
            let k = self.son[i];
            if k >= T {
                self.prnt[k] = i;
            } else {
                self.prnt[k] = i;
                self.prnt[k + 1] = i;
            }
        }
    }

    fn update(&mut self, c: usize) {
        if self.freq[R] == MAX_FREQ {
            self.reconstruct();
        }
        let mut c = self.prnt[c + T];
        loop {
            self.freq[c] += 1;
            let k = self.freq[c];
            let mut l = c + 1;
            if k > self.freq[l] {
                loop {
                    l += 1;
                    if k <= self.freq[l] {
                        break;
                    }
                }
                l -= 1;
                self.freq[c] = self.freq[l];
                self.freq[l] = k;

                let i = self.son[c];
                self.prnt[i] = l;
                if i < T {
                    self.prnt[i + 1] = l;
                }

                let j = self.son[l];
                self.son[l] = i;

                self.prnt[j] = c;
                if j < T {
                    self.prnt[j + 1] = c;
                }
                self.son[c] = j;

                c = l;
            }
            c = self.prnt[c];
            if c == 0 {
                break;
            }
        }
    }
}

struct BitReader<'a> {
    input: &'a [u8],
    pos: usize,
    buf: u16,
    len: u8,
}

impl<'a> BitReader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            buf: 0,
            len: 0,
        }
    }

    fn fill(&mut self) {
        while self.len <= 8 {
            let b = self.input.get(self.pos).copied().unwrap_or(0);
            self.pos += 1;
            self.buf |= (b as u16) << (8 - self.len);
            self.len += 8;
        }
    }

    fn bit(&mut self) -> usize {
        self.fill();
        let bit = (self.buf >> 15) as usize;
        self.buf <<= 1;
        self.len -= 1;
        bit
    }

    fn byte(&mut self) -> usize {
        self.fill();
        let b = (self.buf >> 8) as usize;
        self.buf <<= 8;
        self.len -= 8;
        b
    }
}

/// Decompress an LZHUF stream (size header included)
pub fn decode(input: &[u8]) -> Result<Vec<u8>, FirmwareError> {
    if input.len() < 4 {
        return Err(FirmwareError::Lzhuf("missing size header".into()));
    }
    let size = u32::from_le_bytes([input[0], input[1], input[2], input[3]]) as usize;
    if size == 0 {
        return Ok(Vec::new());
    }
    // A name table never expands beyond a flash image's worth of text per input byte
    if size == u32::MAX as usize || size > input.len().saturating_mul(64).max(N) {
        return Err(FirmwareError::Lzhuf(format!(
            "implausible expanded size {} for {} input bytes",
            size,
            input.len()
        )));
    }

    let (d_code, d_len) = position_tables();
    let mut huff = Huffman::new();
    let mut bits = BitReader::new(&input[4..]);
    let mut text = [b' '; N];
    let mut r = N - F;
    let mut out = Vec::with_capacity(size);

    while out.len() < size {
        let mut c = huff.son[R];
        while c < T {
            c += bits.bit();
            c = huff.son[c];
        }
        c -= T;
        huff.update(c);

        if c < 256 {
            out.push(c as u8);
            text[r] = c as u8;
            r = (r + 1) & (N - 1);
        } else {
            let i = bits.byte();
            let mut pos = (d_code[i] as usize) << 6;
            let mut low = i;
            for _ in 0..(d_len[i] - 2) {
                low = (low << 1) + bits.bit();
            }
            pos |= low & 0x3F;

            let start = (r.wrapping_sub(pos).wrapping_sub(1)) & (N - 1);
            let count = c - 255 + THRESHOLD;
            for k in 0..count {
                let b = text[(start + k) & (N - 1)];
                out.push(b);
                text[r] = b;
                r = (r + 1) & (N - 1);
                if out.len() == size {
                    break;
                }
            }
        }
    }

    if bits.pos > input.len() - 4 + 2 {
        return Err(FirmwareError::Lzhuf(format!(
            "stream ended early: produced {} of {} bytes",
            out.len(),
            size
        )));
    }
    Ok(out)
}

struct BitWriter {
    out: Vec<u8>,
    acc: u32,
    len: u8,
}

impl BitWriter {
    fn push(&mut self, bit: bool) {
        self.acc = (self.acc << 1) | bit as u32;
        self.len += 1;
        if self.len == 8 {
            self.out.push(self.acc as u8);
            self.acc = 0;
            self.len = 0;
        }
    }

    fn push_bits(&mut self, value: u32, count: u8) {
        for i in (0..count).rev() {
            self.push((value >> i) & 1 == 1);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.len > 0 {
            self.acc <<= 8 - self.len;
            self.out.push(self.acc as u8);
        }
        self.out
    }
}

/// Compress with a plain longest-match search over the sliding window
pub fn encode(input: &[u8]) -> Vec<u8> {
    let (d_code, d_len) = position_tables();
    let mut p_code = [0u8; 64];
    let mut p_len = [0u8; 64];
    for i in (0..256).rev() {
        p_code[d_code[i] as usize] = i as u8;
        p_len[d_code[i] as usize] = d_len[i];
    }

    let mut huff = Huffman::new();
    let mut out = BitWriter {
        out: (input.len() as u32).to_le_bytes().to_vec(),
        acc: 0,
        len: 0,
    };
    let mut text = [b' '; N];
    let mut r = N - F;
    let mut filled = N - F;
    let mut i = 0;

    let encode_char = |huff: &mut Huffman, out: &mut BitWriter, c: usize| {
        let mut path = Vec::new();
        let mut k = huff.prnt[c + T];
        loop {
            path.push(k & 1 == 1);
            k = huff.prnt[k];
            if k == R {
                break;
            }
        }
        for bit in path.into_iter().rev() {
            out.push(bit);
        }
        huff.update(c);
    };

    while i < input.len() {
        let max_len = F.min(input.len() - i);
        let mut best_len = 0;
        let mut best_pos = 0;
        if max_len > THRESHOLD {
            for back in 1..filled.min(N - F) {
                let start = (r + N - back) & (N - 1);
                let mut len = 0;
                while len < max_len && len < back && text[(start + len) & (N - 1)] == input[i + len]
                {
                    len += 1;
                }
                if len > best_len {
                    best_len = len;
                    best_pos = back - 1;
                    if len == max_len {
                        break;
                    }
                }
            }
        }

        let take = if best_len > THRESHOLD {
            encode_char(&mut huff, &mut out, 255 - THRESHOLD + best_len);
            let hi = best_pos >> 6;
            out.push_bits(p_code[hi] as u32 >> (8 - p_len[hi]), p_len[hi]);
            out.push_bits((best_pos & 0x3F) as u32, 6);
            best_len
        } else {
            encode_char(&mut huff, &mut out, input[i] as usize);
            1
        };

        for &b in &input[i..i + take] {
            text[r] = b;
            r = (r + 1) & (N - 1);
        }
        filled = (filled + take).min(N);
        i += take;
    }

    out.finish()
}
