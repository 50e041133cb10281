//! TFRecord shards of `tf.train.Example` messages.
//!
//! A record is framed as `u64 length (LE) | u32 masked crc32c(length) | payload |
//! u32 masked crc32c(payload)`. Only the subset of the protobuf wire format used
//! by `Example` is decoded.
use std::collections::BTreeMap;
use std::io::{self, Read, Write};

const MASK_DELTA: u32 = 0xa282_ead8;

const fn crc32c_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 == 1 { (crc >> 1) ^ 0x82f6_3b78 } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const CRC32C_TABLE: [u32; 256] = crc32c_table();

pub fn crc32c(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &b in data {
        crc = CRC32C_TABLE[((crc ^ b as u32) & 0xff) as usize] ^ (crc >> 8);
    }
    !crc
}

pub fn masked_crc(data: &[u8]) -> u32 {
    let crc = crc32c(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Iterates over the raw payloads of a TFRecord stream.
pub struct TfRecordReader<R> {
    reader: R,
    verify: bool,
    done: bool,
}

impl<R: Read> TfRecordReader<R> {
    pub fn new(reader: R) -> Self {
        TfRecordReader { reader, verify: true, done: false }
    }

    pub fn skip_checksums(mut self) -> Self {
        self.verify = false;
        self
    }

    fn read_record(&mut self) -> Result<Option<Vec<u8>>, String> {
        let mut header = [0u8; 12];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.reader.read(&mut header[filled..]).map_err(|e| e.to_string())?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < header.len() {
            return Err(format!("truncated record header ({filled} bytes)"));
        }
        let (len_bytes, len_crc) = header.split_at(8);
        let len_crc = u32::from_le_bytes([len_crc[0], len_crc[1], len_crc[2], len_crc[3]]);
        if self.verify && masked_crc(len_bytes) != len_crc {
            return Err("length checksum mismatch".into());
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(len_bytes);
        let len = u64::from_le_bytes(len) as usize;

        let mut payload = vec![0u8; len];
        self.reader
            .read_exact(&mut payload)
            .map_err(|e| format!("truncated payload of {len} bytes: {e}"))?;
        let mut crc = [0u8; 4];
        self.reader
            .read_exact(&mut crc)
            .map_err(|e| format!("missing payload checksum: {e}"))?;
        if self.verify && masked_crc(&payload) != u32::from_le_bytes(crc) {
            return Err("payload checksum mismatch".into());
        }
        Ok(Some(payload))
    }
}

impl<R: Read> Iterator for TfRecordReader<R> {
    type Item = Result<Vec<u8>, String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

pub fn write_record<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = (payload.len() as u64).to_le_bytes();
    writer.write_all(&len)?;
    writer.write_all(&masked_crc(&len).to_le_bytes())?;
    writer.write_all(payload)?;
    writer.write_all(&masked_crc(payload).to_le_bytes())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Feature {
    Bytes(Vec<Vec<u8>>),
    Float(Vec<f32>),
    Int64(Vec<i64>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Example {
    pub features: BTreeMap<String, Feature>,
}

struct Wire<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Wire<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Wire { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn varint(&mut self) -> Result<u64, String> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = *self.buf.get(self.pos).ok_or("truncated varint")?;
            self.pos += 1;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err("varint longer than 10 bytes".into())
    }

    fn key(&mut self) -> Result<(u64, u8), String> {
        let key = self.varint()?;
        Ok((key >> 3, (key & 0x7) as u8))
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len()).ok_or("truncated field")?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn len_delimited(&mut self) -> Result<&'a [u8], String> {
        let n = self.varint()? as usize;
        self.bytes(n)
    }

    fn fixed32(&mut self) -> Result<[u8; 4], String> {
        let b = self.bytes(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }

    fn skip(&mut self, wire_type: u8) -> Result<(), String> {
        match wire_type {
            0 => self.varint().map(|_| ()),
            1 => self.bytes(8).map(|_| ()),
            2 => self.len_delimited().map(|_| ()),
            5 => self.bytes(4).map(|_| ()),
            t => Err(format!("unsupported wire type {t}")),
        }
    }
}

fn decode_feature(buf: &[u8]) -> Result<Feature, String> {
    let mut wire = Wire::new(buf);
    let mut feature = None;
    while !wire.is_empty() {
        let (field, wt) = wire.key()?;
        if wt != 2 || !(1..=3).contains(&field) {
            wire.skip(wt)?;
            continue;
        }
        let mut list = Wire::new(wire.len_delimited()?);
        feature = Some(match field {
            1 => {
                let mut values = Vec::new();
                while !list.is_empty() {
                    let (f, wt) = list.key()?;
                    if f == 1 && wt == 2 {
                        values.push(list.len_delimited()?.to_vec());
                    } else {
                        list.skip(wt)?;
                    }
                }
                Feature::Bytes(values)
            }
            2 => {
                let mut values = Vec::new();
                while !list.is_empty() {
                    match list.key()? {
                        (1, 2) => {
                            let mut packed = Wire::new(list.len_delimited()?);
                            while !packed.is_empty() {
                                values.push(f32::from_le_bytes(packed.fixed32()?));
                            }
                        }
                        (1, 5) => values.push(f32::from_le_bytes(list.fixed32()?)),
                        (_, wt) => list.skip(wt)?,
                    }
                }
                Feature::Float(values)
            }
            _ => {
                let mut values = Vec::new();
                while !list.is_empty() {
                    match list.key()? {
                        (1, 2) => {
                            let mut packed = Wire::new(list.len_delimited()?);
                            while !packed.is_empty() {
                                values.push(packed.varint()? as i64);
                            }
                        }
                        (1, 0) => values.push(list.varint()? as i64),
                        (_, wt) => list.skip(wt)?,
                    }
                }
                Feature::Int64(values)
            }
        });
    }
    feature.ok_or_else(|| "feature without a value list".to_string())
}

impl Example {
    pub fn decode(buf: &[u8]) -> Result<Example, String> {
        let mut example = Example::default();
        let mut wire = Wire::new(buf);
        while !wire.is_empty() {
            let (field, wt) = wire.key()?;
            if field != 1 || wt != 2 {
                wire.skip(wt)?;
                continue;
            }
            let mut features = Wire::new(wire.len_delimited()?);
            while !features.is_empty() {
                let (field, wt) = features.key()?;
                if field != 1 || wt != 2 {
                    features.skip(wt)?;
                    continue;
                }
                let mut entry = Wire::new(features.len_delimited()?);
                let mut key = String::new();
                let mut value = None;
                while !entry.is_empty() {
                    match entry.key()? {
                        (1, 2) => {
                            key = String::from_utf8(entry.len_delimited()?.to_vec())
                                .map_err(|_| "feature name is not utf-8")?;
                        }
                        (2, 2) => value = Some(decode_feature(entry.len_delimited()?)?),
                        (_, wt) => entry.skip(wt)?,
                    }
                }
                if let Some(value) = value {
                    example.features.insert(key, value);
                }
            }
        }
        Ok(example)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut features = Vec::new();
        for (key, feature) in &self.features {
            let mut list = Vec::new();
            let field = match feature {
                Feature::Bytes(values) => {
                    for v in values {
                        put_len_delimited(&mut list, 1, v);
                    }
                    1
                }
                Feature::Float(values) => {
                    let packed: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                    put_len_delimited(&mut list, 1, &packed);
                    2
                }
                Feature::Int64(values) => {
                    let mut packed = Vec::new();
                    for &v in values {
                        put_varint(&mut packed, v as u64);
                    }
                    put_len_delimited(&mut list, 1, &packed);
                    3
                }
            };
            let mut value = Vec::new();
            put_len_delimited(&mut value, field, &list);

            let mut entry = Vec::new();
            put_len_delimited(&mut entry, 1, key.as_bytes());
            put_len_delimited(&mut entry, 2, &value);
            put_len_delimited(&mut features, 1, &entry);
        }
        let mut out = Vec::new();
        put_len_delimited(&mut out, 1, &features);
        out
    }

    pub fn bytes(&self, key: &str) -> Option<&[u8]> {
        match self.features.get(key) {
            Some(Feature::Bytes(v)) => v.first().map(|b| b.as_slice()),
            _ => None,
        }
    }

    pub fn int64(&self, key: &str) -> Option<i64> {
        match self.features.get(key) {
            Some(Feature::Int64(v)) => v.first().copied(),
            _ => None,
        }
    }
}

fn put_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn put_len_delimited(out: &mut Vec<u8>, field: u64, data: &[u8]) {
    put_varint(out, (field << 3) | 2);
    put_varint(out, data.len() as u64);
    out.extend_from_slice(data);
}
