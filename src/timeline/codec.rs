use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use super::chunk::Chunk;
use super::sample::{SampleToken, SampleValue};

// Payload tag bytes. The high bit marks a run: the tag byte is followed
// by a one-byte run count, then the value payload.
const TAG_MISSING: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_STRING: u8 = 3;
const RUN_FLAG: u8 = 0x80;

/// Losslessly narrows a sample before accumulation: a float carrying an
/// integral value is stored as an integer so the varint encoding applies.
/// Everything else passes through unchanged.
pub fn compress_sample(value: SampleValue) -> SampleValue {
    match value {
        SampleValue::Float(f)
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 =>
        {
            SampleValue::Int(f as i64)
        }
        other => other,
    }
}

/// Encodes a shared time axis: count, absolute first timestamp, then
/// run-length collapsed millisecond deltas.
pub fn encode_times(times: &[DateTime<Utc>]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + times.len());
    write_varint(&mut buf, times.len() as u64);
    let Some(first) = times.first() else {
        return buf;
    };
    write_zigzag(&mut buf, first.timestamp_millis());

    let mut run_delta: Option<i64> = None;
    let mut run_len: u64 = 0;
    let mut prev = first.timestamp_millis();
    for t in &times[1..] {
        let delta = t.timestamp_millis() - prev;
        prev = t.timestamp_millis();
        match run_delta {
            Some(d) if d == delta => run_len += 1,
            Some(d) => {
                write_varint(&mut buf, run_len);
                write_zigzag(&mut buf, d);
                run_delta = Some(delta);
                run_len = 1;
            }
            None => {
                run_delta = Some(delta);
                run_len = 1;
            }
        }
    }
    if let Some(d) = run_delta {
        write_varint(&mut buf, run_len);
        write_zigzag(&mut buf, d);
    }
    buf
}

/// Decodes a time axis back into the exact timestamp list.
pub fn decode_times(bytes: &[u8]) -> Result<Vec<DateTime<Utc>>> {
    let mut cursor = Cursor::new(bytes);
    let count = cursor.read_varint()? as usize;
    let mut times = Vec::with_capacity(count);
    if count == 0 {
        return Ok(times);
    }

    let mut current = cursor.read_zigzag()?;
    times.push(millis_to_datetime(current)?);
    while times.len() < count {
        let run = cursor.read_varint()?;
        let delta = cursor.read_zigzag()?;
        for _ in 0..run {
            current += delta;
            times.push(millis_to_datetime(current)?);
            if times.len() > count {
                bail!("time axis runs exceed declared count {count}");
            }
        }
    }
    Ok(times)
}

/// Serializes run-length sample tokens into the chunk payload format.
pub fn encode_samples(tokens: &[SampleToken]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(tokens.len() * 2);
    for token in tokens {
        // A token's count is bounded by MAX_RUN, so it fits in one byte.
        let mut remaining = token.count;
        while remaining > 0 {
            let run = remaining.min(u16::from(u8::MAX)) as u8;
            remaining -= u16::from(run);
            let tag = value_tag(&token.value);
            if run == 1 {
                buf.push(tag);
            } else {
                buf.push(tag | RUN_FLAG);
                buf.push(run);
            }
            write_value_payload(&mut buf, &token.value);
        }
    }
    buf
}

/// Decodes a chunk payload, expanding runs, and checks the total against
/// the expected sample count.
pub fn decode_samples(bytes: &[u8], expected_count: usize) -> Result<Vec<SampleValue>> {
    let mut cursor = Cursor::new(bytes);
    let mut out = Vec::with_capacity(expected_count);
    while !cursor.is_empty() {
        let tag = cursor.read_u8()?;
        let run = if tag & RUN_FLAG != 0 {
            cursor.read_u8()?
        } else {
            1
        };
        let value = read_value_payload(&mut cursor, tag & !RUN_FLAG)?;
        for _ in 0..run {
            out.push(value.clone());
        }
    }
    if out.len() != expected_count {
        bail!(
            "sample payload decoded {} values, chunk declares {}",
            out.len(),
            expected_count
        );
    }
    Ok(out)
}

/// Decodes a whole chunk into (timestamp, value) pairs.
pub fn decode_chunk(chunk: &Chunk) -> Result<Vec<(DateTime<Utc>, SampleValue)>> {
    let times = decode_times(&chunk.time_bytes).context("decoding chunk time axis")?;
    let samples =
        decode_samples(&chunk.sample_bytes, chunk.sample_count).context("decoding chunk payload")?;
    if times.len() != samples.len() {
        bail!(
            "chunk time axis has {} entries but payload has {}",
            times.len(),
            samples.len()
        );
    }
    Ok(times.into_iter().zip(samples).collect())
}

fn value_tag(value: &SampleValue) -> u8 {
    match value {
        SampleValue::Missing => TAG_MISSING,
        SampleValue::Int(_) => TAG_INT,
        SampleValue::Float(_) => TAG_FLOAT,
        SampleValue::Tag(_) => TAG_STRING,
    }
}

fn write_value_payload(buf: &mut Vec<u8>, value: &SampleValue) {
    match value {
        SampleValue::Missing => {}
        SampleValue::Int(i) => write_zigzag(buf, *i),
        SampleValue::Float(f) => buf.extend_from_slice(&f.to_bits().to_le_bytes()),
        SampleValue::Tag(s) => {
            write_varint(buf, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
    }
}

fn read_value_payload(cursor: &mut Cursor<'_>, tag: u8) -> Result<SampleValue> {
    match tag {
        TAG_MISSING => Ok(SampleValue::Missing),
        TAG_INT => Ok(SampleValue::Int(cursor.read_zigzag()?)),
        TAG_FLOAT => {
            let bits = u64::from_le_bytes(cursor.read_array()?);
            Ok(SampleValue::Float(f64::from_bits(bits)))
        }
        TAG_STRING => {
            let len = cursor.read_varint()? as usize;
            let raw = cursor.read_slice(len)?;
            Ok(SampleValue::Tag(
                std::str::from_utf8(raw)
                    .context("sample tag payload is not UTF-8")?
                    .to_string(),
            ))
        }
        other => bail!("unknown sample payload tag {other}"),
    }
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .with_context(|| format!("timestamp {millis}ms out of range"))
}

// --- varint helpers ---

fn write_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn write_zigzag(buf: &mut Vec<u8>, v: i64) {
    write_varint(buf, ((v << 1) ^ (v >> 63)) as u64);
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn read_u8(&mut self) -> Result<u8> {
        let Some(&b) = self.bytes.get(self.pos) else {
            bail!("truncated payload at offset {}", self.pos);
        };
        self.pos += 1;
        Ok(b)
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        // A hostile length near usize::MAX must not wrap the offset math.
        let slice = self
            .pos
            .checked_add(len)
            .and_then(|end| self.bytes.get(self.pos..end));
        let Some(slice) = slice else {
            bail!("truncated payload: need {len} bytes at offset {}", self.pos);
        };
        self.pos += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.read_slice(N)?;
        Ok(slice.try_into().expect("slice length checked"))
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut v = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            v |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
            if shift >= 64 {
                bail!("varint overflows u64");
            }
        }
    }

    fn read_zigzag(&mut self) -> Result<i64> {
        let v = self.read_varint()?;
        Ok(((v >> 1) as i64) ^ -((v & 1) as i64))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::super::sample::MetricTimeline;
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_time_axis_round_trip() {
        let times = vec![ts(100), ts(101), ts(102), ts(110), ts(110), ts(111)];
        let bytes = encode_times(&times);
        assert_eq!(decode_times(&bytes).unwrap(), times);
    }

    #[test]
    fn test_time_axis_regular_cadence_collapses() {
        let times: Vec<_> = (0..1000).map(|i| ts(1_700_000_000 + i * 60)).collect();
        let bytes = encode_times(&times);
        // One absolute timestamp plus a single (run, delta) pair.
        assert!(bytes.len() < 24, "encoded {} bytes", bytes.len());
        assert_eq!(decode_times(&bytes).unwrap(), times);
    }

    #[test]
    fn test_empty_time_axis() {
        let bytes = encode_times(&[]);
        assert!(decode_times(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_sample_payload_round_trip_with_gaps() {
        let mut timeline = MetricTimeline::new();
        timeline.append(SampleValue::Int(42));
        timeline.append_missing();
        timeline.append_missing();
        timeline.append(SampleValue::Float(1.5));
        timeline.append(SampleValue::Tag("degraded".to_string()));
        timeline.append(SampleValue::Int(-7));

        let bytes = encode_samples(timeline.tokens());
        let decoded = decode_samples(&bytes, timeline.sample_count()).unwrap();
        assert_eq!(decoded, timeline.expand());
    }

    #[test]
    fn test_sample_payload_long_run() {
        let mut timeline = MetricTimeline::new();
        for _ in 0..700 {
            timeline.append(SampleValue::Int(5));
        }

        let bytes = encode_samples(timeline.tokens());
        let decoded = decode_samples(&bytes, 700).unwrap();
        assert_eq!(decoded.len(), 700);
        assert!(decoded.iter().all(|v| *v == SampleValue::Int(5)));
    }

    #[test]
    fn test_decode_count_mismatch_is_error() {
        let mut timeline = MetricTimeline::new();
        timeline.append(SampleValue::Int(1));
        let bytes = encode_samples(timeline.tokens());
        assert!(decode_samples(&bytes, 2).is_err());
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let mut timeline = MetricTimeline::new();
        timeline.append(SampleValue::Tag("abcdef".to_string()));
        let bytes = encode_samples(timeline.tokens());
        assert!(decode_samples(&bytes[..bytes.len() - 2], 1).is_err());
    }

    #[test]
    fn test_huge_declared_string_length_is_error() {
        // A string whose declared length decodes to usize::MAX must fail
        // cleanly instead of wrapping the cursor offset.
        let mut bytes = vec![TAG_STRING];
        bytes.extend([0xff; 9]);
        bytes.push(0x01); // varint u64::MAX
        assert!(decode_samples(&bytes, 1).is_err());
    }

    #[test]
    fn test_compress_sample_narrows_integral_floats() {
        assert_eq!(compress_sample(SampleValue::Float(12.0)), SampleValue::Int(12));
        assert_eq!(
            compress_sample(SampleValue::Float(12.5)),
            SampleValue::Float(12.5)
        );
        assert_eq!(compress_sample(SampleValue::Int(3)), SampleValue::Int(3));
        assert_eq!(
            compress_sample(SampleValue::Float(f64::NAN)).is_missing(),
            false
        );
    }

    #[test]
    fn test_negative_deltas_round_trip() {
        // Equal timestamps produce zero deltas; the axis also supports
        // out-of-range-free negative arithmetic on the absolute value.
        let times = vec![ts(500), ts(500), ts(500), ts(501)];
        let bytes = encode_times(&times);
        assert_eq!(decode_times(&bytes).unwrap(), times);
    }
}
